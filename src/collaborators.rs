//! Trait boundary to the merchant platform.
//!
//! The engine never reaches into ambient platform state: catalog lookups,
//! shipping rating, tax computation, and order persistence are injected as
//! explicit interfaces. In-memory implementations back the demo server and
//! the test suite.

use crate::model::{
    Adjustment, CheckoutSession, Destination, FulfillmentExpectation, LineItem, Message,
    OrderFulfillment, OrderSnapshot, OrderSummary, PaymentData, Total, UcpEnvelope,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

/// Product as resolved from the merchant catalog. `price` is a decimal
/// amount in major units; conversion to minor units happens exactly once,
/// in the checkout engine.
#[derive(Debug, Clone)]
pub struct CatalogProduct {
    pub id: String,
    pub title: String,
    pub price: f64,
    pub image_url: Option<String>,
    pub permalink: Option<String>,
    pub sku: Option<String>,
    pub purchasable: bool,
    pub in_stock: bool,
    pub manages_stock: bool,
    pub stock_quantity: Option<u32>,
    pub needs_shipping: bool,
}

/// Resolves an identifier against the catalog: numeric id first, then SKU,
/// then slug; first match wins.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn resolve_product(&self, identifier: &str) -> Option<CatalogProduct>;
}

#[derive(Debug, Clone)]
pub struct ShippingRate {
    pub id: String,
    pub title: String,
    pub amount: f64,
}

#[async_trait]
pub trait Shipping: Send + Sync {
    async fn rate_destination(
        &self,
        destination: &Destination,
        items: &[LineItem],
    ) -> Vec<ShippingRate>;
}

#[async_trait]
pub trait Tax: Send + Sync {
    fn tax_enabled(&self) -> bool;

    /// Tax on the decimal subtotal for the given destination, as a decimal
    /// amount. Rounding to minor units is the engine's job.
    async fn compute_tax(&self, subtotal: f64, destination: &Destination) -> f64;
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub summary: OrderSummary,
}

/// Order persistence boundary. `create_order` is all-or-nothing from the
/// caller's point of view: a failure returns diagnostic messages and leaves
/// no partial order behind.
#[async_trait]
pub trait Orders: Send + Sync {
    async fn create_order(
        &self,
        session: &CheckoutSession,
        payment: &PaymentData,
    ) -> std::result::Result<CreatedOrder, Vec<Message>>;

    async fn mark_paid(&self, order_id: &str) -> crate::Result<()>;

    async fn get_order(&self, order_id: &str) -> Option<OrderSnapshot>;
}

/// Maps platform-internal order statuses to the protocol vocabulary.
pub fn map_order_status(status: &str) -> String {
    match status {
        "pending" => "pending_payment",
        "processing" => "confirmed",
        "on-hold" => "on_hold",
        "completed" => "delivered",
        "cancelled" => "cancelled",
        "refunded" => "refunded",
        "failed" => "failed",
        other => other,
    }
    .to_string()
}

/// Fixed product list resolved by id, SKU, then slug.
pub struct StaticCatalog {
    products: Vec<CatalogProduct>,
}

impl StaticCatalog {
    pub fn new(products: Vec<CatalogProduct>) -> Self {
        Self { products }
    }

    fn slug_of(product: &CatalogProduct) -> Option<&str> {
        product
            .permalink
            .as_deref()
            .and_then(|p| p.trim_end_matches('/').rsplit('/').next())
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn resolve_product(&self, identifier: &str) -> Option<CatalogProduct> {
        if identifier.chars().all(|c| c.is_ascii_digit()) {
            if let Some(product) = self.products.iter().find(|p| p.id == identifier) {
                return Some(product.clone());
            }
        }

        if let Some(product) = self
            .products
            .iter()
            .find(|p| p.sku.as_deref() == Some(identifier))
        {
            return Some(product.clone());
        }

        self.products
            .iter()
            .find(|p| Self::slug_of(p) == Some(identifier))
            .cloned()
    }
}

/// Single flat rate for any physical destination.
pub struct FlatRateShipping {
    pub rate_id: String,
    pub title: String,
    pub amount: f64,
}

impl Default for FlatRateShipping {
    fn default() -> Self {
        Self {
            rate_id: "flat_rate".to_string(),
            title: "Flat rate".to_string(),
            amount: 5.0,
        }
    }
}

#[async_trait]
impl Shipping for FlatRateShipping {
    async fn rate_destination(
        &self,
        destination: &Destination,
        items: &[LineItem],
    ) -> Vec<ShippingRate> {
        if destination.country().is_empty() || items.is_empty() {
            return vec![];
        }

        vec![ShippingRate {
            id: self.rate_id.clone(),
            title: self.title.clone(),
            amount: self.amount,
        }]
    }
}

/// Flat-percentage tax, or disabled entirely.
pub struct FlatTax {
    pub enabled: bool,
    pub rate_percent: f64,
}

impl FlatTax {
    pub fn disabled() -> Self {
        Self { enabled: false, rate_percent: 0.0 }
    }

    pub fn percent(rate_percent: f64) -> Self {
        Self { enabled: true, rate_percent }
    }
}

#[async_trait]
impl Tax for FlatTax {
    fn tax_enabled(&self) -> bool {
        self.enabled
    }

    async fn compute_tax(&self, subtotal: f64, _destination: &Destination) -> f64 {
        subtotal * self.rate_percent / 100.0
    }
}

struct StoredOrder {
    checkout_id: Option<String>,
    order_number: String,
    status: String,
    line_items: Vec<LineItem>,
    totals: Vec<Total>,
    destination: Option<Destination>,
    adjustments: Vec<Adjustment>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

/// Order store backing the demo server and tests. Orders live only for the
/// process lifetime.
pub struct InMemoryOrders {
    base_url: String,
    orders: Mutex<HashMap<String, StoredOrder>>,
    counter: AtomicU64,
}

impl InMemoryOrders {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            orders: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    fn snapshot(&self, id: &str, order: &StoredOrder) -> OrderSnapshot {
        let expectations = order
            .destination
            .as_ref()
            .map(|destination| {
                vec![FulfillmentExpectation {
                    id: "exp_shipping".to_string(),
                    method_type: "shipping".to_string(),
                    destination: destination.clone(),
                }]
            })
            .unwrap_or_default();

        OrderSnapshot {
            ucp: UcpEnvelope::order(),
            id: id.to_string(),
            checkout_id: order.checkout_id.clone(),
            order_number: order.order_number.clone(),
            status: map_order_status(&order.status),
            permalink_url: Some(format!("{}/orders/{}", self.base_url, order.order_number)),
            created_at: order.created_at,
            updated_at: order.updated_at,
            line_items: order.line_items.clone(),
            totals: order.totals.clone(),
            fulfillment: OrderFulfillment { expectations, events: vec![] },
            adjustments: order.adjustments.clone(),
        }
    }

    /// Internal platform status, for wiring status-change events.
    pub fn internal_status(&self, order_id: &str) -> Option<String> {
        self.orders.lock().get(order_id).map(|o| o.status.clone())
    }
}

#[async_trait]
impl Orders for InMemoryOrders {
    async fn create_order(
        &self,
        session: &CheckoutSession,
        _payment: &PaymentData,
    ) -> std::result::Result<CreatedOrder, Vec<Message>> {
        if session.line_items.is_empty() {
            return Err(vec![Message::error(
                "order_creation_failed",
                "Cannot create an order without line items",
            )]);
        }

        let number = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("order_{number}");
        let now = Utc::now();

        let destination = session
            .fulfillment
            .as_ref()
            .and_then(|f| f.destination())
            .cloned();

        let order = StoredOrder {
            checkout_id: Some(session.id.clone()),
            order_number: number.to_string(),
            status: "pending".to_string(),
            line_items: session.line_items.clone(),
            totals: session.totals.clone(),
            destination,
            adjustments: vec![],
            created_at: now,
            updated_at: now,
        };

        let summary = self.snapshot(&id, &order).summary();
        self.orders.lock().insert(id, order);

        Ok(CreatedOrder { summary })
    }

    async fn mark_paid(&self, order_id: &str) -> crate::Result<()> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| crate::UcpError::NotFound(format!("Order '{order_id}' not found")))?;
        order.status = "processing".to_string();
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Option<OrderSnapshot> {
        let orders = self.orders.lock();
        orders.get(order_id).map(|order| self.snapshot(order_id, order))
    }
}

/// Demo catalog used by the server binary.
pub fn demo_catalog() -> StaticCatalog {
    StaticCatalog::new(vec![
        CatalogProduct {
            id: "101".to_string(),
            title: "Wireless Headphones".to_string(),
            price: 19.99,
            image_url: Some("https://shop.example.com/img/headphones.jpg".to_string()),
            permalink: Some("https://shop.example.com/products/wireless-headphones".to_string()),
            sku: Some("WH-101".to_string()),
            purchasable: true,
            in_stock: true,
            manages_stock: true,
            stock_quantity: Some(25),
            needs_shipping: true,
        },
        CatalogProduct {
            id: "102".to_string(),
            title: "Audiobook Bundle".to_string(),
            price: 9.50,
            image_url: None,
            permalink: Some("https://shop.example.com/products/audiobook-bundle".to_string()),
            sku: Some("AB-102".to_string()),
            purchasable: true,
            in_stock: true,
            manages_stock: false,
            stock_quantity: None,
            needs_shipping: false,
        },
    ])
}
