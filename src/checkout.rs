//! Pure computation over a checkout session: line-item resolution, totals,
//! shipping options, and status derivation.
//!
//! All monetary amounts are integers in the currency's minor unit. A
//! decimal price is converted exactly once, at resolution time; sums are
//! never re-rounded.

use crate::{
    collaborators::{Catalog, Shipping, Tax},
    model::{
        Destination, Fulfillment, ItemSnapshot, LineItem, Message, SessionStatus, ShippingOption,
        Total, TotalType,
    },
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex is valid"));

/// Raw line-item spec as submitted by the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct LineItemSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub item: Option<ItemRef>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemRef {
    pub id: String,
}

fn default_quantity() -> u32 {
    1
}

/// Converts a decimal major-unit amount to integer minor units,
/// rounding half away from zero.
pub fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub struct CheckoutEngine {
    catalog: Arc<dyn Catalog>,
    shipping: Arc<dyn Shipping>,
    tax: Arc<dyn Tax>,
    base_destination: Destination,
    messages: Vec<Message>,
}

impl CheckoutEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        shipping: Arc<dyn Shipping>,
        tax: Arc<dyn Tax>,
        base_destination: Destination,
    ) -> Self {
        Self { catalog, shipping, tax, base_destination, messages: vec![] }
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(Message::is_error)
    }

    /// Resolves raw specs against the catalog. Unresolvable, unpurchasable
    /// or out-of-stock items are dropped with an error message; quantities
    /// beyond available stock are clamped with a warning.
    pub async fn process_line_items(&mut self, specs: &[LineItemSpec]) -> Vec<LineItem> {
        let mut processed = Vec::new();

        for (index, spec) in specs.iter().enumerate() {
            let Some(identifier) = spec.item.as_ref().map(|i| i.id.as_str()) else {
                self.add_message(Message::error(
                    "invalid_item",
                    format!("Line item {index} is missing product ID"),
                ));
                continue;
            };

            if spec.quantity == 0 {
                self.add_message(Message::error(
                    "invalid_quantity",
                    format!("Line item '{identifier}' has a quantity of 0"),
                ));
                continue;
            }

            let Some(product) = self.catalog.resolve_product(identifier).await else {
                self.add_message(Message::error(
                    "product_not_found",
                    format!("Product '{identifier}' not found"),
                ));
                continue;
            };

            if !product.purchasable {
                self.add_message(Message::error(
                    "product_not_purchasable",
                    format!("Product '{identifier}' is not available for purchase"),
                ));
                continue;
            }

            if !product.in_stock {
                self.add_message(Message::error(
                    "out_of_stock",
                    format!("Product '{identifier}' is out of stock"),
                ));
                continue;
            }

            let mut quantity = spec.quantity;
            if product.manages_stock {
                if let Some(stock) = product.stock_quantity {
                    if stock < quantity {
                        self.add_message(Message::warning(
                            "insufficient_stock",
                            format!("Only {stock} units available for '{identifier}'"),
                        ));
                        quantity = stock;
                    }
                }
            }

            let line_id = spec
                .id
                .clone()
                .unwrap_or_else(|| format!("li_{}", index + 1));
            let price = to_minor_units(product.price);

            processed.push(LineItem {
                id: line_id,
                item: ItemSnapshot {
                    id: product.id.clone(),
                    title: product.title.clone(),
                    price,
                    image_url: product.image_url.clone(),
                    product_url: product.permalink.clone(),
                    sku: product.sku.clone(),
                },
                quantity,
                totals: vec![Total {
                    kind: TotalType::Subtotal,
                    amount: price * i64::from(quantity),
                }],
                needs_shipping: product.needs_shipping,
            });
        }

        processed
    }

    /// Recomputes the totals 5-tuple: subtotal, shipping, tax, discount,
    /// total, always in that order.
    pub async fn calculate_totals(
        &self,
        line_items: &[LineItem],
        fulfillment: Option<&Fulfillment>,
    ) -> Vec<Total> {
        let subtotal: i64 = line_items.iter().map(LineItem::line_subtotal).sum();
        let shipping = selected_shipping_amount(fulfillment);
        let tax = self.calculate_tax(subtotal, fulfillment).await;
        let discount = 0;
        let total = subtotal + shipping + tax - discount;

        vec![
            Total { kind: TotalType::Subtotal, amount: subtotal },
            Total { kind: TotalType::Shipping, amount: shipping },
            Total { kind: TotalType::Tax, amount: tax },
            Total { kind: TotalType::Discount, amount: discount },
            Total { kind: TotalType::Total, amount: total },
        ]
    }

    /// Tax on the decimal subtotal against the shipping destination,
    /// falling back to the store's base address. Rounded to minor units
    /// exactly once.
    async fn calculate_tax(&self, subtotal: i64, fulfillment: Option<&Fulfillment>) -> i64 {
        if !self.tax.tax_enabled() {
            return 0;
        }

        let destination = fulfillment
            .and_then(Fulfillment::destination)
            .cloned()
            .unwrap_or_else(|| self.base_destination.clone());

        let subtotal_decimal = subtotal as f64 / 100.0;
        let tax = self.tax.compute_tax(subtotal_decimal, &destination).await;
        to_minor_units(tax)
    }

    /// Rates the current items against a destination. Empty destination or
    /// empty items yield an empty result, not an error.
    pub async fn shipping_options(
        &self,
        destination: &Destination,
        line_items: &[LineItem],
    ) -> Vec<ShippingOption> {
        if destination.country().is_empty() || line_items.is_empty() {
            return vec![];
        }

        self.shipping
            .rate_destination(destination, line_items)
            .await
            .into_iter()
            .map(|rate| ShippingOption {
                id: rate.id,
                title: rate.title,
                totals: vec![Total { kind: TotalType::Total, amount: to_minor_units(rate.amount) }],
            })
            .collect()
    }

    /// Derives the session status: incomplete without items; physical
    /// items additionally require a destination country and a selected
    /// shipping option.
    pub fn determine_status(
        &self,
        line_items: &[LineItem],
        fulfillment: Option<&Fulfillment>,
    ) -> SessionStatus {
        if line_items.is_empty() {
            return SessionStatus::Incomplete;
        }

        let needs_shipping = line_items.iter().any(|item| item.needs_shipping);
        if needs_shipping {
            let has_country = fulfillment
                .and_then(Fulfillment::destination)
                .is_some_and(|d| !d.country().is_empty());
            if !has_country {
                return SessionStatus::Incomplete;
            }

            if !fulfillment.is_some_and(Fulfillment::has_selected_option) {
                return SessionStatus::Incomplete;
            }
        }

        SessionStatus::ReadyForComplete
    }
}

/// Amount of the selected option across all fulfillment groups.
fn selected_shipping_amount(fulfillment: Option<&Fulfillment>) -> i64 {
    let Some(fulfillment) = fulfillment else {
        return 0;
    };

    let mut shipping = 0;
    for method in &fulfillment.methods {
        for group in &method.groups {
            let Some(selected) = group.selected_option_id.as_deref() else {
                continue;
            };
            if let Some(option) = group.options.iter().find(|o| o.id == selected) {
                shipping += option.totals.first().map_or(0, |t| t.amount);
            }
        }
    }
    shipping
}

/// Validates buyer contact fields; failures require buyer input.
pub fn validate_buyer(buyer: &crate::model::Buyer) -> Vec<Message> {
    let mut messages = Vec::new();

    if let Some(email) = buyer.email.as_deref() {
        if !EMAIL_RE.is_match(email) {
            messages.push(
                Message::error("invalid_email", "Invalid email address").requires_buyer_input(),
            );
        }
    }

    if let Some(phone) = buyer.phone.as_deref() {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
        if digits.len() < 10 {
            messages.push(
                Message::error("invalid_phone", "Invalid phone number").requires_buyer_input(),
            );
        }
    }

    messages
}

/// Validates submitted payment data ahead of completion.
pub fn validate_payment_data(payment: &crate::model::PaymentData) -> Vec<Message> {
    let mut messages = Vec::new();

    if payment.handler_id.is_empty() {
        messages.push(
            Message::error("missing_payment_handler", "Payment handler ID is required")
                .requires_buyer_input(),
        );
    }

    if let Some(billing) = &payment.billing_address {
        messages.extend(validate_address(billing));
    }

    messages
}

/// Basic address shape checks.
pub fn validate_address(address: &Destination) -> Vec<Message> {
    let mut messages = Vec::new();

    let country = address.country();
    if !country.is_empty() && !(country.len() == 2 && country.chars().all(|c| c.is_ascii_alphabetic()))
    {
        messages.push(
            Message::error("invalid_country", "Invalid country code").requires_buyer_input(),
        );
    }

    if let Some(postcode) = address.postal_code.as_deref() {
        if !postcode.is_empty() && (postcode.len() < 3 || postcode.len() > 12) {
            messages.push(
                Message::error("invalid_postal_code", "Invalid postal code format")
                    .requires_buyer_input(),
            );
        }
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{demo_catalog, FlatRateShipping, FlatTax};
    use crate::model::{Buyer, FulfillmentMethod, OptionGroup};

    fn engine_with_tax(tax: FlatTax) -> CheckoutEngine {
        CheckoutEngine::new(
            Arc::new(demo_catalog()),
            Arc::new(FlatRateShipping::default()),
            Arc::new(tax),
            Destination { address_country: Some("US".to_string()), ..Default::default() },
        )
    }

    fn engine() -> CheckoutEngine {
        engine_with_tax(FlatTax::disabled())
    }

    fn spec(id: &str, quantity: u32) -> LineItemSpec {
        LineItemSpec { id: None, item: Some(ItemRef { id: id.to_string() }), quantity }
    }

    fn shipping_fulfillment(country: Option<&str>, selected: Option<&str>) -> Fulfillment {
        Fulfillment {
            methods: vec![FulfillmentMethod {
                method_type: "shipping".to_string(),
                destinations: country
                    .map(|c| {
                        vec![Destination {
                            address_country: Some(c.to_string()),
                            ..Default::default()
                        }]
                    })
                    .unwrap_or_default(),
                groups: vec![OptionGroup {
                    id: "shipping_group_1".to_string(),
                    line_item_ids: vec![],
                    options: vec![ShippingOption {
                        id: "flat_rate".to_string(),
                        title: "Flat rate".to_string(),
                        totals: vec![Total { kind: TotalType::Total, amount: 500 }],
                    }],
                    selected_option_id: selected.map(|s| s.to_string()),
                }],
            }],
        }
    }

    #[test]
    fn test_minor_unit_conversion_rounds_half_up() {
        assert_eq!(to_minor_units(19.99), 1999);
        assert_eq!(to_minor_units(19.995), 2000);
        assert_eq!(to_minor_units(0.004), 0);
        assert_eq!(to_minor_units(0.005), 1);
    }

    #[tokio::test]
    async fn test_process_line_items_resolves_and_prices() {
        let mut engine = engine();
        let items = engine.process_line_items(&[spec("101", 2)]).await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "li_1");
        assert_eq!(items[0].item.price, 1999);
        assert_eq!(items[0].quantity, 2);
        assert_eq!(items[0].totals[0].amount, 3998);
        assert!(items[0].needs_shipping);
        assert!(engine.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_items_dropped_with_error() {
        let mut engine = engine();
        let items = engine
            .process_line_items(&[spec("missing", 1), spec("101", 1)])
            .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item.id, "101");
        assert!(engine.has_errors());
        assert_eq!(engine.messages()[0].code, "product_not_found");
    }

    #[tokio::test]
    async fn test_insufficient_stock_clamped_with_warning() {
        let mut engine = engine();
        let items = engine.process_line_items(&[spec("101", 100)]).await;

        assert_eq!(items[0].quantity, 25);
        assert!(!engine.has_errors());
        assert_eq!(engine.messages()[0].code, "insufficient_stock");
    }

    #[tokio::test]
    async fn test_missing_item_ref_is_an_error() {
        let mut engine = engine();
        let items = engine
            .process_line_items(&[LineItemSpec { id: None, item: None, quantity: 1 }])
            .await;

        assert!(items.is_empty());
        assert_eq!(engine.messages()[0].code, "invalid_item");
    }

    #[tokio::test]
    async fn test_totals_fixed_order_and_sums() {
        let mut engine = engine();
        let items = engine.process_line_items(&[spec("101", 2)]).await;

        let fulfillment = shipping_fulfillment(Some("US"), Some("flat_rate"));
        let totals = engine.calculate_totals(&items, Some(&fulfillment)).await;

        let kinds: Vec<TotalType> = totals.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TotalType::Subtotal,
                TotalType::Shipping,
                TotalType::Tax,
                TotalType::Discount,
                TotalType::Total
            ]
        );
        assert_eq!(totals[0].amount, 3998);
        assert_eq!(totals[1].amount, 500);
        assert_eq!(totals[2].amount, 0);
        assert_eq!(totals[4].amount, 4498);
    }

    #[tokio::test]
    async fn test_totals_reprocessing_is_idempotent() {
        let mut engine = engine();
        let items = engine.process_line_items(&[spec("101", 3), spec("AB-102", 2)]).await;

        let first = engine.calculate_totals(&items, None).await;
        let second = engine.calculate_totals(&items, None).await;
        assert_eq!(first, second);
        assert_eq!(first[0].amount, 3 * 1999 + 2 * 950);
    }

    #[tokio::test]
    async fn test_tax_computed_on_decimal_subtotal_rounded_once() {
        let engine = engine_with_tax(FlatTax::percent(8.25));
        let mut resolver = CheckoutEngine::new(
            Arc::new(demo_catalog()),
            Arc::new(FlatRateShipping::default()),
            Arc::new(FlatTax::disabled()),
            Destination::default(),
        );
        let items = resolver.process_line_items(&[spec("101", 2)]).await;

        let totals = engine.calculate_totals(&items, None).await;
        // 39.98 * 8.25% = 3.29835 -> 330 minor units after a single rounding.
        assert_eq!(totals[2].amount, 330);
        assert_eq!(totals[4].amount, 3998 + 330);
    }

    #[tokio::test]
    async fn test_status_derivation_branches() {
        let mut engine = engine();

        assert_eq!(engine.determine_status(&[], None), SessionStatus::Incomplete);

        let physical = engine.process_line_items(&[spec("101", 1)]).await;
        assert_eq!(engine.determine_status(&physical, None), SessionStatus::Incomplete);

        let no_selection = shipping_fulfillment(Some("US"), None);
        assert_eq!(
            engine.determine_status(&physical, Some(&no_selection)),
            SessionStatus::Incomplete
        );

        let no_country = shipping_fulfillment(None, Some("flat_rate"));
        assert_eq!(
            engine.determine_status(&physical, Some(&no_country)),
            SessionStatus::Incomplete
        );

        let ready = shipping_fulfillment(Some("US"), Some("flat_rate"));
        assert_eq!(
            engine.determine_status(&physical, Some(&ready)),
            SessionStatus::ReadyForComplete
        );

        let digital = engine.process_line_items(&[spec("AB-102", 1)]).await;
        assert_eq!(engine.determine_status(&digital, None), SessionStatus::ReadyForComplete);
    }

    #[tokio::test]
    async fn test_shipping_options_empty_inputs() {
        let mut engine = engine();
        let items = engine.process_line_items(&[spec("101", 1)]).await;
        let dest = Destination { address_country: Some("US".to_string()), ..Default::default() };

        assert!(engine.shipping_options(&Destination::default(), &items).await.is_empty());
        assert!(engine.shipping_options(&dest, &[]).await.is_empty());

        let options = engine.shipping_options(&dest, &items).await;
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].totals[0].amount, 500);
    }

    #[test]
    fn test_buyer_validation() {
        let valid = Buyer {
            email: Some("agent@example.com".to_string()),
            phone: Some("+1 555 123 4567".to_string()),
            ..Default::default()
        };
        assert!(validate_buyer(&valid).is_empty());

        let invalid = Buyer {
            email: Some("not-an-email".to_string()),
            phone: Some("123".to_string()),
            ..Default::default()
        };
        let messages = validate_buyer(&invalid);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.severity == crate::model::Severity::RequiresBuyerInput));
    }

    #[test]
    fn test_payment_data_validation() {
        let missing = crate::model::PaymentData::default();
        assert_eq!(validate_payment_data(&missing)[0].code, "missing_payment_handler");

        let bad_country = crate::model::PaymentData {
            handler_id: "card".to_string(),
            billing_address: Some(Destination {
                address_country: Some("USA".to_string()),
                ..Default::default()
            }),
        };
        assert_eq!(validate_payment_data(&bad_country)[0].code, "invalid_country");
    }
}
