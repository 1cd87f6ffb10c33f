use crate::{Result, UcpError, PROTOCOL_VERSION};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol envelope included in every session and order response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UcpEnvelope {
    pub version: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: String,
}

impl UcpEnvelope {
    pub fn checkout() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            capabilities: vec![
                Capability {
                    name: "dev.ucp.shopping.checkout".to_string(),
                    version: PROTOCOL_VERSION.to_string(),
                },
                Capability {
                    name: "dev.ucp.shopping.fulfillment".to_string(),
                    version: PROTOCOL_VERSION.to_string(),
                },
            ],
        }
    }

    pub fn order() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            capabilities: vec![Capability {
                name: "dev.ucp.shopping.order".to_string(),
                version: PROTOCOL_VERSION.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Incomplete,
    ReadyForComplete,
    Processing,
    Complete,
    RequiresEscalation,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Incomplete => "incomplete",
            SessionStatus::ReadyForComplete => "ready_for_complete",
            SessionStatus::Processing => "processing",
            SessionStatus::Complete => "complete",
            SessionStatus::RequiresEscalation => "requires_escalation",
            SessionStatus::Expired => "expired",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "incomplete" => Ok(SessionStatus::Incomplete),
            "ready_for_complete" => Ok(SessionStatus::ReadyForComplete),
            "processing" => Ok(SessionStatus::Processing),
            "complete" => Ok(SessionStatus::Complete),
            "requires_escalation" => Ok(SessionStatus::RequiresEscalation),
            "expired" => Ok(SessionStatus::Expired),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(UcpError::Validation(format!("Invalid session status '{value}'"))),
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TotalType {
    Subtotal,
    Shipping,
    Tax,
    Discount,
    Total,
}

/// One entry of a totals list. Amounts are integers in the currency's
/// minor unit; consumers look entries up by type, never by position alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Total {
    #[serde(rename = "type")]
    pub kind: TotalType,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    RequiresBuyerInput,
}

/// Structured diagnostic surfaced to the calling agent. Messages are
/// transient: recomputed on every request, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

impl Message {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Info,
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Warning,
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Info,
        }
    }

    pub fn info(code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Info,
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Info,
        }
    }

    pub fn requires_buyer_input(mut self) -> Self {
        self.severity = Severity::RequiresBuyerInput;
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Buyer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_country: Option<String>,
}

impl Destination {
    pub fn country(&self) -> &str {
        self.address_country.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingOption {
    pub id: String,
    pub title: String,
    pub totals: Vec<Total>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionGroup {
    pub id: String,
    #[serde(default)]
    pub line_item_ids: Vec<String>,
    #[serde(default)]
    pub options: Vec<ShippingOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_option_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentMethod {
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub groups: Vec<OptionGroup>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fulfillment {
    #[serde(default)]
    pub methods: Vec<FulfillmentMethod>,
}

impl Fulfillment {
    /// First declared destination across all methods, if any.
    pub fn destination(&self) -> Option<&Destination> {
        self.methods.iter().find_map(|m| m.destinations.first())
    }

    pub fn has_selected_option(&self) -> bool {
        self.methods.iter().any(|m| {
            m.groups
                .iter()
                .any(|g| g.selected_option_id.as_deref().is_some_and(|s| !s.is_empty()))
        })
    }
}

/// Resolved product snapshot embedded in a line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: String,
    pub title: String,
    pub price: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub item: ItemSnapshot,
    pub quantity: u32,
    pub totals: Vec<Total>,
    #[serde(default)]
    pub needs_shipping: bool,
}

impl LineItem {
    pub fn line_subtotal(&self) -> i64 {
        self.item.price * i64::from(self.quantity)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentData {
    #[serde(default)]
    pub handler_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_address: Option<Destination>,
}

/// The mutable, expiring unit of negotiation between an agent and the
/// merchant before an order exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub status: SessionStatus,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub buyer: Option<Buyer>,
    pub fulfillment: Option<Fulfillment>,
    pub totals: Vec<Total>,
    pub payment: Option<PaymentData>,
    pub platform_profile: Option<String>,
    pub order_reference: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn new(currency: &str, timeout_minutes: u32) -> Self {
        let now = Utc::now();
        Self {
            id: format!("chk_{}", Uuid::new_v4()),
            status: SessionStatus::Incomplete,
            currency: currency.to_uppercase(),
            line_items: vec![],
            buyer: None,
            fulfillment: None,
            totals: vec![],
            payment: None,
            platform_profile: None,
            order_reference: None,
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::minutes(i64::from(timeout_minutes)),
        }
    }

    /// Slides the expiry window forward; called before every save.
    pub fn touch(&mut self, timeout_minutes: u32) {
        let now = Utc::now();
        self.updated_at = now;
        self.expires_at = now + Duration::minutes(i64::from(timeout_minutes));
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn set_currency(&mut self, currency: &str) {
        self.currency = currency.to_uppercase();
    }

    /// Amount for one totals entry, 0 when absent.
    pub fn total(&self, kind: TotalType) -> i64 {
        self.totals.iter().find(|t| t.kind == kind).map_or(0, |t| t.amount)
    }

    pub fn needs_shipping(&self) -> bool {
        self.line_items.iter().any(|item| item.needs_shipping)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

/// Summary of a materialized order, embedded in session responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: String,
    pub order_number: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentExpectation {
    pub id: String,
    pub method_type: String,
    pub destination: Destination,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFulfillment {
    #[serde(default)]
    pub expectations: Vec<FulfillmentExpectation>,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjustment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub status: String,
    pub amount: i64,
    pub description: String,
}

/// Full order representation returned from the order collaborator and
/// carried in webhook payloads. `status` uses the protocol vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub ucp: UcpEnvelope,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_id: Option<String>,
    pub order_number: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub line_items: Vec<LineItem>,
    pub totals: Vec<Total>,
    pub fulfillment: OrderFulfillment,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adjustments: Vec<Adjustment>,
}

impl OrderSnapshot {
    pub fn summary(&self) -> OrderSummary {
        OrderSummary {
            id: self.id.clone(),
            order_number: self.order_number.clone(),
            status: self.status.clone(),
            permalink_url: self.permalink_url.clone(),
            created_at: self.created_at,
        }
    }
}
