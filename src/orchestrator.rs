//! Session lifecycle API: create, get, update, complete, cancel.
//!
//! Every operation runs behind the same permission gate (protocol enabled,
//! then whitelist, then signature) and rejects before any session
//! mutation. Collaborator failures during completion fold into the
//! session's own status rather than failing the request, so agents can
//! retry or hand off to a human.

use crate::{
    checkout::{validate_buyer, validate_payment_data, CheckoutEngine, LineItemSpec},
    collaborators::{Catalog, Orders, Shipping, Tax},
    config::{AppConfig, HandlerKind, PaymentHandlerConfig},
    crypto::CryptoService,
    model::{
        Buyer, CheckoutSession, Destination, Fulfillment, LineItem, Link, Message, OptionGroup,
        OrderSummary, PaymentData, SessionStatus, Total, UcpEnvelope,
    },
    store::SessionStore,
    webhook::{subscriber_id, WebhookDispatcher, WebhookRegistration, WebhookRegistry},
    whitelist::{is_whitelisted, profile_url_from_header},
    Result, UcpError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

/// The parts of an inbound request the permission gate inspects.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub agent_header: Option<String>,
    pub signature_header: Option<String>,
    pub body: Vec<u8>,
}

impl RequestContext {
    pub fn platform_profile(&self) -> Option<String> {
        self.agent_header
            .as_deref()
            .and_then(profile_url_from_header)
            .map(|url| url.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItemSpec>,
    #[serde(default)]
    pub buyer: Option<Buyer>,
    #[serde(default)]
    pub fulfillment: Option<Fulfillment>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub line_items: Option<Vec<LineItemSpec>>,
    #[serde(default)]
    pub buyer: Option<Buyer>,
    #[serde(default)]
    pub fulfillment: Option<Fulfillment>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteSessionRequest {
    #[serde(default)]
    pub payment_data: Option<PaymentData>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWebhookRequest {
    pub webhook_url: String,
    #[serde(default)]
    pub events: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct RegisterWebhookResponse {
    pub success: bool,
    pub webhook_id: String,
    pub events: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentHandlers {
    pub handlers: Vec<PaymentHandlerConfig>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub ucp: UcpEnvelope,
    pub id: String,
    pub status: SessionStatus,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub totals: Vec<Total>,
    pub links: Vec<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer: Option<Buyer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<Fulfillment>,
    pub payment: PaymentHandlers,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_url: Option<String>,
}

pub struct ProtocolService {
    config: AppConfig,
    store: SessionStore,
    crypto: Arc<CryptoService>,
    catalog: Arc<dyn Catalog>,
    shipping: Arc<dyn Shipping>,
    tax: Arc<dyn Tax>,
    orders: Arc<dyn Orders>,
    webhooks: Arc<WebhookRegistry>,
    dispatcher: Arc<WebhookDispatcher>,
}

impl ProtocolService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        store: SessionStore,
        crypto: Arc<CryptoService>,
        catalog: Arc<dyn Catalog>,
        shipping: Arc<dyn Shipping>,
        tax: Arc<dyn Tax>,
        orders: Arc<dyn Orders>,
        webhooks: Arc<WebhookRegistry>,
        dispatcher: Arc<WebhookDispatcher>,
    ) -> Self {
        Self { config, store, crypto, catalog, shipping, tax, orders, webhooks, dispatcher }
    }

    /// Uniform permission gate: protocol enabled, then whitelist, then
    /// signature. Each failure maps to a distinct rejection (503/403/401).
    async fn check_permissions(&self, ctx: &RequestContext) -> Result<()> {
        if !self.config.protocol.enabled {
            return Err(UcpError::ProtocolDisabled);
        }

        if self.config.protocol.whitelist_enabled
            && !is_whitelisted(
                ctx.agent_header.as_deref(),
                &self.config.protocol.whitelist_patterns,
            )
        {
            return Err(UcpError::NotAuthorized("Agent is not whitelisted".to_string()));
        }

        if self.config.protocol.require_signature
            && !self
                .crypto
                .validate_agent_signature(
                    ctx.agent_header.as_deref(),
                    ctx.signature_header.as_deref(),
                    &ctx.body,
                )
                .await
        {
            return Err(UcpError::InvalidSignature);
        }

        Ok(())
    }

    fn engine(&self) -> CheckoutEngine {
        let checkout = &self.config.checkout;
        CheckoutEngine::new(
            self.catalog.clone(),
            self.shipping.clone(),
            self.tax.clone(),
            Destination {
                address_country: Some(checkout.base_country.clone()),
                address_region: checkout.base_region.clone(),
                postal_code: checkout.base_postcode.clone(),
                ..Default::default()
            },
        )
    }

    fn timeout_minutes(&self) -> u32 {
        self.config.protocol.session_timeout_minutes
    }

    pub async fn create_session(
        &self,
        ctx: &RequestContext,
        request: CreateSessionRequest,
    ) -> Result<SessionResponse> {
        self.check_permissions(ctx).await?;

        if request.line_items.is_empty() {
            return Err(UcpError::Validation("line_items is required".to_string()));
        }

        if let Some(buyer) = &request.buyer {
            let messages = validate_buyer(buyer);
            if !messages.is_empty() {
                return Err(UcpError::Checkout(messages));
            }
        }

        let currency = request
            .currency
            .as_deref()
            .unwrap_or(&self.config.checkout.currency);
        let mut session = CheckoutSession::new(currency, self.timeout_minutes());
        session.platform_profile = ctx.platform_profile();

        let mut engine = self.engine();
        let line_items = engine.process_line_items(&request.line_items).await;

        if line_items.is_empty() && engine.has_errors() {
            return Err(UcpError::Checkout(engine.take_messages()));
        }

        session.line_items = line_items;
        session.buyer = request.buyer;
        session.fulfillment = request.fulfillment;
        session.totals = engine
            .calculate_totals(&session.line_items, session.fulfillment.as_ref())
            .await;
        session.status = engine.determine_status(&session.line_items, session.fulfillment.as_ref());

        session.touch(self.timeout_minutes());
        self.store.insert(&session).await?;

        tracing::info!(session_id = %session.id, status = session.status.as_str(), "checkout session created");
        Ok(self.build_session_response(&session, engine.take_messages()).await)
    }

    pub async fn get_session(&self, ctx: &RequestContext, session_id: &str) -> Result<SessionResponse> {
        self.check_permissions(ctx).await?;

        let mut session = self.load_session(session_id).await?;

        if session.is_expired() && !session.status.is_terminal() {
            session.status = SessionStatus::Expired;
            session.updated_at = Utc::now();
            self.store.update(&mut session).await?;
            return Err(UcpError::SessionExpired);
        }

        Ok(self.build_session_response(&session, vec![]).await)
    }

    pub async fn update_session(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        request: UpdateSessionRequest,
    ) -> Result<SessionResponse> {
        self.check_permissions(ctx).await?;

        let mut session = self.load_session(session_id).await?;

        if session.is_expired() && !session.status.is_terminal() {
            return Err(UcpError::SessionExpired);
        }

        if session.status.is_terminal() {
            return Err(UcpError::StateConflict(
                "Checkout session cannot be modified".to_string(),
            ));
        }

        if let Some(buyer) = &request.buyer {
            let messages = validate_buyer(buyer);
            if !messages.is_empty() {
                return Err(UcpError::Checkout(messages));
            }
        }

        let mut engine = self.engine();

        if let Some(specs) = &request.line_items {
            session.line_items = engine.process_line_items(specs).await;
        }

        if let Some(buyer) = request.buyer {
            session.buyer = Some(buyer);
        }

        if let Some(mut fulfillment) = request.fulfillment {
            self.refresh_shipping_groups(&engine, &mut fulfillment, &session.line_items).await;
            session.fulfillment = Some(fulfillment);
        }

        session.totals = engine
            .calculate_totals(&session.line_items, session.fulfillment.as_ref())
            .await;
        session.status = engine.determine_status(&session.line_items, session.fulfillment.as_ref());

        session.touch(self.timeout_minutes());
        self.store.update(&mut session).await?;

        Ok(self.build_session_response(&session, engine.take_messages()).await)
    }

    pub async fn complete_session(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        request: CompleteSessionRequest,
    ) -> Result<SessionResponse> {
        self.check_permissions(ctx).await?;

        let mut session = self.load_session(session_id).await?;

        if session.is_expired() && !session.status.is_terminal() {
            return Err(UcpError::SessionExpired);
        }

        if session.status == SessionStatus::Complete {
            return Err(UcpError::StateConflict(
                "Checkout session is already complete".to_string(),
            ));
        }

        let Some(payment) = request.payment_data else {
            return Err(UcpError::Validation("payment_data is required".to_string()));
        };

        let messages = validate_payment_data(&payment);
        if !messages.is_empty() {
            return Err(UcpError::Checkout(messages));
        }

        let handler_kind = self
            .config
            .payment_handler(&payment.handler_id)
            .map(|h| h.kind)
            // Handlers outside the catalog complete as a direct gateway.
            .unwrap_or(HandlerKind::Direct);

        session.payment = Some(payment.clone());

        match handler_kind {
            HandlerKind::Embedded => {
                let continue_url = format!(
                    "{}?ucp_session={}",
                    self.config.checkout.embedded_checkout_url, session.id
                );

                session.status = SessionStatus::RequiresEscalation;
                session.touch(self.timeout_minutes());
                self.store.update(&mut session).await?;

                let messages = vec![Message::info(
                    "embedded_checkout_required",
                    "Please complete checkout using the embedded checkout flow",
                )
                .requires_buyer_input()];

                let mut response = self.build_session_response(&session, messages).await;
                response.continue_url = Some(continue_url);
                Ok(response)
            }
            HandlerKind::Direct => {
                session.status = SessionStatus::Processing;
                session.touch(self.timeout_minutes());
                self.store.update(&mut session).await?;

                match self.orders.create_order(&session, &payment).await {
                    Ok(created) => {
                        let order_id = created.summary.id.clone();

                        if let Err(err) = self.orders.mark_paid(&order_id).await {
                            tracing::warn!(order_id = %order_id, "failed to mark order paid: {err}");
                        }

                        session.order_reference = Some(order_id.clone());
                        session.status = SessionStatus::Complete;
                        session.touch(self.timeout_minutes());
                        self.store.update(&mut session).await?;

                        if let Some(snapshot) = self.orders.get_order(&order_id).await {
                            self.dispatcher
                                .order_status_changed(&snapshot, "pending", "processing")
                                .await;
                        }

                        tracing::info!(session_id = %session.id, order_id = %order_id, "checkout session completed");
                        Ok(self.build_session_response(&session, vec![]).await)
                    }
                    Err(messages) => {
                        session.status = SessionStatus::RequiresEscalation;
                        session.touch(self.timeout_minutes());
                        self.store.update(&mut session).await?;

                        Ok(self.build_session_response(&session, messages).await)
                    }
                }
            }
        }
    }

    pub async fn cancel_session(
        &self,
        ctx: &RequestContext,
        session_id: &str,
    ) -> Result<SessionResponse> {
        self.check_permissions(ctx).await?;

        let mut session = self.load_session(session_id).await?;

        if session.status == SessionStatus::Complete {
            return Err(UcpError::StateConflict(
                "Completed sessions cannot be cancelled".to_string(),
            ));
        }

        session.status = SessionStatus::Cancelled;
        session.touch(self.timeout_minutes());
        self.store.update(&mut session).await?;

        Ok(self.build_session_response(&session, vec![]).await)
    }

    /// Registers (or replaces) the caller's webhook endpoint, keyed by the
    /// agent's platform profile.
    pub async fn register_webhook(
        &self,
        ctx: &RequestContext,
        request: RegisterWebhookRequest,
    ) -> Result<RegisterWebhookResponse> {
        if !self.config.protocol.enabled {
            return Err(UcpError::ProtocolDisabled);
        }

        let url = Url::parse(&request.webhook_url)
            .map_err(|_| UcpError::Validation("Invalid webhook URL".to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UcpError::Validation("Invalid webhook URL".to_string()));
        }

        let profile = ctx.platform_profile();
        let webhook_id = subscriber_id(profile.as_deref());
        let events = request
            .events
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| vec!["order.*".to_string()]);

        self.webhooks.register(
            &webhook_id,
            WebhookRegistration {
                url: request.webhook_url,
                events: events.clone(),
                registered_at: Utc::now(),
            },
        );

        Ok(RegisterWebhookResponse { success: true, webhook_id, events })
    }

    /// Returns an order previously materialized through the protocol.
    pub async fn get_order(
        &self,
        _ctx: &RequestContext,
        order_id: &str,
    ) -> Result<crate::model::OrderSnapshot> {
        if !self.config.protocol.enabled {
            return Err(UcpError::ProtocolDisabled);
        }

        let normalized = if order_id.starts_with("order_") {
            order_id.to_string()
        } else {
            format!("order_{order_id}")
        };

        let snapshot = self
            .orders
            .get_order(&normalized)
            .await
            .ok_or_else(|| UcpError::NotFound("Order not found".to_string()))?;

        if snapshot.checkout_id.is_none() {
            return Err(UcpError::NotAuthorized(
                "This order was not created via UCP".to_string(),
            ));
        }

        Ok(snapshot)
    }

    async fn load_session(&self, session_id: &str) -> Result<CheckoutSession> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| UcpError::NotFound("Checkout session not found".to_string()))
    }

    /// Re-rates shipping for any method carrying a destination, collapsing
    /// the result into a single option group and preserving the caller's
    /// selection.
    async fn refresh_shipping_groups(
        &self,
        engine: &CheckoutEngine,
        fulfillment: &mut Fulfillment,
        line_items: &[LineItem],
    ) {
        for method in &mut fulfillment.methods {
            if method.method_type != "shipping" {
                continue;
            }
            let Some(destination) = method.destinations.first() else {
                continue;
            };

            let options = engine.shipping_options(destination, line_items).await;
            if options.is_empty() {
                continue;
            }

            let selected = method
                .groups
                .first()
                .and_then(|g| g.selected_option_id.clone());
            let line_item_ids = line_items.iter().map(|item| item.id.clone()).collect();

            method.groups = vec![OptionGroup {
                id: "shipping_group_1".to_string(),
                line_item_ids,
                options,
                selected_option_id: selected,
            }];
        }
    }

    fn links(&self) -> Vec<Link> {
        let mut links = Vec::new();

        if let Some(terms) = &self.config.checkout.terms_url {
            links.push(Link { rel: "terms_of_service".to_string(), href: terms.clone() });
        }
        if let Some(privacy) = &self.config.checkout.privacy_url {
            links.push(Link { rel: "privacy_policy".to_string(), href: privacy.clone() });
        }

        links
    }

    async fn build_session_response(
        &self,
        session: &CheckoutSession,
        messages: Vec<Message>,
    ) -> SessionResponse {
        let order = match &session.order_reference {
            Some(order_id) => self
                .orders
                .get_order(order_id)
                .await
                .map(|snapshot| snapshot.summary()),
            None => None,
        };

        SessionResponse {
            ucp: UcpEnvelope::checkout(),
            id: session.id.clone(),
            status: session.status,
            currency: session.currency.clone(),
            line_items: session.line_items.clone(),
            totals: session.totals.clone(),
            links: self.links(),
            buyer: session.buyer.clone(),
            fulfillment: session.fulfillment.clone(),
            payment: PaymentHandlers {
                handlers: self.config.checkout.payment_handlers.clone(),
            },
            messages,
            order,
            continue_url: None,
        }
    }
}
