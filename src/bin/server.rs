use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use ucp_gateway::{
    collaborators::{demo_catalog, FlatRateShipping, FlatTax, InMemoryOrders},
    config::AppConfig,
    crypto::CryptoService,
    orchestrator::{
        CompleteSessionRequest, CreateSessionRequest, ProtocolService, RegisterWebhookRequest,
        RequestContext, UpdateSessionRequest,
    },
    store::SessionStore,
    webhook::{WebhookDispatcher, WebhookRegistry},
    UcpError,
};

#[derive(Parser)]
#[command(name = "ucp-server")]
#[command(about = "UCP gateway server for agentic checkout")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(short, long)]
    database_url: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    service: Arc<ProtocolService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load_with_env_overrides(&args.config)?;
    if let Some(database_url) = args.database_url {
        config.database.url = database_url;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let store = SessionStore::new(&config.database.url, config.protocol.consistency).await?;
    let crypto = Arc::new(CryptoService::from_config(
        &config.trust,
        config.protocol.require_signature,
    )?);

    let registry = Arc::new(WebhookRegistry::new());
    let dispatcher = Arc::new(WebhookDispatcher::new(
        registry.clone(),
        crypto.clone(),
        Duration::from_secs(config.webhooks.delivery_timeout_seconds),
        config.protocol.debug,
    ));

    let service = Arc::new(ProtocolService::new(
        config.clone(),
        store.clone(),
        crypto,
        Arc::new(demo_catalog()),
        Arc::new(FlatRateShipping::default()),
        Arc::new(FlatTax::disabled()),
        Arc::new(InMemoryOrders::new("https://shop.example.com")),
        registry,
        dispatcher,
    ));

    // Janitor: purge expired sessions every 10 minutes.
    let janitor_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            match janitor_store.cleanup_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "purged expired checkout sessions"),
                Err(err) => tracing::warn!("session cleanup failed: {err}"),
            }
        }
    });

    let app = Router::new()
        .route("/ucp/v1/checkout-sessions", post(create_session))
        .route("/ucp/v1/checkout-sessions/:id", get(get_session))
        .route("/ucp/v1/checkout-sessions/:id", put(update_session))
        .route("/ucp/v1/checkout-sessions/:id/complete", post(complete_session))
        .route("/ucp/v1/checkout-sessions/:id/cancel", post(cancel_session))
        .route("/ucp/v1/webhooks/register", post(register_webhook))
        .route("/ucp/v1/orders/:id", get(get_order))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { service });

    let address = config.server_address();
    let listener = TcpListener::bind(&address).await?;
    tracing::info!("UCP gateway listening on {address}");

    axum::serve(listener, app).await?;

    Ok(())
}

fn context_from(headers: &HeaderMap, body: &[u8]) -> RequestContext {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };

    RequestContext {
        agent_header: header_value("UCP-Agent"),
        signature_header: header_value("Request-Signature"),
        body: body.to_vec(),
    }
}

fn error_response(err: UcpError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let body = match &err {
        UcpError::Checkout(messages) => serde_json::json!({
            "status": "requires_escalation",
            "messages": messages,
        }),
        _ => serde_json::json!({
            "code": err.code(),
            "message": err.to_string(),
        }),
    };

    (status, Json(body)).into_response()
}

fn bad_json(err: serde_json::Error) -> Response {
    error_response(UcpError::Validation(format!("Invalid request body: {err}")))
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = context_from(&headers, &body);
    let request: CreateSessionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return bad_json(err),
    };

    match state.service.create_session(&ctx, request).await {
        Ok(response) => {
            let location = format!("/ucp/v1/checkout-sessions/{}", response.id);
            (
                StatusCode::CREATED,
                [(header::LOCATION, location)],
                Json(response),
            )
                .into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let ctx = context_from(&headers, &[]);

    match state.service.get_session(&ctx, &id).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = context_from(&headers, &body);
    let request: UpdateSessionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return bad_json(err),
    };

    match state.service.update_session(&ctx, &id, request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

async fn complete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = context_from(&headers, &body);
    let request: CompleteSessionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return bad_json(err),
    };

    match state.service.complete_session(&ctx, &id, request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let ctx = context_from(&headers, &[]);

    match state.service.cancel_session(&ctx, &id).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

async fn register_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = context_from(&headers, &body);
    let request: RegisterWebhookRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return bad_json(err),
    };

    match state.service.register_webhook(&ctx, request).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let ctx = context_from(&headers, &[]);

    match state.service.get_order(&ctx, &id).await {
        Ok(order) => Json(order).into_response(),
        Err(err) => error_response(err),
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
