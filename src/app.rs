use std::{collections::HashMap, env, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::error::Error;
use crate::push;
use crate::store::{KvStore, MemoryKv, MessageStore, PostgresKv, PushStore};
use crate::telegram::{self, TelegramClient};
use crate::types::{BidBody, ChatBody, PushSubscriptionBody, StoredMessage, TelegramUpdate};

pub struct AppState {
    pub messages: MessageStore,
    pub subscriptions: PushStore,
    pub telegram: TelegramClient,
    pub http: reqwest::Client,
    pub public_base_url: String,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn post_session() -> impl IntoResponse {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(12);
    (StatusCode::CREATED, Json(json!({ "sessionId": token })))
}

async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    if body.message.trim().is_empty()
        || body.domain.trim().is_empty()
        || body.session_id.trim().is_empty()
    {
        return Error::Validation("Missing required parameters".to_string()).into_response();
    }

    // The initial "visitor opened chat" announcement already carries the
    // correlation header in its text; everything else gets wrapped here.
    let wire_text = if body.is_initial {
        body.message.clone()
    } else {
        telegram::encode_correlation(&body.domain, &body.session_id, &body.message)
    };

    if let Err(err) = state.telegram.send_message(&wire_text, None).await {
        return err.into_response();
    }

    if body.is_initial {
        return Json(json!({ "success": true })).into_response();
    }

    let auto_reply = format!(
        "We have received your message and will get back to you shortly.\n\nYour message: {}",
        body.message
    );
    let stored = StoredMessage {
        text: auto_reply.clone(),
        is_user: false,
        timestamp: now_ms(),
        session_id: body.session_id.clone(),
    };
    if let Err(err) = state.messages.append(&body.domain, stored).await {
        return err.into_response();
    }

    Json(json!({ "success": true, "message": auto_reply })).into_response()
}

async fn post_bid(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BidBody>,
) -> impl IntoResponse {
    let amount = body.amount.unwrap_or(0.0);
    if body.domain.trim().is_empty() || amount <= 0.0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "Please enter bid amount" })),
        )
            .into_response();
    }

    let notification = format!(
        "New bid received!\n\nDomain: {}\nBid Amount: ${}\nTime: {}",
        body.domain,
        format_amount(amount),
        now_iso()
    );

    match state.telegram.send_message(&notification, Some("HTML")).await {
        Ok(_) => Json(json!({ "message": "Bid submitted successfully" })).into_response(),
        Err(err) => {
            tracing::error!(error = %err, domain = %body.domain, "bid notification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "Server error, please try again later" })),
            )
                .into_response()
        }
    }
}

fn format_amount(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let (whole, frac) = (cents / 100, cents % 100);
    let raw = whole.to_string();
    let mut grouped = String::with_capacity(raw.len() + raw.len() / 3);
    for (i, ch) in raw.chars().enumerate() {
        if i > 0 && (raw.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if frac == 0 {
        grouped
    } else {
        format!("{grouped}.{frac:02}")
    }
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let domain = params.get("domain").map(String::as_str).unwrap_or("").trim();
    if domain.is_empty() {
        return Error::Validation("Missing domain parameter".to_string()).into_response();
    }
    let session_id = params
        .get("sessionId")
        .map(String::as_str)
        .filter(|s| !s.is_empty());
    let since = params
        .get("since")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);

    match state.messages.query(domain, session_id, since).await {
        Ok(messages) => Json(json!({ "success": true, "messages": messages })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_push_subscription(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PushSubscriptionBody>,
) -> impl IntoResponse {
    if body.domain.trim().is_empty()
        || body.session_id.trim().is_empty()
        || body.subscription.is_null()
    {
        return Error::Validation("Missing subscription parameters".to_string()).into_response();
    }

    match state
        .subscriptions
        .register(&body.domain, &body.session_id, body.subscription)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn post_telegram_webhook(
    State(state): State<Arc<AppState>>,
    Json(update): Json<TelegramUpdate>,
) -> impl IntoResponse {
    let Some(message) = update.message else {
        return (StatusCode::OK, "OK");
    };
    let Some(reply_text) = message.text.filter(|t| !t.is_empty()) else {
        return (StatusCode::OK, "OK");
    };
    let Some(quoted) = message.reply_to_message.and_then(|q| q.text) else {
        tracing::debug!("webhook update is not a reply, ignoring");
        return (StatusCode::OK, "OK");
    };
    let Some((domain, session_id)) = telegram::decode_correlation(&quoted) else {
        tracing::debug!("no correlation metadata in quoted message, ignoring");
        return (StatusCode::OK, "OK");
    };

    let stored = StoredMessage {
        text: reply_text.clone(),
        is_user: false,
        timestamp: now_ms(),
        session_id: session_id.clone(),
    };
    if let Err(err) = state.messages.append(&domain, stored).await {
        // Telegram disables webhooks that keep failing, so store trouble is
        // logged and still answered 200.
        tracing::error!(error = %err, %domain, %session_id, "failed to store operator reply");
        return (StatusCode::OK, "OK");
    }

    push::dispatch(&state, &domain, &session_id, &reply_text).await;

    (StatusCode::OK, "OK")
}

async fn get_setup_webhook(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let webhook_url = format!("{}/api/telegram-webhook", state.public_base_url);
    match state.telegram.set_webhook(&webhook_url).await {
        Ok(response) => Json(json!({
            "success": true,
            "webhookUrl": webhook_url,
            "telegramResponse": response,
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/session", post(post_session))
        .route("/api/chat", post(post_chat))
        .route("/api/bid", post(post_bid))
        .route("/api/messages", get(get_messages))
        .route("/api/push-subscription", post(post_push_subscription))
        .route("/api/telegram-webhook", post(post_telegram_webhook))
        .route("/api/setup-webhook", get(get_setup_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "relay".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let public_base_url = env::var("API_PUBLIC_URL")
        .unwrap_or_else(|_| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();
    let bot_token = env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
    let chat_id = env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
    if bot_token.is_empty() || chat_id.is_empty() {
        tracing::warn!("telegram credentials not configured, outbound relay will fail");
    }
    let api_base =
        env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| telegram::DEFAULT_API_BASE.to_string());

    let kv: Arc<dyn KvStore> = match env::var("MESSAGE_STORE").as_deref() {
        Ok("memory") => Arc::new(MemoryKv::new()),
        _ => {
            let database_url = resolve_database_url();
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await
                .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("failed to run sqlx migrations");
            Arc::new(PostgresKv::new(pool))
        }
    };

    let state = Arc::new(AppState {
        messages: MessageStore::new(kv.clone()),
        subscriptions: PushStore::new(kv),
        telegram: TelegramClient::new(&api_base, &bot_token, &chat_id),
        http: reqwest::Client::new(),
        public_base_url,
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "relay server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
