use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub text: String,
    pub is_user: bool,
    pub timestamp: i64,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub is_initial: bool,
}

#[derive(Debug, Deserialize)]
pub struct BidBody {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscriptionBody {
    #[serde(default)]
    pub subscription: Value,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPushSubscription {
    pub subscription: Value,
    pub stored_at: i64,
}

/// Subset of a Telegram `Update` the webhook cares about. Everything else in
/// the payload is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct TelegramUpdate {
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TelegramMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<TelegramQuotedMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TelegramQuotedMessage {
    #[serde(default)]
    pub text: Option<String>,
}
