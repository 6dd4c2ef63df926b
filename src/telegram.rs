use regex::Regex;
use serde_json::{json, Value};

use crate::error::{Error, Result};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Wraps a visitor message with the labeled lines the webhook side decodes.
/// The labels travel as plain text in the operator's chat, so a visitor
/// message containing a literal label line can confuse extraction; known
/// limitation, see DESIGN.md.
pub fn encode_correlation(domain: &str, session_id: &str, text: &str) -> String {
    format!("Domain: {domain}\nSession: {session_id}\nMessage: {text}")
}

/// Recovers `(domain, session)` from the quoted text of an operator reply.
/// `None` means the update is not correlatable and must be ignored.
pub fn decode_correlation(quoted: &str) -> Option<(String, String)> {
    let Ok(domain_re) = Regex::new(r"Domain: ([^\n]+)") else {
        return None;
    };
    let Ok(session_re) = Regex::new(r"Session: ([^\n]+)") else {
        return None;
    };
    let domain = domain_re.captures(quoted)?.get(1)?.as_str().to_string();
    let session_id = session_re.captures(quoted)?.get(1)?.as_str().to_string();
    Some((domain, session_id))
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, bot_token: &str, chat_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        }
    }

    /// Sends one message to the operator chat. Exactly one outbound call;
    /// no retry, no batching.
    pub async fn send_message(&self, text: &str, parse_mode: Option<&str>) -> Result<Value> {
        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            payload["parse_mode"] = json!(mode);
        }
        self.call("sendMessage", &payload).await
    }

    pub async fn set_webhook(&self, url: &str) -> Result<Value> {
        let payload = json!({
            "url": url,
            "allowed_updates": ["message"],
        });
        self.call("setWebhook", &payload).await
    }

    async fn call(&self, method: &str, payload: &Value) -> Result<Value> {
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            return Err(Error::UpstreamDelivery(
                "telegram credentials not configured".to_string(),
            ));
        }

        let response = self
            .http
            .post(format!("{}/bot{}/{method}", self.api_base, self.bot_token))
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::UpstreamDelivery(e.to_string()))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&raw_body)
            .unwrap_or_else(|_| json!({ "raw": raw_body }));

        if status.is_success() {
            return Ok(body);
        }
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("telegram api error")
            .to_string();
        Err(Error::UpstreamDelivery(description))
    }
}
