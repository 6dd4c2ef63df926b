use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::types::StoredMessage;

#[derive(Clone)]
pub struct PollerConfig {
    pub base_url: String,
    pub domain: String,
    pub session_id: String,
    pub interval: Duration,
    pub max_backoff: Duration,
}

impl PollerConfig {
    pub fn new(base_url: &str, domain: &str, session_id: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            domain: domain.to_string(),
            session_id: session_id.to_string(),
            interval: Duration::from_secs(3),
            max_backoff: Duration::from_secs(30),
        }
    }
}

pub struct PollerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stops the polling loop and waits for the task to wind down.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.task.await;
    }
}

/// Spawns the widget-side polling loop: fetches messages newer than the last
/// seen timestamp, forwards them on the returned channel, and doubles the
/// wait up to `max_backoff` while the endpoint is failing. Dropping the
/// handle (or calling [`PollerHandle::stop`]) ends the loop.
pub fn spawn(config: PollerConfig) -> (PollerHandle, mpsc::UnboundedReceiver<StoredMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut since: i64 = 0;
        let mut delay = config.interval;

        loop {
            tokio::select! {
                _ = cancel_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match poll_once(&http, &config, since).await {
                Ok(messages) => {
                    delay = config.interval;
                    for message in messages {
                        if message.timestamp > since {
                            since = message.timestamp;
                        }
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, domain = %config.domain, "message poll failed");
                    delay = (delay * 2).min(config.max_backoff);
                }
            }
        }
    });

    (PollerHandle { cancel: cancel_tx, task }, rx)
}

async fn poll_once(
    http: &reqwest::Client,
    config: &PollerConfig,
    since: i64,
) -> Result<Vec<StoredMessage>, String> {
    let url = format!(
        "{}/api/messages?domain={}&sessionId={}&since={since}",
        config.base_url, config.domain, config.session_id
    );
    let response = http.get(&url).send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("poll returned status {}", response.status()));
    }
    let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
    let messages = body
        .get("messages")
        .cloned()
        .unwrap_or_else(|| serde_json::json!([]));
    serde_json::from_value(messages).map_err(|e| e.to_string())
}
