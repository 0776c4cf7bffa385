use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// A notification posted to every configured webhook URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    pub category: &'static str,
    pub params: Vec<Value>,
}

impl WebhookEvent {
    pub fn chain_tip(height: u32, hash: &str) -> Self {
        Self {
            category: "ChainTip",
            params: vec![json!(height), json!(hash)],
        }
    }
}

/// Fire-and-forget JSON POSTs. Failures are logged, never propagated.
#[derive(Clone)]
pub struct WebhookSender {
    urls: Vec<String>,
    agent: ureq::Agent,
}

impl WebhookSender {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            agent: ureq::AgentBuilder::new().timeout(WEBHOOK_TIMEOUT).build(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Blocking; call from the blocking pool. Returns how many posts succeeded.
    pub fn send(&self, event: &WebhookEvent) -> usize {
        let mut delivered = 0;
        for url in &self.urls {
            match self.agent.post(url).send_json(event) {
                Ok(_) => delivered += 1,
                Err(err) => {
                    tracing::warn!(url = %url, category = event.category, error = %err, "webhook delivery failed")
                }
            }
        }
        delivered
    }
}
