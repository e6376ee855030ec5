use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::{Channel, NotificationTask};

/// POSTs each alert, snapshot included, as JSON to a fixed URL.
pub struct WebhookChannel {
    url: String,
    agent: ureq::Agent,
}

impl WebhookChannel {
    pub fn new(url: String, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { url, agent }
    }
}

impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn init(&mut self) -> Result<()> {
        let parsed =
            url::Url::parse(&self.url).with_context(|| format!("invalid webhook url {}", self.url))?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(anyhow!("webhook url must be http(s), got {other}")),
        }
    }

    fn send(&mut self, task: &NotificationTask) -> Result<()> {
        let payload = serde_json::to_string(&task.to_json_with_snapshot())?;
        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&payload)
            .map_err(|e| anyhow!("POST {} failed: {}", self.url, e))?;
        log::debug!("webhook answered {}", response.status());
        Ok(())
    }
}
