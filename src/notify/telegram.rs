use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::blocking::{multipart, Client};

use super::{Channel, NotificationTask, SNAPSHOT_CONTENT_TYPE};

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Telegram Bot API channel: `sendMessage` with the alert text, then
/// `sendPhoto` with the JPEG snapshot.
pub struct TelegramChannel {
    token: Option<String>,
    chat_id: Option<String>,
    api_base: String,
    client: Option<Client>,
}

impl TelegramChannel {
    pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
        Self::with_api_base(token, chat_id, API_BASE.to_string())
    }

    /// Point the channel at a different Bot API host (self-hosted API server).
    pub fn with_api_base(token: Option<String>, chat_id: Option<String>, api_base: String) -> Self {
        Self {
            token,
            chat_id,
            api_base,
            client: None,
        }
    }

    fn endpoint(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base.trim_end_matches('/'), token, method)
    }
}

/// The request URL carries the bot token; keep it out of the error text.
fn redact(method: &str, err: reqwest::Error) -> anyhow::Error {
    match err.status() {
        Some(status) => anyhow!("{method} returned HTTP {}", status.as_u16()),
        None => anyhow!("{method} failed: {}", err.without_url()),
    }
}

impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn init(&mut self) -> Result<()> {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        if blank(&self.token) {
            return Err(anyhow!("telegram bot token is not configured (TELEGRAM_TOKEN)"));
        }
        if blank(&self.chat_id) {
            return Err(anyhow!("telegram chat id is not configured (TELEGRAM_CHAT_ID)"));
        }
        self.client = Some(
            Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .map_err(|e| anyhow!("telegram http client: {e}"))?,
        );
        Ok(())
    }

    fn send(&mut self, task: &NotificationTask) -> Result<()> {
        let (Some(token), Some(chat_id), Some(client)) = (
            self.token.as_deref(),
            self.chat_id.as_deref(),
            self.client.as_ref(),
        ) else {
            return Err(anyhow!("telegram channel used before init"));
        };

        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": format!("{}\n\n{}", task.title(), task.body()),
        });
        client
            .post(self.endpoint(token, "sendMessage"))
            .json(&payload)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| redact("sendMessage", e))?;

        let jpeg = match task.snapshot_jpeg() {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!(
                    "telegram: alert {:016x} sent without photo: {:#}",
                    task.alert_id(),
                    err
                );
                return Ok(());
            }
        };
        let photo = multipart::Part::bytes(jpeg)
            .file_name(format!("{}-{}.jpg", task.camera().name, task.frame().seq()))
            .mime_str(SNAPSHOT_CONTENT_TYPE)?;
        let form = multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", task.camera().name.clone())
            .part("photo", photo);
        client
            .post(self.endpoint(token, "sendPhoto"))
            .multipart(form)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| redact("sendPhoto", e))?;
        Ok(())
    }
}
