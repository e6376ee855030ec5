use anyhow::Result;

use super::{Channel, NotificationTask};

/// Writes alerts to the process log. Always available, needs no credentials.
#[derive(Debug, Default)]
pub struct LogChannel {
    sent: u64,
}

impl LogChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&mut self, task: &NotificationTask) -> Result<()> {
        self.sent += 1;
        log::warn!(
            "[{}] alert {:016x}: {}",
            task.title(),
            task.alert_id(),
            task.body().replace('\n', " | ")
        );
        Ok(())
    }

    fn close(&mut self) {
        log::debug!("log channel closed after {} alerts", self.sent);
    }
}
