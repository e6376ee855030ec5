use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};

use super::{Channel, NotificationTask};

/// Publishes alerts as JSON with QoS 1.
pub struct MqttChannel {
    broker: String,
    port: u16,
    topic: String,
    client_id: String,
    runtime: Option<MqttRuntime>,
}

/// Client plus the thread that drives its event loop.
struct MqttRuntime {
    client: Client,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection) -> Self {
        let handle = std::thread::Builder::new()
            .name("notify-mqtt".to_string())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                        Err(e) => {
                            log::warn!("MQTT connection error: {}", e);
                            break;
                        }
                    }
                }
            })
            .ok();
        Self {
            client,
            connection_handle: handle,
        }
    }

    fn disconnect(mut self) {
        if let Err(e) = self.client.disconnect() {
            log::debug!("MQTT disconnect: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

impl MqttChannel {
    pub fn new(broker: String, port: u16, topic: String, client_id: Option<String>) -> Self {
        let client_id =
            client_id.unwrap_or_else(|| format!("watchpost-{:08x}", rand::random::<u32>()));
        Self {
            broker,
            port,
            topic,
            client_id,
            runtime: None,
        }
    }
}

impl Channel for MqttChannel {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn init(&mut self) -> Result<()> {
        if self.topic.trim().is_empty() || self.topic.contains(['+', '#']) {
            return Err(anyhow!("invalid mqtt publish topic '{}'", self.topic));
        }
        let mut options = MqttOptions::new(self.client_id.clone(), self.broker.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        let (client, connection) = Client::new(options, 10);
        self.runtime = Some(MqttRuntime::new(client, connection));
        log::info!(
            "MQTT channel publishing to {}:{} topic {}",
            self.broker,
            self.port,
            self.topic
        );
        Ok(())
    }

    fn send(&mut self, task: &NotificationTask) -> Result<()> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("mqtt channel is not initialised"))?;
        let payload = serde_json::to_vec(&task.to_json())?;
        let topic = format!("{}/{}", self.topic, task.camera().name);
        runtime
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.disconnect();
        }
    }
}
