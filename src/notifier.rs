use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::TelegramConfig;

/// Fire-and-forget operator notifications. Messages are queued to a
/// background task; callers never wait on the network.
#[derive(Clone)]
pub struct Notifier {
    env: String,
    sender: Option<mpsc::UnboundedSender<String>>,
}

impl Notifier {
    pub fn new(env: String, config: TelegramConfig) -> Self {
        if !config.enabled || config.key.is_empty() || config.chat_ids.is_empty() {
            info!(target: "server_log", "telegram notifications disabled");
            return Notifier { env, sender: None };
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let url = format!("https://api.telegram.org/bot{}/sendMessage", config.key);
            while let Some(text) = receiver.recv().await {
                for chat_id in config.chat_ids.iter() {
                    let body = json!({ "chat_id": chat_id, "text": text });
                    match client.post(&url).json(&body).send().await {
                        Ok(resp) if !resp.status().is_success() => {
                            error!(target: "server_log", "telegram returned {}", resp.status());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(target: "server_log", "telegram send failed: {:?}", e);
                        }
                    }
                }
            }
        });

        Notifier {
            env,
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        Notifier {
            env: String::new(),
            sender: None,
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.send(format!("[{}] {}", self.env, message.as_ref()));
    }

    pub fn alert(&self, message: impl AsRef<str>) {
        self.send(format!("[{}] ALERT: {}", self.env, message.as_ref()));
    }

    fn send(&self, text: String) {
        if let Some(sender) = &self.sender {
            if sender.send(text).is_err() {
                error!(target: "server_log", "notifier task is gone");
            }
        }
    }
}
