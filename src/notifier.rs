// =============================================================================
// Notifier — lifecycle event delivery to Telegram (log-only fallback)
// =============================================================================
//
// Notification failures never propagate: a dead Telegram bot must not stall a
// liquidation. When credentials are absent the notifier degrades to
// structured log lines only.
// =============================================================================

use tracing::{debug, info, warn};

use crate::types::LifecycleEvent;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Sends strategy lifecycle events to the operator.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    telegram: Option<TelegramTarget>,
}

#[derive(Clone)]
struct TelegramTarget {
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`. Missing
    /// credentials are not an error; events are then logged only.
    pub fn from_env() -> Self {
        let telegram = match (
            std::env::var("TELEGRAM_BOT_TOKEN"),
            std::env::var("TELEGRAM_CHAT_ID"),
        ) {
            (Ok(bot_token), Ok(chat_id)) if !bot_token.is_empty() && !chat_id.is_empty() => {
                info!("telegram notifications enabled");
                Some(TelegramTarget { bot_token, chat_id })
            }
            _ => {
                info!("telegram credentials not set — notifications go to logs only");
                None
            }
        };

        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("failed to build reqwest client"),
            telegram,
        }
    }

    /// Log-only notifier for tests.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            telegram: None,
        }
    }

    /// Deliver one lifecycle event. Never returns an error.
    pub async fn notify(&self, event: &LifecycleEvent) {
        let text = event.render();
        info!(
            strategy_id = %event.strategy_id,
            symbol = %event.symbol,
            event = ?event.event,
            "{text}"
        );

        let Some(target) = &self.telegram else {
            return;
        };

        let url = format!("{TELEGRAM_API}/bot{}/sendMessage", target.bot_token);
        let payload = serde_json::json!({
            "chat_id": target.chat_id,
            "text": text,
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(strategy_id = %event.strategy_id, "telegram notification sent");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram rejected notification");
            }
            Err(e) => {
                warn!(error = %e, "telegram notification failed");
            }
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("telegram_enabled", &self.telegram.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, LifecycleEvent};

    #[tokio::test]
    async fn notify_without_credentials_is_a_noop() {
        let notifier = Notifier::disabled();
        let event = LifecycleEvent {
            strategy_id: "NEWUSDT-1".into(),
            symbol: "NEWUSDT".into(),
            event: EventType::Opened,
            quantity: 100.0,
            price: 1.0,
            reason: None,
        };
        // Must not panic or hang.
        notifier.notify(&event).await;
    }
}
