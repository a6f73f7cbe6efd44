//! Notification channels.
//!
//! Each channel is an external sink behind a uniform async interface.
//! Implementations hide transport details; timeout, retry and circuit
//! policy belong to the dispatcher, never to a channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use super::types::AlertEvent;

#[async_trait]
pub trait NotificationChannel: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Delivers one alert. Errors are normalized by the dispatcher into
    /// delivery records; implementations just fail honestly.
    async fn send(&self, event: &AlertEvent) -> anyhow::Result<()>;
}

/// In-process broadcast to live subscribers (UI, tests).
///
/// Publication succeeds even with zero subscribers; the engine's obligation
/// ends at publishing with bounded latency, not at managing consumers.
pub struct BroadcastChannel {
    tx: broadcast::Sender<AlertEvent>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationChannel for BroadcastChannel {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn send(&self, event: &AlertEvent) -> anyhow::Result<()> {
        // An Err here only means no live subscribers.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Audible cue: BEL to stdout.
pub struct BellChannel;

#[async_trait]
impl NotificationChannel for BellChannel {
    fn name(&self) -> &str {
        "bell"
    }

    async fn send(&self, _event: &AlertEvent) -> anyhow::Result<()> {
        let mut out = tokio::io::stdout();
        out.write_all(b"\x07").await?;
        out.flush().await?;
        Ok(())
    }
}

/// Chat-webhook delivery via HTTP POST.
pub struct WebhookChannel {
    http: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self { http, url })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &AlertEvent) -> anyhow::Result<()> {
        let fired_at = chrono::DateTime::from_timestamp_millis(event.fired_at_ms as i64)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();

        let body = serde_json::json!({
            "text": format!(
                "[{}] {}: {} (observed {:.4})",
                event.symbol, event.rule_name, event.condition, event.observed
            ),
            "event_id": event.event_id,
            "rule_id": event.rule_id,
            "fired_at": fired_at,
        });

        self.http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn mk_event() -> AlertEvent {
        AlertEvent {
            event_id: Uuid::new_v4(),
            rule_id: Uuid::new_v4(),
            symbol: "ES".into(),
            rule_name: "breakout".into(),
            observed: 4501.0,
            threshold: Some(4500.0),
            condition: "price above 4500".into(),
            tick_ts_ms: 1_000,
            fired_at_ms: 1_700_000_000_000,
            eval_latency_us: 120,
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let channel = BroadcastChannel::new(8);
        let mut rx = channel.subscribe();

        channel.send(&mk_event()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.symbol, "ES");
    }

    #[tokio::test]
    async fn broadcast_succeeds_without_subscribers() {
        let channel = BroadcastChannel::new(8);
        assert!(channel.send(&mk_event()).await.is_ok());
    }
}
