//! Outbound alerts.
//!
//! Every alert goes to one named channel through a [`Notifier`]. Delivery is
//! best effort: a failed send is logged and never fails the caller. Alerts of
//! the same [`AlertKind`] are rate limited by an [`AlertThrottle`] owned by the
//! [`AlertDispatcher`].

mod webhook;

pub use webhook::WebhookNotifier;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Text sink keyed by channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()>;
}

/// Writes alerts to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
        info!(%channel, "[NOTIFY] {}", text);
        Ok(())
    }
}

/// Alert categories with independent cool-downs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    CycleError,
    /// Percent-triggered decrease found nothing to reduce
    NoDecreasePercent,
    /// Spread-gated decrease found nothing to reduce
    NoDecreaseFunding,
}

impl AlertKind {
    pub fn cooldown(self) -> Duration {
        match self {
            AlertKind::CycleError => Duration::from_secs(30),
            AlertKind::NoDecreasePercent => Duration::from_secs(60),
            AlertKind::NoDecreaseFunding => Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct KindState {
    last_sent: Option<Instant>,
    suppressed: u64,
}

/// One timestamp per alert kind.
#[derive(Debug, Default)]
pub struct AlertThrottle {
    kinds: HashMap<AlertKind, KindState>,
}

impl AlertThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an alert of `kind` may go out at `now`. On success returns the
    /// number of alerts suppressed since the last one sent.
    pub fn try_acquire_at(&mut self, kind: AlertKind, now: Instant) -> Option<u64> {
        let state = self.kinds.entry(kind).or_default();
        match state.last_sent {
            Some(last) if now.saturating_duration_since(last) < kind.cooldown() => {
                state.suppressed += 1;
                None
            }
            _ => {
                state.last_sent = Some(now);
                Some(std::mem::take(&mut state.suppressed))
            }
        }
    }

    pub fn try_acquire(&mut self, kind: AlertKind) -> Option<u64> {
        self.try_acquire_at(kind, Instant::now())
    }
}

/// Sends alerts to the configured channel, applying the throttle.
pub struct AlertDispatcher {
    notifier: Arc<dyn Notifier>,
    channel: String,
    throttle: Mutex<AlertThrottle>,
}

impl AlertDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, channel: &str) -> Self {
        Self {
            notifier,
            channel: channel.to_string(),
            throttle: Mutex::new(AlertThrottle::new()),
        }
    }

    /// Rate-limited alert. Returns whether it was sent.
    pub async fn alert(&self, kind: AlertKind, text: &str) -> bool {
        let acquired = match self.throttle.lock() {
            Ok(mut throttle) => throttle.try_acquire(kind),
            Err(_) => Some(0),
        };
        let Some(suppressed) = acquired else {
            debug!(?kind, "Alert suppressed by cool-down");
            return false;
        };

        if suppressed > 0 {
            self.send(&format!("{} ({} similar suppressed)", text, suppressed)).await;
        } else {
            self.send(text).await;
        }
        true
    }

    /// Unthrottled send, used for cycle summaries.
    pub async fn send(&self, text: &str) {
        if let Err(e) = self.notifier.send(&self.channel, text).await {
            warn!(channel = %self.channel, error = %e, "Notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_have_independent_cooldowns() {
        let mut throttle = AlertThrottle::new();
        let t0 = Instant::now();

        assert_eq!(throttle.try_acquire_at(AlertKind::CycleError, t0), Some(0));
        assert_eq!(throttle.try_acquire_at(AlertKind::NoDecreasePercent, t0), Some(0));
        assert_eq!(throttle.try_acquire_at(AlertKind::CycleError, t0 + Duration::from_secs(10)), None);
        assert_eq!(throttle.try_acquire_at(AlertKind::CycleError, t0 + Duration::from_secs(29)), None);
        assert_eq!(throttle.try_acquire_at(AlertKind::CycleError, t0 + Duration::from_secs(30)), Some(2));

        assert_eq!(throttle.try_acquire_at(AlertKind::NoDecreasePercent, t0 + Duration::from_secs(59)), None);
        assert_eq!(throttle.try_acquire_at(AlertKind::NoDecreasePercent, t0 + Duration::from_secs(60)), Some(1));
        assert_eq!(throttle.try_acquire_at(AlertKind::NoDecreaseFunding, t0 + Duration::from_secs(60)), Some(0));
        assert_eq!(throttle.try_acquire_at(AlertKind::NoDecreaseFunding, t0 + Duration::from_secs(359)), None);
    }

    #[tokio::test]
    async fn test_dispatcher_sends_once_per_cooldown() {
        let mut mock = MockNotifier::new();
        mock.expect_send()
            .withf(|channel, text| channel == "ops" && text.contains("cycle failed"))
            .times(1)
            .returning(|_, _| Ok(()));
        let dispatcher = AlertDispatcher::new(Arc::new(mock), "ops");

        assert!(dispatcher.alert(AlertKind::CycleError, "cycle failed").await);
        assert!(!dispatcher.alert(AlertKind::CycleError, "cycle failed").await);
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let mut mock = MockNotifier::new();
        mock.expect_send()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("channel down")));
        let dispatcher = AlertDispatcher::new(Arc::new(mock), "ops");

        dispatcher.send("summary").await;
    }
}
