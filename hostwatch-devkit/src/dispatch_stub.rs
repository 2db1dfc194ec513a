/*!
Mock notification dispatcher

Records every alarm the runner sends instead of calling the gateways.
Hosts can be set to fail or to hang forever to exercise the runner's
isolation between hosts.
*/

use hostwatch_kernel::notify::{DispatchError, NotificationDispatcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmChannel {
    Call,
    Sms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAlarm {
    pub host: String,
    pub channel: AlarmChannel,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Deliver,
    Fail,
    Hang,
}

/// Clones share the same log, so a test can keep one while the runner owns another.
#[derive(Clone, Default)]
pub struct MockDispatcher {
    sent: Arc<Mutex<Vec<SentAlarm>>>,
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every alarm to `host` fails from now on.
    pub fn fail_for(&self, host: &str) {
        self.behaviors.lock().insert(host.to_string(), Behavior::Fail);
    }

    /// Every alarm to `host` never completes.
    pub fn hang_for(&self, host: &str) {
        self.behaviors.lock().insert(host.to_string(), Behavior::Hang);
    }

    pub fn deliver_for(&self, host: &str) {
        self.behaviors.lock().remove(host);
    }

    /// All attempts, failed ones included, in sending order.
    pub fn sent(&self) -> Vec<SentAlarm> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, host: &str) -> Vec<SentAlarm> {
        self.sent.lock().iter().filter(|a| a.host == host).cloned().collect()
    }

    pub fn count(&self, host: &str, channel: AlarmChannel) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|a| a.host == host && a.channel == channel)
            .count()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    async fn record(&self, host: &str, channel: AlarmChannel, message: Option<&str>) -> Result<(), DispatchError> {
        let behavior = self
            .behaviors
            .lock()
            .get(host)
            .copied()
            .unwrap_or(Behavior::Deliver);

        self.sent.lock().push(SentAlarm {
            host: host.to_string(),
            channel,
            message: message.map(str::to_string),
        });
        tracing::debug!(host, ?channel, ?behavior, "[mock] alarm recorded");

        match behavior {
            Behavior::Deliver => Ok(()),
            Behavior::Fail => Err(DispatchError::Recipients {
                channel: match channel {
                    AlarmChannel::Call => "call",
                    AlarmChannel::Sms => "sms",
                },
                failed: 1,
                total: 1,
            }),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

impl NotificationDispatcher for MockDispatcher {
    async fn send_call(&self, host: &str) -> Result<(), DispatchError> {
        self.record(host, AlarmChannel::Call, None).await
    }

    async fn send_sms(&self, host: &str, message: &str) -> Result<(), DispatchError> {
        self.record(host, AlarmChannel::Sms, Some(message)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_shares_between_clones() {
        let mock = MockDispatcher::new();
        let owned = mock.clone();
        owned.send_call("a").await.unwrap();
        owned.send_sms("a", "down").await.unwrap();

        assert_eq!(mock.count("a", AlarmChannel::Call), 1);
        assert_eq!(mock.sent_to("a")[1].message.as_deref(), Some("down"));
    }

    #[tokio::test]
    async fn test_failing_host_still_recorded() {
        let mock = MockDispatcher::new();
        mock.fail_for("a");
        assert!(mock.send_call("a").await.is_err());
        assert!(mock.send_call("b").await.is_ok());
        assert_eq!(mock.sent().len(), 2);

        mock.deliver_for("a");
        assert!(mock.send_call("a").await.is_ok());
    }
}
