//! Alarm delivery
//!
//! `NotificationDispatcher` is the seam the runner talks to; `HttpDispatcher`
//! is the production implementation:
//! - voice call: GET on the call gateway, once per recipient
//! - SMS: POST on the SMS gateway, once per recipient
//! - every recipient is contacted concurrently; a failing one never stops the others

use crate::config::NotificationConf;
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway {url} answered {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("{failed} of {total} {channel} recipients failed")]
    Recipients {
        channel: &'static str,
        failed: usize,
        total: usize,
    },
    #[error("gave up after {0:?}")]
    Timeout(Duration),
}

/// Sends alarms. Implementations are best-effort: no retries.
pub trait NotificationDispatcher {
    fn send_call(&self, host: &str) -> impl Future<Output = Result<(), DispatchError>> + Send;

    fn send_sms(
        &self,
        host: &str,
        message: &str,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// Text of the SMS sent once the call budget is spent.
pub fn alarm_message(host: &str) -> String {
    format!("Host {host} became unreachable")
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    conf: NotificationConf,
}

impl HttpDispatcher {
    pub fn new(conf: NotificationConf) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout_secs))
            .build()?;
        Ok(Self { client, conf })
    }

    /// Query for the call gateway; the location code tells the operator which site is down.
    fn call_query(&self, host: &str, msisdn: &str) -> Vec<(&'static str, String)> {
        let mut query = vec![("number", msisdn.to_string())];
        if let Some(location) = self.conf.locations.get(host) {
            query.push(("host", location.to_string()));
        }
        query
    }

    fn sms_query(&self, msisdn: &str, message: &str) -> Vec<(&'static str, String)> {
        vec![
            ("username", self.conf.sms_username.clone()),
            ("password", self.conf.sms_password.clone()),
            ("msisdn", msisdn.to_string()),
            ("message", message.to_string()),
        ]
    }

    async fn deliver(&self, request: reqwest::RequestBuilder) -> Result<(), DispatchError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                url: response.url().to_string(),
                status,
            });
        }
        Ok(())
    }

    /// Runs `send` for every recipient at once and folds the failures into one result.
    async fn fan_out<'a, F, Fut>(&'a self, channel: &'static str, host: &str, send: F) -> Result<(), DispatchError>
    where
        F: Fn(&'a str) -> Fut,
        Fut: Future<Output = Result<(), DispatchError>>,
    {
        let total = self.conf.msisdn.len();
        if total == 0 {
            warn!(host = %host, channel, "no recipients configured, alarm dropped");
            return Ok(());
        }

        let send = &send;
        let results = join_all(self.conf.msisdn.iter().map(|msisdn| async move {
            let result = send(msisdn.as_str()).await;
            match &result {
                Ok(()) => debug!(host = %host, channel, msisdn = %msisdn, "alarm delivered"),
                Err(e) => warn!(host = %host, channel, msisdn = %msisdn, error = %e, "alarm delivery failed"),
            }
            result
        }))
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            return Err(DispatchError::Recipients {
                channel,
                failed,
                total,
            });
        }
        Ok(())
    }
}

impl NotificationDispatcher for HttpDispatcher {
    async fn send_call(&self, host: &str) -> Result<(), DispatchError> {
        self.fan_out("call", host, |msisdn| {
            let request = self
                .client
                .get(&self.conf.call_url)
                .query(&self.call_query(host, msisdn));
            self.deliver(request)
        })
        .await
    }

    async fn send_sms(&self, host: &str, message: &str) -> Result<(), DispatchError> {
        self.fan_out("sms", host, |msisdn| {
            let request = self
                .client
                .post(&self.conf.sms_url)
                .query(&self.sms_query(msisdn, message));
            self.deliver(request)
        })
        .await
    }
}
