//! One monitoring pass
//!
//! Evaluates every observed host, persists its next record, then sends the
//! resulting alarms. Alarms go out only after all records are saved and
//! concurrently, each with its own timeout, so a stuck gateway for one host
//! never holds back the others.

use crate::escalation::EscalationEngine;
use crate::models::{Directive, HostState, Observation};
use crate::notify::{alarm_message, DispatchError, NotificationDispatcher};
use crate::store::{HostRecordStore, Reconciliation, RecordPatch, StoreError};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::Duration;
use time::PrimitiveDateTime;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutcome {
    pub host: String,
    pub previous: HostState,
    pub next: HostState,
    pub directive: Directive,
    pub call_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedHost {
    pub host: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<HostOutcome>,
    pub skipped: Vec<SkippedHost>,
    pub dispatch_failures: usize,
}

impl RunReport {
    pub fn directives(&self) -> impl Iterator<Item = (&str, Directive)> {
        self.outcomes
            .iter()
            .filter(|o| o.directive != Directive::None)
            .map(|o| (o.host.as_str(), o.directive))
    }

    pub fn outcome(&self, host: &str) -> Option<&HostOutcome> {
        self.outcomes.iter().find(|o| o.host == host)
    }
}

pub struct Runner<D> {
    engine: EscalationEngine,
    store: HostRecordStore,
    dispatcher: D,
    dispatch_timeout: Duration,
}

impl<D: NotificationDispatcher> Runner<D> {
    pub fn new(engine: EscalationEngine, store: HostRecordStore, dispatcher: D) -> Self {
        Self {
            engine,
            store,
            dispatcher,
            dispatch_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn store(&self) -> &HostRecordStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Aligns the store with the configured host list before any evaluation.
    pub fn reconcile(&mut self, hosts: &[String]) -> Result<Reconciliation, StoreError> {
        let report = self.store.reconcile(hosts)?;
        for host in &report.added {
            info!(host = %host, "now monitoring host");
        }
        for host in &report.removed {
            info!(host = %host, "host no longer monitored, record dropped");
        }
        Ok(report)
    }

    /// Evaluates each observation at `now`, persists, then dispatches.
    ///
    /// Per-host problems are reported in `RunReport::skipped`. A store failure
    /// stops the evaluation loop, but alarms for hosts already saved are
    /// still sent before the error is returned.
    pub async fn run_once(
        &mut self,
        observations: &BTreeMap<String, Observation>,
        now: PrimitiveDateTime,
    ) -> Result<RunReport, StoreError> {
        let mut report = RunReport::default();
        let mut fatal = None;

        for host in self.store.records().keys() {
            if !observations.contains_key(host) {
                debug!(host = %host, "no observation this run");
            }
        }

        for (host, observation) in observations {
            let Some(current) = self.store.record(host).cloned() else {
                let err = StoreError::UnknownHost(host.clone());
                warn!(error = %err, "observation for a host outside the store, skipped");
                report.skipped.push(SkippedHost {
                    host: host.clone(),
                    reason: err.to_string(),
                });
                continue;
            };

            let evaluation = self.engine.evaluate(&current, *observation, now);
            if let Err(err) = self.store.update(host, &RecordPatch::from(&evaluation.record)) {
                if err.is_fatal() {
                    error!(host = %host, error = %err, "store write failed, aborting run");
                    fatal = Some(err);
                    break;
                }
                warn!(host = %host, error = %err, "record rejected, host skipped");
                report.skipped.push(SkippedHost {
                    host: host.clone(),
                    reason: err.to_string(),
                });
                continue;
            }

            if current.state != evaluation.record.state {
                info!(
                    host = %host,
                    from = %current.state,
                    to = %evaluation.record.state,
                    "host state changed"
                );
            }
            report.outcomes.push(HostOutcome {
                host: host.clone(),
                previous: current.state,
                next: evaluation.record.state,
                directive: evaluation.directive,
                call_attempts: evaluation.record.call_attempts,
            });
        }

        report.dispatch_failures = self.dispatch(&report).await;

        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Sends every pending alarm concurrently; returns how many failed.
    async fn dispatch(&self, report: &RunReport) -> usize {
        let timeout = self.dispatch_timeout;
        let sends = report.directives().map(|(host, directive)| async move {
            let sent = match directive {
                Directive::SendCall => tokio::time::timeout(timeout, self.dispatcher.send_call(host)).await,
                Directive::SendSms => {
                    let message = alarm_message(host);
                    tokio::time::timeout(timeout, self.dispatcher.send_sms(host, &message)).await
                }
                Directive::None => return true,
            };

            match sent.unwrap_or_else(|_| Err(DispatchError::Timeout(timeout))) {
                Ok(()) => {
                    info!(host = %host, channel = %directive, "alarm sent");
                    true
                }
                Err(e) => {
                    error!(host = %host, channel = %directive, error = %e, "alarm not delivered");
                    false
                }
            }
        });

        join_all(sends).await.into_iter().filter(|ok| !ok).count()
    }
}
