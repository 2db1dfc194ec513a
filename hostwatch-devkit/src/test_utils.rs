/*!
Test harness for the monitoring pipeline

Replays scheduled runs the way the deployed binary does them: each run
reopens the store from disk, reconciles it with the host list, evaluates
the observations on a scripted clock and hands the alarms to a
`MockDispatcher`.
*/

use crate::dispatch_stub::{AlarmChannel, MockDispatcher};
use crate::store_fixtures::StoreFixture;
use anyhow::{Context, Result};
use hostwatch_kernel::{
    Directive, EscalationEngine, HostRecord, HostState, Observation, RunReport, Runner, Thresholds,
};
use std::collections::BTreeMap;
use std::time::Duration;
use time::macros::datetime;
use time::PrimitiveDateTime;

pub struct TestHarness {
    pub fixture: StoreFixture,
    pub dispatcher: MockDispatcher,
    hosts: Vec<String>,
    engine: EscalationEngine,
    start: PrimitiveDateTime,
    dispatch_timeout: Duration,
}

impl TestHarness {
    /// Harness over an empty store.
    pub fn new(hosts: &[&str], thresholds: Thresholds) -> Result<Self> {
        Ok(Self::with_fixture(StoreFixture::new()?, hosts, thresholds))
    }

    /// Harness over an existing document (see `LegacyEntry`).
    pub fn with_fixture(fixture: StoreFixture, hosts: &[&str], thresholds: Thresholds) -> Self {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        Self {
            fixture,
            dispatcher: MockDispatcher::new(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            engine: EscalationEngine::new(thresholds),
            start: datetime!(2024-03-01 10:00:00),
            dispatch_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Wall clock `minute` minutes after the scenario start.
    pub fn at(&self, minute: i64) -> PrimitiveDateTime {
        self.start + time::Duration::minutes(minute)
    }

    /// Replaces the configured host list for the following runs.
    pub fn set_hosts(&mut self, hosts: &[&str]) {
        self.hosts = hosts.iter().map(|h| h.to_string()).collect();
    }

    /// One full run at `minute`.
    pub async fn run(&self, minute: i64, observations: &[(&str, Observation)]) -> Result<RunReport> {
        let store = self.fixture.open().context("Failed to open store")?;
        let mut runner = Runner::new(self.engine.clone(), store, self.dispatcher.clone())
            .with_dispatch_timeout(self.dispatch_timeout);
        runner.reconcile(&self.hosts)?;

        let observations: BTreeMap<String, Observation> = observations
            .iter()
            .map(|(host, obs)| (host.to_string(), *obs))
            .collect();
        Ok(runner.run_once(&observations, self.at(minute)).await?)
    }

    /// Runs with a single failed probe and returns the host's directive.
    pub async fn down(&self, host: &str, minute: i64) -> Result<Directive> {
        self.single(host, Observation::Down, minute).await
    }

    pub async fn up(&self, host: &str, minute: i64) -> Result<Directive> {
        self.single(host, Observation::Up, minute).await
    }

    async fn single(&self, host: &str, observation: Observation, minute: i64) -> Result<Directive> {
        let report = self.run(minute, &[(host, observation)]).await?;
        let outcome = report
            .outcome(host)
            .with_context(|| format!("{host} was not evaluated at minute {minute}"))?;
        Ok(outcome.directive)
    }

    /// Persisted record, read back from disk.
    pub fn record(&self, host: &str) -> Result<HostRecord> {
        self.fixture
            .open()?
            .record(host)
            .cloned()
            .with_context(|| format!("no record for {host}"))
    }

    pub fn assert_state(&self, host: &str, state: HostState) -> Result<()> {
        let record = self.record(host)?;
        anyhow::ensure!(
            record.state == state,
            "{host}: expected {state}, found {}",
            record.state
        );
        Ok(())
    }

    /// Checks both the persisted counter and what actually reached the dispatcher.
    pub fn assert_alarms(&self, host: &str, calls: usize, sms: usize) -> Result<()> {
        let sent_calls = self.dispatcher.count(host, AlarmChannel::Call);
        let sent_sms = self.dispatcher.count(host, AlarmChannel::Sms);
        anyhow::ensure!(
            (sent_calls, sent_sms) == (calls, sms),
            "{host}: expected {calls} call(s) and {sms} sms, dispatcher saw {sent_calls} and {sent_sms}"
        );
        Ok(())
    }
}
