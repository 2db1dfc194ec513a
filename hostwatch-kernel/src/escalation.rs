//! Escalation state machine
//!
//! Decides, for one host and one observation, the next record and which
//! notification must go out:
//! - first failure is only recorded (debounce)
//! - second consecutive failure triggers a call
//! - further calls every `notification_delay_minutes` until the call budget
//!   is spent, then SMS at the same pace, forever
//! - any successful probe resets the host

use crate::models::{Directive, HostRecord, HostState, Observation};
use serde::{Deserialize, Serialize};
use time::PrimitiveDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub max_call_attempts: u32,
    pub notification_delay_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub record: HostRecord,
    pub directive: Directive,
}

#[derive(Debug, Clone)]
pub struct EscalationEngine {
    thresholds: Thresholds,
}

impl EscalationEngine {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Pure transition: never touches the store nor sends anything.
    pub fn evaluate(
        &self,
        record: &HostRecord,
        observation: Observation,
        now: PrimitiveDateTime,
    ) -> Evaluation {
        let mut next = record.clone();
        next.last_check_time = Some(now);

        let directive = match (record.state, observation) {
            (_, Observation::Up) => {
                next.state = HostState::Healthy;
                next.call_attempts = 0;
                next.last_notification_time = None;
                Directive::None
            }
            (HostState::Healthy, Observation::Down) => {
                next.state = HostState::FirstDetection;
                Directive::None
            }
            (HostState::FirstDetection, Observation::Down) => {
                next.state = HostState::Escalating;
                next.call_attempts = 1;
                next.last_notification_time = Some(now);
                Directive::SendCall
            }
            (HostState::Escalating, Observation::Down) => {
                if !self.delay_elapsed(record.last_notification_time, now) {
                    Directive::None
                } else if record.call_attempts < self.thresholds.max_call_attempts {
                    next.call_attempts = record.call_attempts.saturating_add(1);
                    next.last_notification_time = Some(now);
                    Directive::SendCall
                } else {
                    next.last_notification_time = Some(now);
                    Directive::SendSms
                }
            }
        };

        Evaluation {
            record: next,
            directive,
        }
    }

    /// A missing timestamp counts as elapsed; a clock that went backwards does not.
    fn delay_elapsed(&self, last: Option<PrimitiveDateTime>, now: PrimitiveDateTime) -> bool {
        match last {
            None => true,
            Some(last) => {
                let elapsed_minutes = (now - last).as_seconds_f64() / 60.0;
                elapsed_minutes >= 0.0 && elapsed_minutes >= self.thresholds.notification_delay_minutes
            }
        }
    }
}
