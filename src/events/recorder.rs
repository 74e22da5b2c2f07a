//! Audit recorder: persist, then publish
//!
//! Every classified event passes through here. Persistence is retried a
//! bounded number of times; when the log stays unavailable the event is
//! still published live and a degraded warning is kept for the status view.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::types::{Event, NewEvent};

use super::error::EventLogError;
use super::log::EventLog;
use super::publisher::{EventPublisher, EventSubscription};

/// Retry policy for event persistence
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub retry_base: Duration,
    /// Degraded warnings kept in memory, oldest evicted first
    pub warning_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_millis(100),
            warning_capacity: 100,
        }
    }
}

/// An event the log could not persist
#[derive(Debug, Clone, Serialize)]
pub struct DegradedWarning {
    pub at: DateTime<Utc>,
    pub reason: String,
    pub event: NewEvent,
}

/// What happened to a recorded event
#[derive(Debug, Clone)]
pub enum Recorded {
    Logged(Event),
    /// Published live with id 0, not in the durable log
    Degraded(DegradedWarning),
}

impl Recorded {
    pub fn is_logged(&self) -> bool {
        matches!(self, Recorded::Logged(_))
    }
}

/// Retry delay: `base * 2^attempt`, scaled by a jitter factor in [0.75, 1.25]
///
/// `jitter_random` must be in [0.0, 1.0].
pub fn retry_delay_with_jitter(base: Duration, attempt: u32, jitter_random: f64) -> Duration {
    let capped = attempt.min(6);
    let factor = 0.75 + jitter_random.clamp(0.0, 1.0) * 0.5;
    base.mul_f64(f64::from(1u32 << capped) * factor)
}

pub struct AuditRecorder {
    log: Arc<dyn EventLog>,
    publisher: EventPublisher,
    config: RecorderConfig,
    warnings: Mutex<VecDeque<DegradedWarning>>,
}

impl AuditRecorder {
    pub fn new(log: Arc<dyn EventLog>, publisher: EventPublisher, config: RecorderConfig) -> Self {
        Self {
            log,
            publisher,
            config,
            warnings: Mutex::new(VecDeque::new()),
        }
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.publisher.subscribe()
    }

    /// Persist `event`, then publish it
    pub async fn record(&self, event: NewEvent) -> Recorded {
        match self.append_with_retry(&event).await {
            Ok(logged) => {
                info!(
                    target: "dlp::audit",
                    id = logged.id,
                    event_type = %logged.event_type,
                    path = %logged.file_path.display(),
                    new_path = ?logged.new_path,
                    label = ?logged.label.as_ref().map(|l| l.as_str()),
                    sha256 = ?logged.content_hash.as_ref().map(|h| h.as_str()),
                    user = %logged.actor_identity,
                    "{}",
                    logged.details.as_deref().unwrap_or("")
                );
                self.publisher.publish(logged.clone());
                Recorded::Logged(logged)
            }
            Err(err) => {
                let warning = DegradedWarning {
                    at: Utc::now(),
                    reason: err.to_string(),
                    event: event.clone(),
                };
                warn!(
                    target: "dlp::audit",
                    event_type = %event.event_type,
                    path = %event.file_path.display(),
                    "Audit event not persisted: {}",
                    err
                );
                self.push_warning(warning.clone());
                self.publisher.publish(event.into_event(0));
                Recorded::Degraded(warning)
            }
        }
    }

    async fn append_with_retry(&self, event: &NewEvent) -> Result<Event, EventLogError> {
        let mut attempt = 0u32;
        loop {
            match self.log.append(event).await {
                Ok(logged) => return Ok(logged),
                Err(err) if attempt < self.config.max_retries && err.is_retryable() => {
                    let delay = retry_delay_with_jitter(
                        self.config.retry_base,
                        attempt,
                        rand::random::<f64>(),
                    );
                    debug!(
                        "Event append failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(EventLogError::Exhausted {
                        attempts: attempt + 1,
                        reason: err.to_string(),
                    })
                }
            }
        }
    }

    fn push_warning(&self, warning: DegradedWarning) {
        if self.config.warning_capacity == 0 {
            return;
        }
        let mut warnings = self.warnings.lock();
        while warnings.len() >= self.config.warning_capacity {
            warnings.pop_front();
        }
        warnings.push_back(warning);
    }

    /// Degraded warnings, oldest first
    pub fn degraded_warnings(&self) -> Vec<DegradedWarning> {
        self.warnings.lock().iter().cloned().collect()
    }

    pub fn degraded_count(&self) -> usize {
        self.warnings.lock().len()
    }
}
