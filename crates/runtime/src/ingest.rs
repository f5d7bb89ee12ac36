//! Heartbeat ingestion loop: decode, merge, then acknowledge.

use std::time::Duration;

use metrics::counter;
use podmeter_api::MeterApi;
use podmeter_core::MeterError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{decode_heartbeat, HeartbeatSource};

/// Bounded exponential backoff applied while the cache is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self { Self { initial, max: max.max(initial) } }

    /// Delay before the next attempt after `failures` consecutive failures (>= 1).
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub merged: u64,
    pub discarded: u64,
    pub redelivered: u64,
}

/// Consume until the source closes or `cancel` fires. A delivery that is
/// already being processed when cancellation arrives is finished first.
pub async fn run_ingest<S: HeartbeatSource + ?Sized>(
    source: &mut S,
    meter: &dyn MeterApi,
    backoff: Backoff,
    cancel: CancellationToken,
) -> IngestReport {
    let mut report = IngestReport::default();
    let mut failures = 0u32;
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            d = source.recv() => match d {
                Some(d) => d,
                None => {
                    info!("heartbeat source closed");
                    break;
                }
            },
        };

        let obs = match decode_heartbeat(&delivery.payload) {
            Ok(o) => o,
            Err(e) => {
                warn!(key = %delivery.key, tag = delivery.tag, error = %e, "discarding malformed heartbeat");
                counter!("ingest_discarded_total", 1u64);
                report.discarded += 1;
                if let Err(e) = source.ack(delivery.tag).await {
                    warn!(tag = delivery.tag, error = %e, "ack failed");
                }
                continue;
            }
        };

        match meter.record_observation(obs).await {
            Ok(result) => {
                failures = 0;
                report.merged += 1;
                counter!("ingest_acked_total", 1u64);
                debug!(key = %delivery.key, result = result.label(), "heartbeat merged");
                if let Err(e) = source.ack(delivery.tag).await {
                    warn!(tag = delivery.tag, error = %e, "ack failed");
                }
            }
            Err(MeterError::MalformedObservation(msg)) => {
                warn!(key = %delivery.key, error = %msg, "discarding rejected heartbeat");
                counter!("ingest_discarded_total", 1u64);
                report.discarded += 1;
                if let Err(e) = source.ack(delivery.tag).await {
                    warn!(tag = delivery.tag, error = %e, "ack failed");
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                report.redelivered += 1;
                counter!("ingest_nacked_total", 1u64);
                if let Err(e) = source.nack(delivery.tag).await {
                    warn!(tag = delivery.tag, error = %e, "nack failed");
                }
                let wait = backoff.delay(failures);
                warn!(key = %delivery.key, attempt = delivery.attempt, error = %e, backoff_ms = wait.as_millis() as u64, "merge failed; heartbeat will be redelivered");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
    info!(merged = report.merged, discarded = report.discarded, redelivered = report.redelivered, "ingestion stopped");
    report
}
