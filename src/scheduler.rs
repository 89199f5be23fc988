use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, TokioClock};
use crate::error::ProbeError;
use crate::evaluator::PortEvaluator;
use crate::journal::LogLine;
use crate::progress::progress;
use crate::types::{PortResult, PortStatus};

/// Receives everything a running scan publishes, in order.
#[async_trait]
pub trait ScanObserver: Send + Sync {
    /// An open or filtered port.
    async fn on_result(&self, result: PortResult);

    /// Emitted once per finished batch.
    async fn on_progress(&self, percent: f64, processed: u64, total: u64);

    async fn on_log(&self, line: LogLine);

    /// Terminal signal of a scan that ran to the end.
    async fn on_complete(&self, open: u64, processed: u64);
}

/// How a scheduler run ended.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    Completed { open: u64, processed: u64 },
    Cancelled { processed: u64 },
}

/// Drives a port evaluator over fixed-size batches with a pause between them.
///
/// - Ports within a batch may be probed concurrently (up to `concurrency`),
///   but results are buffered and published in request order.
/// - A batch is published whole once every port in it has been evaluated.
/// - Cancellation is honoured while evaluating or pausing; an interrupted
///   batch is dropped and nothing from it is published.
#[derive(Clone)]
pub struct BatchScheduler {
    batch_size: usize,
    inter_batch_delay: Duration,
    concurrency: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("batch_size", &self.batch_size)
            .field("inter_batch_delay", &self.inter_batch_delay)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_INTER_BATCH_DELAY: Duration = Duration::from_millis(100);

impl BatchScheduler {
    pub fn new(batch_size: usize, inter_batch_delay: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            inter_batch_delay,
            concurrency: batch_size,
            clock: Arc::new(TokioClock),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, 5_000);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Evaluate `ports` of `target` batch by batch, reporting to `observer`.
    pub async fn run(
        &self,
        target: &str,
        ports: &[u16],
        evaluator: &dyn PortEvaluator,
        observer: &dyn ScanObserver,
        cancel: &CancellationToken,
    ) -> ScanOutcome {
        let total = ports.len() as u64;
        let mut processed = 0u64;
        let mut open = 0u64;

        for (step, batch) in ports.chunks(self.batch_size).enumerate() {
            if step > 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ScanOutcome::Cancelled { processed },
                    _ = self.clock.sleep(self.inter_batch_delay) => {}
                }
            }

            let evaluated = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ScanOutcome::Cancelled { processed },
                evaluated = self.evaluate_batch(target, batch, evaluator) => evaluated,
            };

            for outcome in evaluated {
                let Some(result) = resolve(outcome) else {
                    continue;
                };
                if result.status == PortStatus::Open {
                    open += 1;
                }
                let line = LogLine::finding(self.clock.now(), &result);
                observer.on_result(result).await;
                observer.on_log(line).await;
            }

            processed += batch.len() as u64;
            debug!(step, processed, total, "batch finished");
            observer
                .on_progress(progress(processed, total), processed, total)
                .await;
        }

        observer
            .on_log(LogLine::completed(self.clock.now(), open))
            .await;
        observer.on_complete(open, processed).await;
        ScanOutcome::Completed { open, processed }
    }

    async fn evaluate_batch(
        &self,
        target: &str,
        batch: &[u16],
        evaluator: &dyn PortEvaluator,
    ) -> Vec<Result<PortResult, ProbeError>> {
        stream::iter(batch.iter().copied())
            .map(|port| evaluator.evaluate(target, port))
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await
    }
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_INTER_BATCH_DELAY)
    }
}

/// Apply the probe failure policy: timeouts count as filtered, other errors
/// drop the port. Closed ports are never surfaced.
fn resolve(outcome: Result<PortResult, ProbeError>) -> Option<PortResult> {
    match outcome {
        Ok(result) if result.status.is_reportable() => Some(result),
        Ok(result) => {
            trace!(port = result.port, "closed");
            None
        }
        Err(ProbeError::Timeout { port }) => Some(PortResult::filtered(port)),
        Err(e) => {
            warn!(port = e.port(), error = %e, "probe failed; port skipped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_policy() {
        assert_eq!(resolve(Ok(PortResult::closed(80))), None);
        assert_eq!(
            resolve(Ok(PortResult::open(80, None))),
            Some(PortResult::open(80, None))
        );
        assert_eq!(
            resolve(Err(ProbeError::Timeout { port: 443 })),
            Some(PortResult::filtered(443))
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "unreachable");
        assert_eq!(resolve(Err(ProbeError::Io { port: 22, source: io })), None);
    }

    #[test]
    fn zero_batch_size_is_bumped_to_one() {
        assert_eq!(BatchScheduler::new(0, Duration::ZERO).batch_size(), 1);
    }
}
