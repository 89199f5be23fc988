//! Scan session state machine.
//!
//! `ScanEngine` owns the single scan session. A request moves it from Idle or
//! Completed to Running; the batch scheduler then fills in progress, results
//! and the log until the run completes (Completed) or is cancelled (Idle, with
//! what was already published kept for display).
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ScanError;
use crate::evaluator::PortEvaluator;
use crate::journal::LogLine;
use crate::scheduler::{BatchScheduler, ScanObserver, ScanOutcome};
use crate::types::{PortResult, ScanEvent, ScanRequest, ScanSession, SessionState};

/// What to do with a scan request that arrives while another is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Refuse with [`ScanError::ConcurrentScanConflict`].
    #[default]
    Reject,
    /// Cancel the running scan, wait for it to stop, then start the new one.
    CancelAndRestart,
}

const EVENT_CAPACITY: usize = 1024;

/// Handle to the scan engine. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct ScanEngine {
    shared: Arc<Shared>,
}

struct Shared {
    session: RwLock<ScanSession>,
    active: Mutex<Option<ActiveScan>>,
    evaluator: Arc<dyn PortEvaluator>,
    scheduler: BatchScheduler,
    policy: ConflictPolicy,
    events: broadcast::Sender<ScanEvent>,
}

struct ActiveScan {
    cancel: CancellationToken,
    done: watch::Receiver<Option<ScanOutcome>>,
}

impl ActiveScan {
    async fn finished(&self) -> Option<ScanOutcome> {
        let mut done = self.done.clone();
        let outcome = done.wait_for(Option::is_some).await.ok()?;
        *outcome
    }
}

impl ScanEngine {
    /// Engine that rejects a scan request while another one is running.
    pub fn new(evaluator: Arc<dyn PortEvaluator>, scheduler: BatchScheduler) -> Self {
        Self::new_with_policy(evaluator, scheduler, ConflictPolicy::default())
    }

    pub fn new_with_policy(
        evaluator: Arc<dyn PortEvaluator>,
        scheduler: BatchScheduler,
        policy: ConflictPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                session: RwLock::new(ScanSession::default()),
                active: Mutex::new(None),
                evaluator,
                scheduler,
                policy,
                events,
            }),
        }
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.shared.policy
    }

    /// Start scanning `request`. Clears the previous session's progress,
    /// results and log, then runs the batch scheduler in the background.
    pub async fn start(&self, request: ScanRequest) -> Result<(), ScanError> {
        // Held for the whole call so starts and cancels never interleave.
        let mut active = self.shared.active.lock().await;

        let running = self.running_scan(&active).await;
        if let Some(run) = running {
            match self.shared.policy {
                ConflictPolicy::Reject => {
                    warn!(host = request.target(), "scan rejected: another scan is running");
                    return Err(ScanError::ConcurrentScanConflict);
                }
                ConflictPolicy::CancelAndRestart => {
                    info!("cancelling running scan to start a new one");
                    run.cancel.cancel();
                    run.finished().await;
                }
            }
        }

        let total = request.ports().len() as u64;
        let started = LogLine::started(self.shared.scheduler.clock().now(), request.target());
        {
            let mut session = self.shared.session.write().await;
            *session = ScanSession::running(request.clone());
            session.log.push(started.clone());
        }
        let _ = self.shared.events.send(ScanEvent::Started {
            target: request.target().to_string(),
            total,
        });
        let _ = self.shared.events.send(ScanEvent::Log(started));
        info!(host = request.target(), ports = total, "scan started");

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let recorder = SessionRecorder {
            shared: self.shared.clone(),
        };
        let token = cancel.clone();
        let scan = tokio::spawn(async move {
            let shared = &recorder.shared;
            shared
                .scheduler
                .run(
                    request.target(),
                    request.ports(),
                    shared.evaluator.as_ref(),
                    &recorder,
                    &token,
                )
                .await
        });
        let supervisor = SessionRecorder {
            shared: self.shared.clone(),
        };
        tokio::spawn(async move {
            let outcome = match scan.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "scan task died; session reset to idle");
                    let processed = supervisor.shared.session.read().await.processed;
                    ScanOutcome::Cancelled { processed }
                }
            };
            supervisor.finish(outcome).await;
            let _ = done_tx.send(Some(outcome));
        });

        *active = Some(ActiveScan {
            cancel,
            done: done_rx,
        });
        Ok(())
    }

    /// Stop the running scan and wait until it has stopped. Results and log
    /// keep whatever was published before the cancel took effect.
    ///
    /// A cancel racing the last batch may find the scan already complete; the
    /// completed outcome is returned in that case.
    pub async fn cancel(&self) -> Result<ScanOutcome, ScanError> {
        let active = self.shared.active.lock().await;
        match self.running_scan(&active).await {
            Some(run) => {
                run.cancel.cancel();
                run.finished().await.ok_or(ScanError::NotRunning)
            }
            None => Err(ScanError::NotRunning),
        }
    }

    /// Wait for the current (or last) scan to end. `None` if no scan was ever started.
    pub async fn wait(&self) -> Option<ScanOutcome> {
        let mut done = {
            let active = self.shared.active.lock().await;
            active.as_ref()?.done.clone()
        };
        let outcome = done.wait_for(Option::is_some).await.ok()?;
        *outcome
    }

    /// The active scan, if the session says it is still running. The session
    /// state is the only record of "running"; the scan task flips it.
    async fn running_scan<'a>(&self, active: &'a Option<ActiveScan>) -> Option<&'a ActiveScan> {
        let state = self.shared.session.read().await.state;
        active.as_ref().filter(|_| state == SessionState::Running)
    }

    pub async fn is_running(&self) -> bool {
        self.shared.session.read().await.state == SessionState::Running
    }

    /// Copy of the session as observers currently see it.
    pub async fn snapshot(&self) -> ScanSession {
        self.shared.session.read().await.clone()
    }

    pub async fn results(&self) -> Vec<PortResult> {
        self.shared.session.read().await.results.clone()
    }

    pub async fn log(&self) -> Vec<LogLine> {
        self.shared.session.read().await.log.clone()
    }

    /// Live feed of scan events. Late subscribers only see what comes next;
    /// use [`ScanEngine::snapshot`] for what has already happened.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.shared.events.subscribe()
    }
}

/// Writes scheduler output into the shared session and fans it out as events.
/// The scheduler task is the only writer while a scan runs.
struct SessionRecorder {
    shared: Arc<Shared>,
}

impl SessionRecorder {
    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    async fn finish(&self, outcome: ScanOutcome) {
        match outcome {
            ScanOutcome::Completed { open, processed } => {
                info!(open, processed, "scan complete");
            }
            ScanOutcome::Cancelled { processed } => {
                self.shared.session.write().await.state = SessionState::Idle;
                info!(processed, "scan cancelled");
                self.emit(ScanEvent::Cancelled { processed });
            }
        }
    }
}

#[async_trait]
impl ScanObserver for SessionRecorder {
    async fn on_result(&self, result: PortResult) {
        self.shared.session.write().await.results.push(result.clone());
        self.emit(ScanEvent::Result(result));
    }

    async fn on_progress(&self, percent: f64, processed: u64, total: u64) {
        {
            let mut session = self.shared.session.write().await;
            session.progress = percent;
            session.processed = processed;
        }
        self.emit(ScanEvent::Progress {
            percent,
            processed,
            total,
        });
    }

    async fn on_log(&self, line: LogLine) {
        self.shared.session.write().await.log.push(line.clone());
        self.emit(ScanEvent::Log(line));
    }

    async fn on_complete(&self, open: u64, processed: u64) {
        self.shared.session.write().await.state = SessionState::Completed;
        self.emit(ScanEvent::Completed { open, processed });
    }
}
