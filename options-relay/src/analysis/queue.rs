use super::{
    AnalysisRecord, Decision, JobState, TradeSignal,
    scoring::{PriceContext, ScoreBreakdown, ScoreInput, Scorer, decide},
};
use crate::{
    config::AnalysisConfig,
    error::AnalysisError,
    instrument::InstrumentKey,
    market_hours::{Clock, MarketSession},
    upstream::UpstreamSource,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use smol_str::SmolStr;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Receives every terminal [`AnalysisRecord`].
pub trait ReportSink: Send + Sync + 'static {
    fn publish(&self, record: &AnalysisRecord);
}

/// Result of [`AnalysisQueue::submit`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubmitOutcome {
    Accepted,
    /// A job for the same contract is already queued or running.
    AlreadyAnalyzing,
}

/// Reply sent to signal producers.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SmolStr>,
}

impl SubmitResponse {
    pub fn rejected(error: impl Into<SmolStr>) -> Self {
        Self {
            success: false,
            queued: None,
            error: Some(error.into()),
        }
    }
}

impl From<SubmitOutcome> for SubmitResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Accepted => Self {
                success: true,
                queued: Some(true),
                error: None,
            },
            SubmitOutcome::AlreadyAnalyzing => Self::rejected("Already analyzing"),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
}

/// Runs signal analysis jobs, at most `max_concurrent` at a time, oldest first.
///
/// Submitted jobs go onto a channel drained by a single pump task, which waits for a free slot
/// before promoting the next job, so slots are handed out strictly in submission order. The
/// deduplication key of a job is released when it reaches a terminal state, whatever that
/// state is.
#[derive(Clone)]
pub struct AnalysisQueue {
    inner: Arc<Inner>,
    jobs: mpsc::UnboundedSender<Job>,
}

struct Inner {
    config: AnalysisConfig,
    upstream: Arc<dyn UpstreamSource>,
    scorer: Arc<dyn Scorer>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ReportSink>,
    slots: Arc<Semaphore>,
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    active: FnvHashMap<InstrumentKey, JobState>,
    running: usize,
    completed: usize,
    latest: FnvHashMap<InstrumentKey, AnalysisRecord>,
    archive: VecDeque<(InstrumentKey, AnalysisRecord)>,
}

impl std::fmt::Debug for AnalysisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisQueue")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl AnalysisQueue {
    pub fn new(
        config: AnalysisConfig,
        upstream: Arc<dyn UpstreamSource>,
        scorer: Arc<dyn Scorer>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let inner = Arc::new(Inner {
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            upstream,
            scorer,
            clock,
            sink,
            state: Mutex::new(QueueState::default()),
        });
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(&inner).pump(rx));

        Self { inner, jobs }
    }

    /// Queue `signal` for analysis unless its contract is already queued or running.
    pub fn submit(&self, signal: TradeSignal) -> SubmitOutcome {
        let key = signal.key();

        {
            let mut state = self.inner.state.lock();
            if state.active.contains_key(&key) {
                info!(instrument = %key, "signal already being analysed");
                return SubmitOutcome::AlreadyAnalyzing;
            }
            state.active.insert(key.clone(), JobState::Queued);
        }

        let queued_at = self.inner.clock.now();
        let session = MarketSession::at(queued_at);
        info!(
            instrument = %key,
            session = session.label(),
            trader = ?signal.trader,
            "signal queued for analysis"
        );

        let job = Job {
            key,
            signal,
            session,
            queued_at,
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            let aborted = Err(AnalysisError::Aborted("queue stopped".into()));
            let record = self.inner.finish(&job, aborted, Duration::ZERO, Duration::ZERO);
            self.inner.sink.publish(&record);
        }

        SubmitOutcome::Accepted
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        QueueStatus {
            queued: state
                .active
                .values()
                .filter(|job| **job == JobState::Queued)
                .count(),
            running: state.running,
            completed: state.completed,
        }
    }

    /// State of the active job for `key`, else the state of its latest record.
    pub fn job_state(&self, key: &InstrumentKey) -> Option<JobState> {
        let state = self.inner.state.lock();
        state
            .active
            .get(key)
            .copied()
            .or_else(|| state.latest.get(key).map(|record| record.state))
    }

    /// Latest terminal record for `key`.
    pub fn result(&self, key: &InstrumentKey) -> Option<AnalysisRecord> {
        self.inner.state.lock().latest.get(key).cloned()
    }

    /// Most recent terminal records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AnalysisRecord> {
        self.inner
            .state
            .lock()
            .archive
            .iter()
            .rev()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

/// A queued signal with its bookkeeping.
struct Job {
    key: InstrumentKey,
    signal: TradeSignal,
    session: MarketSession,
    queued_at: DateTime<Utc>,
}

/// What a job that ran to completion produced.
struct JobOutput {
    breakdown: ScoreBreakdown,
    fast_path: bool,
}

impl Inner {
    /// Promote queued jobs oldest first, one free slot at a time.
    async fn pump(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            // Slots are never closed
            let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
                let aborted = Err(AnalysisError::Aborted("queue closed".into()));
                let record = self.finish(&job, aborted, Duration::ZERO, Duration::ZERO);
                self.sink.publish(&record);
                continue;
            };

            let deadline = self.promote(&job);
            tokio::spawn(Arc::clone(&self).run(job, permit, deadline));
        }
        debug!("analysis pump stopped");
    }

    /// Mark `job` running and compute its deadline from the contention at promotion time.
    fn promote(&self, job: &Job) -> Duration {
        let (deadline, running) = {
            let mut state = self.state.lock();
            state.active.insert(job.key.clone(), JobState::Running);
            state.running += 1;
            let deadline = if state.running > 1 {
                self.config.base_deadline + self.config.contention_buffer
            } else {
                self.config.base_deadline
            };
            (deadline, state.running)
        };

        debug!(
            instrument = %job.key,
            running,
            deadline_ms = deadline.as_millis() as u64,
            "analysis started"
        );
        deadline
    }

    async fn run(self: Arc<Self>, job: Job, permit: OwnedSemaphorePermit, deadline: Duration) {
        let started = Instant::now();
        let output = match tokio::spawn(Arc::clone(&self).execute(job.signal.clone())).await {
            Ok(output) => output,
            Err(join_error) => Err(AnalysisError::Aborted(join_error.to_string())),
        };
        let elapsed = started.elapsed();

        let record = self.finish(&job, output, deadline, elapsed);
        drop(permit);

        self.sink.publish(&record);
    }

    async fn execute(self: Arc<Self>, signal: TradeSignal) -> Result<JobOutput, AnalysisError> {
        let contract = &signal.contract;
        let fast_path = self.upstream.current_quote(contract).is_some();

        let context = if fast_path {
            self.upstream
                .current_stock_quote(&contract.root)
                .map(|quote| PriceContext::from_stock_quote(&quote))
        } else {
            match self
                .upstream
                .historical_bars(&contract.root, self.config.history_window)
                .await
            {
                Ok(bars) => PriceContext::from_bars(&bars),
                Err(error) => {
                    warn!(root = %contract.root, %error, "historical fetch failed, scoring without price context");
                    None
                }
            }
        };

        let input = ScoreInput {
            signal: &signal,
            context: context.as_ref(),
            already_streaming: fast_path,
            now: self.clock.now(),
        };

        let breakdown = self.scorer.score(&input)?;
        Ok(JobOutput {
            breakdown,
            fast_path,
        })
    }

    /// Record the terminal state of a job and release its deduplication key.
    fn finish(
        &self,
        job: &Job,
        output: Result<JobOutput, AnalysisError>,
        deadline: Duration,
        elapsed: Duration,
    ) -> AnalysisRecord {
        let Job {
            key,
            signal,
            session,
            queued_at,
        } = job;

        let deadline_exceeded = !deadline.is_zero() && elapsed > deadline;
        if deadline_exceeded {
            warn!(
                instrument = %key,
                elapsed_ms = elapsed.as_millis() as u64,
                deadline_ms = deadline.as_millis() as u64,
                "analysis exceeded its deadline"
            );
        }

        let (state, decision, breakdown, fast_path) = match output {
            Ok(output) => (
                JobState::Completed,
                decide(output.breakdown.total),
                Some(output.breakdown),
                output.fast_path,
            ),
            Err(error) => {
                error!(instrument = %key, %error, "analysis failed");
                (JobState::Failed, Decision::error(error.to_string()), None, false)
            }
        };

        let record = AnalysisRecord {
            signal_id: signal.signal_id(),
            contract: SmolStr::new(signal.contract.to_string()),
            root: signal.contract.root.clone(),
            expiration: signal.contract.expiration,
            strike: signal.contract.strike,
            right: signal.contract.right,
            trader: signal.trader.clone(),
            score: breakdown
                .as_ref()
                .map(|breakdown| breakdown.total)
                .unwrap_or(Decimal::ZERO),
            action: decision.action,
            confidence: decision.confidence,
            reason: decision.reason,
            breakdown,
            state,
            market_session: *session,
            fast_path,
            queued_at: *queued_at,
            completed_at: self.clock.now(),
            deadline_ms: deadline.as_millis() as u64,
            duration_ms: elapsed.as_millis() as u64,
            deadline_exceeded,
        };

        info!(
            instrument = %key,
            score = %record.score,
            action = %record.action,
            duration_ms = record.duration_ms,
            "analysis finished"
        );

        let mut state = self.state.lock();
        if state.active.remove(key) == Some(JobState::Running) {
            state.running -= 1;
        }
        state.completed += 1;
        state.latest.insert(key.clone(), record.clone());
        state.archive.push_back((key.clone(), record.clone()));

        while state.archive.len() > self.config.archive_capacity {
            if let Some((evicted_key, evicted)) = state.archive.pop_front() {
                if state.latest.get(&evicted_key) == Some(&evicted) {
                    state.latest.remove(&evicted_key);
                }
            }
        }

        record
    }
}
