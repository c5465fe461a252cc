//! Event-driven capture dispatch
//!
//! Every incoming event goes through three gates before a job starts:
//! dedup (same timestamp and type within the window), actionability
//! (motion or person) and the per-kind admission slot. Jobs run on their
//! own tasks and release their slot on every exit path.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::admission::{AdmissionSlot, SlotGuard};
use crate::config::CaptureConfig;
use crate::events::{CaptureEvent, DedupWindow};
use crate::utils::path::short_device_name;
use crate::utils::sos::SignalOfStop;

/// How a capture job ended when it did not fail outright
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Complete(PathBuf),
    /// The final artifact could not be produced; `kept` is what remains
    Partial { kept: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Snapshot,
    Clip,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Snapshot => write!(f, "Snapshot"),
            JobKind::Clip => write!(f, "Clip"),
        }
    }
}

/// Performs the actual captures
#[async_trait]
pub trait CaptureRunner: Send + Sync + 'static {
    async fn snapshot(&self, event: &CaptureEvent, seq: u64, sos: SignalOfStop) -> Result<JobOutcome>;

    async fn clip(&self, event: &CaptureEvent, seq: u64, sos: SignalOfStop) -> Result<JobOutcome>;
}

/// Which jobs an actionable event may start
#[derive(Debug, Clone)]
pub struct CapturePolicy {
    pub snapshot: bool,
    pub clip: bool,
    pub dedup_window: Duration,
}

impl From<&CaptureConfig> for CapturePolicy {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            snapshot: config.snapshot,
            clip: config.clip,
            dedup_window: config.dedup_window(),
        }
    }
}

/// What happened to one job kind for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Started(u64),
    /// A job of this kind was already running
    Skipped,
    /// Disabled by policy, or nothing to fetch for this event
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Duplicate,
    NotActionable,
    Dispatched { snapshot: SlotDecision, clip: SlotDecision },
}

pub struct CaptureOrchestrator {
    runner: Arc<dyn CaptureRunner>,
    policy: CapturePolicy,
    dedup: DedupWindow<(DateTime<Utc>, String)>,
    snapshot_slot: Arc<AdmissionSlot>,
    clip_slot: Arc<AdmissionSlot>,
    seq: AtomicU64,
    jobs: JoinSet<()>,
    sos: SignalOfStop,
}

impl CaptureOrchestrator {
    pub fn new(runner: Arc<dyn CaptureRunner>, policy: CapturePolicy, sos: SignalOfStop) -> Self {
        Self {
            runner,
            dedup: DedupWindow::new(policy.dedup_window),
            policy,
            snapshot_slot: AdmissionSlot::new("snapshot"),
            clip_slot: AdmissionSlot::new("clip"),
            seq: AtomicU64::new(0),
            jobs: JoinSet::new(),
            sos,
        }
    }

    /// Applies the dedup, actionability and admission gates to one event.
    pub fn handle_event(&mut self, event: CaptureEvent) -> Dispatch {
        if !self.dedup.insert(event.dedup_key()) {
            return Dispatch::Duplicate;
        }

        info!(
            "Event: {} from {} at {}",
            event.label(),
            short_device_name(&event.device),
            event.timestamp.to_rfc3339()
        );
        if !event.kind.is_actionable() {
            return Dispatch::NotActionable;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = Arc::new(event);

        let snapshot = if self.policy.snapshot && !event.event_id.is_empty() {
            self.admit(JobKind::Snapshot, &event, seq)
        } else {
            SlotDecision::Disabled
        };
        let clip = if self.policy.clip {
            self.admit(JobKind::Clip, &event, seq)
        } else {
            SlotDecision::Disabled
        };

        Dispatch::Dispatched { snapshot, clip }
    }

    fn admit(&mut self, kind: JobKind, event: &Arc<CaptureEvent>, seq: u64) -> SlotDecision {
        let slot = match kind {
            JobKind::Snapshot => &self.snapshot_slot,
            JobKind::Clip => &self.clip_slot,
        };
        let Some(guard) = slot.try_acquire() else {
            info!("{} skipped: previous {} still in progress", kind, slot.name());
            return SlotDecision::Skipped;
        };

        self.spawn_job(kind, guard, event.clone(), seq);
        SlotDecision::Started(seq)
    }

    fn spawn_job(&mut self, kind: JobKind, guard: SlotGuard, event: Arc<CaptureEvent>, seq: u64) {
        let runner = self.runner.clone();
        let sos = self.sos.child();

        self.jobs.spawn(async move {
            let _guard = guard;
            debug!("{} #{} started", kind, seq);

            let result = match kind {
                JobKind::Snapshot => runner.snapshot(&event, seq, sos).await,
                JobKind::Clip => runner.clip(&event, seq, sos).await,
            };

            match result {
                Ok(JobOutcome::Complete(path)) => info!("{} saved: {}", kind, path.display()),
                Ok(JobOutcome::Partial { kept, reason }) => {
                    warn!("{} incomplete: {} (kept {})", kind, reason, kept.display())
                }
                Err(e) => error!("{} #{} failed: {:#}", kind, seq, e),
            }
        });
    }

    /// Jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    fn reap(&mut self) {
        while let Some(joined) = self.jobs.try_join_next() {
            if let Err(e) = joined {
                error!("Capture job aborted: {}", e);
            }
        }
    }

    /// Consumes events until cancelled or the stream ends, then waits for
    /// the jobs still running so clips get finalized.
    pub async fn run(mut self, mut events: mpsc::Receiver<CaptureEvent>) -> Result<()> {
        info!(
            "Capturing on events (snapshot: {}, clip: {})",
            self.policy.snapshot, self.policy.clip
        );

        loop {
            let event = tokio::select! {
                _ = self.sos.wait_cancellation() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!("Event stream closed");
                break;
            };

            self.reap();
            let dispatch = self.handle_event(event);
            debug!("Dispatch: {:?}", dispatch);
        }

        if !self.jobs.is_empty() {
            info!("Waiting for {} capture job(s) to finish", self.jobs.len());
        }
        while let Some(joined) = self.jobs.join_next().await {
            if let Err(e) = joined {
                error!("Capture job aborted: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Runner whose jobs block until released
    #[derive(Default)]
    struct GatedRunner {
        snapshots: AtomicUsize,
        clips: AtomicUsize,
        seqs: Mutex<Vec<(JobKind, u64)>>,
        release: Notify,
        fail: bool,
    }

    impl GatedRunner {
        async fn job(&self, kind: JobKind, seq: u64) -> Result<JobOutcome> {
            self.seqs.lock().unwrap().push((kind, seq));
            self.release.notified().await;
            if self.fail {
                bail!("device refused");
            }
            Ok(JobOutcome::Complete(PathBuf::from(format!("{kind}_{seq}"))))
        }
    }

    #[async_trait]
    impl CaptureRunner for GatedRunner {
        async fn snapshot(&self, _event: &CaptureEvent, seq: u64, _sos: SignalOfStop) -> Result<JobOutcome> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            self.job(JobKind::Snapshot, seq).await
        }

        async fn clip(&self, _event: &CaptureEvent, seq: u64, _sos: SignalOfStop) -> Result<JobOutcome> {
            self.clips.fetch_add(1, Ordering::SeqCst);
            self.job(JobKind::Clip, seq).await
        }
    }

    fn policy(snapshot: bool, clip: bool) -> CapturePolicy {
        CapturePolicy {
            snapshot,
            clip,
            dedup_window: Duration::from_secs(60),
        }
    }

    fn motion_at(ms: i64, id: &str) -> CaptureEvent {
        let ts = Utc.timestamp_millis_opt(1_800_000_000_000 + ms).unwrap();
        CaptureEvent::new(
            "enterprises/p/devices/cam",
            "sdm.devices.events.CameraMotion.Motion",
            id,
            ts,
        )
    }

    async fn settle(orchestrator: &mut CaptureOrchestrator) {
        // Let spawned jobs reach their gate
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        orchestrator.reap();
    }

    #[tokio::test]
    async fn test_identical_key_runs_one_snapshot() {
        let runner = Arc::new(GatedRunner::default());
        let mut orchestrator = CaptureOrchestrator::new(runner.clone(), policy(true, false), SignalOfStop::new());

        let first = orchestrator.handle_event(motion_at(10_000, "img-1"));
        let second = orchestrator.handle_event(motion_at(10_000, "img-2"));

        assert_eq!(
            first,
            Dispatch::Dispatched {
                snapshot: SlotDecision::Started(1),
                clip: SlotDecision::Disabled
            }
        );
        assert_eq!(second, Dispatch::Duplicate);

        settle(&mut orchestrator).await;
        runner.release.notify_waiters();
        settle(&mut orchestrator).await;
        assert_eq!(runner.snapshots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clip_and_snapshot_run_together_third_is_skipped() {
        let runner = Arc::new(GatedRunner::default());
        let mut orchestrator = CaptureOrchestrator::new(runner.clone(), policy(true, true), SignalOfStop::new());

        let first = orchestrator.handle_event(motion_at(0, "img-1"));
        assert_eq!(
            first,
            Dispatch::Dispatched {
                snapshot: SlotDecision::Started(1),
                clip: SlotDecision::Started(1)
            }
        );
        settle(&mut orchestrator).await;
        assert_eq!(orchestrator.in_flight(), 2);

        let third = orchestrator.handle_event(motion_at(1_000, "img-2"));
        assert_eq!(
            third,
            Dispatch::Dispatched {
                snapshot: SlotDecision::Skipped,
                clip: SlotDecision::Skipped
            }
        );

        runner.release.notify_waiters();
        settle(&mut orchestrator).await;
        assert_eq!(orchestrator.in_flight(), 0);
        assert_eq!(runner.snapshots.load(Ordering::SeqCst), 1);
        assert_eq!(runner.clips.load(Ordering::SeqCst), 1);

        // Both slots are free again and the sequence keeps counting
        let fourth = orchestrator.handle_event(motion_at(2_000, "img-3"));
        assert_eq!(
            fourth,
            Dispatch::Dispatched {
                snapshot: SlotDecision::Started(3),
                clip: SlotDecision::Started(3)
            }
        );
        settle(&mut orchestrator).await;
        runner.release.notify_waiters();
        settle(&mut orchestrator).await;
    }

    #[tokio::test]
    async fn test_slot_released_after_failure() {
        let runner = Arc::new(GatedRunner {
            fail: true,
            ..Default::default()
        });
        let mut orchestrator = CaptureOrchestrator::new(runner.clone(), policy(false, true), SignalOfStop::new());

        orchestrator.handle_event(motion_at(0, ""));
        settle(&mut orchestrator).await;
        assert!(orchestrator.clip_slot.is_busy());

        runner.release.notify_waiters();
        settle(&mut orchestrator).await;
        assert!(!orchestrator.clip_slot.is_busy());

        let next = orchestrator.handle_event(motion_at(5_000, ""));
        assert_eq!(
            next,
            Dispatch::Dispatched {
                snapshot: SlotDecision::Disabled,
                clip: SlotDecision::Started(2)
            }
        );
        settle(&mut orchestrator).await;
        runner.release.notify_waiters();
        settle(&mut orchestrator).await;
    }

    #[tokio::test]
    async fn test_non_actionable_and_missing_image() {
        let runner = Arc::new(GatedRunner::default());
        let mut orchestrator = CaptureOrchestrator::new(runner.clone(), policy(true, false), SignalOfStop::new());

        let chime = CaptureEvent::new("d", "sdm.devices.events.DoorbellChime.Chime", "x", Utc::now());
        assert_eq!(orchestrator.handle_event(chime), Dispatch::NotActionable);

        // A motion event without an image id cannot be snapshotted
        assert_eq!(
            orchestrator.handle_event(motion_at(0, "")),
            Dispatch::Dispatched {
                snapshot: SlotDecision::Disabled,
                clip: SlotDecision::Disabled
            }
        );
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_jobs_after_stream_ends() {
        let runner = Arc::new(GatedRunner::default());
        let orchestrator = CaptureOrchestrator::new(runner.clone(), policy(true, false), SignalOfStop::new());

        let (tx, rx) = mpsc::channel(4);
        tx.send(motion_at(0, "img-1")).await.unwrap();
        tx.send(motion_at(0, "img-1")).await.unwrap();
        drop(tx);

        let task = tokio::spawn(orchestrator.run(rx));
        while runner.seqs.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());

        runner.release.notify_waiters();
        task.await.unwrap().unwrap();
        assert_eq!(*runner.seqs.lock().unwrap(), vec![(JobKind::Snapshot, 1)]);
    }
}
