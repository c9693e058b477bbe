//! Recognition polling loop.
//!
//! One task owns all loop state (tracked people, announced keys, backoff
//! flag). Each tick is scheduled only after the previous cycle finished,
//! so at most one recognition call is ever outstanding. Readers observe
//! the loop through a `watch` channel of [`MonitorSnapshot`]s.

use chrono::{DateTime, Utc};
use remembr_core::{
    AnnouncementDeduplicator, Announcer, DetectedPerson, RecognitionError, RecognitionResult,
    Recognizer, Visitor,
};
use remembr_hw::FrameSource;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Loop cadence and per-call budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Delay before the first tick, letting the camera settle.
    pub startup_delay: Duration,
    pub standard_interval: Duration,
    pub backoff_interval: Duration,
    pub recognition_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(1),
            standard_interval: Duration::from_secs(3),
            backoff_interval: Duration::from_secs(10),
            recognition_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Scheduled,
    InFlight,
    Cancelled,
}

/// How a single cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    NoFrame,
    Detected { people: usize, announced: usize },
    RateLimited,
    Failed { reason: &'static str },
}

/// Loop state as published after every transition.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub state: MonitorState,
    /// Set while the service is rate limiting us.
    pub rate_limited: bool,
    pub tracked: Vec<DetectedPerson>,
    pub cycles: u64,
    pub last_outcome: Option<CycleOutcome>,
    pub next_delay_ms: u64,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl Default for MonitorSnapshot {
    fn default() -> Self {
        Self {
            state: MonitorState::Idle,
            rate_limited: false,
            tracked: Vec::new(),
            cycles: 0,
            last_outcome: None,
            next_delay_ms: 0,
            last_success_at: None,
        }
    }
}

enum Attempt {
    NoFrame,
    Detected(RecognitionResult),
    Failed(RecognitionError),
}

pub struct Monitor {
    source: Arc<dyn FrameSource>,
    recognizer: Arc<dyn Recognizer>,
    announcer: Arc<dyn Announcer>,
    visitors: watch::Receiver<Arc<[Visitor]>>,
    timing: Timing,
    dedup: AnnouncementDeduplicator,
    snapshot: MonitorSnapshot,
    status: watch::Sender<MonitorSnapshot>,
}

/// Owner's handle. Dropping it cancels the loop as well.
pub struct MonitorHandle {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the loop and wait for it to exit. Any in-flight call is abandoned.
    pub async fn cancel(self) {
        let _ = self.cancel.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "monitor task ended abnormally");
        }
    }
}

impl Monitor {
    pub fn new(
        source: Arc<dyn FrameSource>,
        recognizer: Arc<dyn Recognizer>,
        announcer: Arc<dyn Announcer>,
        visitors: watch::Receiver<Arc<[Visitor]>>,
        timing: Timing,
    ) -> (Self, watch::Receiver<MonitorSnapshot>) {
        let (status, status_rx) = watch::channel(MonitorSnapshot::default());
        let monitor = Self {
            source,
            recognizer,
            announcer,
            visitors,
            timing,
            dedup: AnnouncementDeduplicator::new(),
            snapshot: MonitorSnapshot::default(),
            status,
        };
        (monitor, status_rx)
    }

    pub fn spawn(self) -> MonitorHandle {
        let (cancel, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(cancel_rx));
        MonitorHandle { cancel, task }
    }

    async fn run(mut self, mut cancel: oneshot::Receiver<()>) {
        tracing::info!(
            startup_delay = ?self.timing.startup_delay,
            interval = ?self.timing.standard_interval,
            "recognition loop started"
        );
        let mut delay = self.timing.startup_delay;

        loop {
            self.schedule(delay);
            tokio::select! {
                biased;
                _ = &mut cancel => break,
                _ = tokio::time::sleep(delay) => {}
            }

            delay = tokio::select! {
                biased;
                _ = &mut cancel => {
                    tracing::debug!("cancelled mid-cycle; discarding pending result");
                    break;
                }
                next = self.cycle() => next,
            };
        }

        self.snapshot.state = MonitorState::Cancelled;
        self.publish();
        tracing::info!(cycles = self.snapshot.cycles, "recognition loop stopped");
    }

    /// Run one capture → recognize → apply cycle and return the delay before the next.
    pub async fn cycle(&mut self) -> Duration {
        self.snapshot.state = MonitorState::InFlight;
        self.publish();
        let attempt = self.attempt().await;
        self.apply(attempt)
    }

    async fn attempt(&self) -> Attempt {
        let budget = self.timing.recognition_timeout;

        let frame = match tokio::time::timeout(budget, self.source.grab()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Attempt::NoFrame,
            Err(_) => {
                tracing::warn!(budget = ?budget, "capture source did not deliver a frame in time");
                return Attempt::NoFrame;
            }
        };
        let Some(image) = frame.to_image() else {
            tracing::warn!(?frame, "frame data does not match its dimensions");
            return Attempt::NoFrame;
        };

        // Snapshot at cycle start; store edits land on the next cycle.
        let visitors = self.visitors.borrow().clone();

        match tokio::time::timeout(budget, self.recognizer.identify(&image, &visitors)).await {
            Ok(Ok(result)) => Attempt::Detected(result.reconcile(&visitors)),
            Ok(Err(e)) => Attempt::Failed(e),
            Err(_) => Attempt::Failed(RecognitionError::Timeout(budget)),
        }
    }

    fn apply(&mut self, attempt: Attempt) -> Duration {
        self.snapshot.cycles += 1;

        let (outcome, delay) = match attempt {
            Attempt::NoFrame => {
                tracing::debug!("no frame available; skipping cycle");
                (CycleOutcome::NoFrame, self.timing.standard_interval)
            }
            Attempt::Detected(result) => {
                let announcements = self.dedup.process(&result);
                for a in &announcements {
                    tracing::info!(key = %a.key, phrase = %a.phrase, "announcing visitor");
                    self.announcer.announce(&a.phrase);
                }

                let outcome = CycleOutcome::Detected {
                    people: result.people.len(),
                    announced: announcements.len(),
                };
                self.snapshot.tracked = result.people;
                self.snapshot.rate_limited = false;
                self.snapshot.last_success_at = Some(Utc::now());
                (outcome, self.timing.standard_interval)
            }
            Attempt::Failed(e) if e.is_quota() => {
                tracing::warn!(error = %e, backoff = ?self.timing.backoff_interval, "rate limited; backing off");
                self.snapshot.rate_limited = true;
                (CycleOutcome::RateLimited, self.timing.backoff_interval)
            }
            Attempt::Failed(e) => {
                tracing::warn!(error = %e, kind = e.kind(), "frame analysis skipped");
                self.snapshot.rate_limited = false;
                (
                    CycleOutcome::Failed { reason: e.kind() },
                    self.timing.standard_interval,
                )
            }
        };

        self.snapshot.last_outcome = Some(outcome);
        delay
    }

    fn schedule(&mut self, delay: Duration) {
        self.snapshot.state = MonitorState::Scheduled;
        self.snapshot.next_delay_ms = delay.as_millis() as u64;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::DynamicImage;
    use remembr_core::recognizer::parse_recognition;
    use remembr_core::VisitorType;
    use remembr_hw::Frame;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    const ANN_RESPONSE: &str = r#"{"people":[{"box_2d":[100,100,500,500],"matchFound":true,"visitorId":"v1","name":"Ann","type":"trusted","relationship":"Daughter","lastInteraction":"Sunday"}]}"#;

    enum Reply {
        Respond(RecognitionResult),
        Quota,
        Malformed,
        Hang,
    }

    /// Counts calls still running; an abandoned call decrements on drop.
    struct InFlightGuard<'a>(&'a AtomicUsize);

    impl<'a> InFlightGuard<'a> {
        fn enter(counter: &'a AtomicUsize) -> Self {
            counter.fetch_add(1, Ordering::SeqCst);
            Self(counter)
        }
    }

    impl Drop for InFlightGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedRecognizer {
        script: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<Instant>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(replies.into_iter().collect()),
                ..Default::default()
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Recognizer for ScriptedRecognizer {
        async fn identify(
            &self,
            _frame: &DynamicImage,
            _known: &[Visitor],
        ) -> Result<RecognitionResult, RecognitionError> {
            self.calls.lock().unwrap().push(Instant::now());
            let _guard = InFlightGuard::enter(&self.in_flight);
            self.max_in_flight
                .fetch_max(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);

            // Script exhausted: keep answering with an empty scene.
            let reply = self.script.lock().unwrap().pop_front();
            let out = match reply {
                Some(Reply::Respond(r)) => Ok(r),
                Some(Reply::Quota) => Err(RecognitionError::QuotaExceeded("HTTP 429".into())),
                Some(Reply::Malformed) => Err(RecognitionError::MalformedResponse("bad".into())),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(RecognitionResult::empty())
                }
                None => Ok(RecognitionResult::empty()),
            };
            out
        }

        async fn validate_has_face(&self, _photo: &DynamicImage) -> Result<bool, RecognitionError> {
            Ok(true)
        }
    }

    struct StillSource {
        available: bool,
    }

    #[async_trait]
    impl FrameSource for StillSource {
        async fn grab(&self) -> Option<Frame> {
            self.available.then(|| Frame {
                data: vec![128u8; 8 * 8 * 3],
                width: 8,
                height: 8,
                timestamp: std::time::Instant::now(),
                sequence: 0,
            })
        }
    }

    /// A camera that stopped delivering buffers.
    struct StalledSource;

    #[async_trait]
    impl FrameSource for StalledSource {
        async fn grab(&self) -> Option<Frame> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct RecordingAnnouncer {
        spoken: Mutex<Vec<String>>,
    }

    impl Announcer for RecordingAnnouncer {
        fn announce(&self, text: &str) {
            self.spoken.lock().unwrap().push(text.to_string());
        }
    }

    impl RecordingAnnouncer {
        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    fn ann() -> Visitor {
        Visitor {
            id: "v1".into(),
            name: "Ann".into(),
            relationship: "Daughter".into(),
            last_interaction: "Sunday".into(),
            notes: String::new(),
            photo_base64: "AAAA".into(),
            kind: VisitorType::Trusted,
        }
    }

    fn ann_result() -> RecognitionResult {
        parse_recognition(ANN_RESPONSE).unwrap()
    }

    struct Rig {
        monitor: Monitor,
        status: watch::Receiver<MonitorSnapshot>,
        visitors: watch::Sender<Arc<[Visitor]>>,
        recognizer: Arc<ScriptedRecognizer>,
        announcer: Arc<RecordingAnnouncer>,
    }

    fn rig(replies: impl IntoIterator<Item = Reply>, frames: bool) -> Rig {
        let recognizer = ScriptedRecognizer::new(replies);
        let announcer = Arc::new(RecordingAnnouncer::default());
        let (visitors, visitors_rx) = watch::channel::<Arc<[Visitor]>>(vec![ann()].into());
        let (monitor, status) = Monitor::new(
            Arc::new(StillSource { available: frames }),
            recognizer.clone(),
            announcer.clone(),
            visitors_rx,
            Timing::default(),
        );
        Rig {
            monitor,
            status,
            visitors,
            recognizer,
            announcer,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_single_announcement() {
        let mut r = rig([Reply::Respond(ann_result()), Reply::Respond(ann_result())], true);

        assert_eq!(r.monitor.cycle().await, Duration::from_secs(3));
        let spoken = r.announcer.spoken();
        assert_eq!(spoken.len(), 1);
        assert!(spoken[0].contains("Ann"));
        assert!(r.monitor.dedup.has_announced(&remembr_core::AnnouncementKey::from_visitor_id("v1")));

        r.monitor.cycle().await;
        assert_eq!(r.announcer.spoken().len(), 1);
        assert_eq!(r.monitor.snapshot.tracked.len(), 1);
        assert_eq!(r.monitor.snapshot.tracked[0].relationship.as_deref(), Some("Daughter"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_detections_and_uses_standard_interval() {
        let mut r = rig([Reply::Respond(ann_result()), Reply::Hang], true);
        r.monitor.cycle().await;

        let started = Instant::now();
        let delay = r.monitor.cycle().await;

        assert_eq!(started.elapsed(), Duration::from_secs(8));
        assert_eq!(delay, Duration::from_secs(3));
        assert_eq!(r.monitor.snapshot.tracked.len(), 1);
        assert_eq!(
            r.monitor.snapshot.last_outcome,
            Some(CycleOutcome::Failed { reason: "timeout" })
        );
        assert_eq!(r.recognizer.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_backs_off_then_recovers() {
        let mut r = rig(
            [
                Reply::Respond(ann_result()),
                Reply::Quota,
                Reply::Respond(RecognitionResult::empty()),
            ],
            true,
        );
        r.monitor.cycle().await;

        assert_eq!(r.monitor.cycle().await, Duration::from_secs(10));
        assert!(r.monitor.snapshot.rate_limited);
        assert_eq!(r.monitor.snapshot.tracked.len(), 1);

        assert_eq!(r.monitor.cycle().await, Duration::from_secs(3));
        assert!(!r.monitor.snapshot.rate_limited);
        assert!(r.monitor.snapshot.tracked.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_is_recoverable() {
        let mut r = rig([Reply::Respond(ann_result()), Reply::Malformed], true);
        r.monitor.cycle().await;
        assert_eq!(r.monitor.cycle().await, Duration::from_secs(3));
        assert_eq!(r.monitor.snapshot.tracked.len(), 1);
        assert_eq!(
            r.monitor.snapshot.last_outcome,
            Some(CycleOutcome::Failed { reason: "malformed_response" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_frame_skips_recognition() {
        let mut r = rig([Reply::Respond(ann_result())], false);
        assert_eq!(r.monitor.cycle().await, Duration::from_secs(3));
        assert!(r.recognizer.call_times().is_empty());
        assert_eq!(r.monitor.snapshot.last_outcome, Some(CycleOutcome::NoFrame));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_capture_is_bounded() {
        let recognizer = ScriptedRecognizer::new([Reply::Respond(ann_result())]);
        let (_visitors, visitors_rx) = watch::channel::<Arc<[Visitor]>>(vec![ann()].into());
        let (mut monitor, _status) = Monitor::new(
            Arc::new(StalledSource),
            recognizer.clone(),
            Arc::new(RecordingAnnouncer::default()),
            visitors_rx,
            Timing::default(),
        );

        let started = Instant::now();
        assert_eq!(monitor.cycle().await, Duration::from_secs(3));
        assert_eq!(started.elapsed(), Duration::from_secs(8));
        assert!(recognizer.call_times().is_empty());
        assert_eq!(monitor.snapshot.last_outcome, Some(CycleOutcome::NoFrame));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_visitor_does_not_break_cycles() {
        let mut r = rig([Reply::Respond(ann_result()), Reply::Respond(ann_result())], true);
        r.monitor.cycle().await;
        assert!(r.monitor.snapshot.tracked[0].match_found);

        r.visitors.send_replace(Vec::new().into());
        assert_eq!(r.monitor.cycle().await, Duration::from_secs(3));

        let person = &r.monitor.snapshot.tracked[0];
        assert!(!person.match_found);
        assert!(person.visitor_id.is_none());
        assert_eq!(r.announcer.spoken().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_schedule_and_backoff() {
        let r = rig(
            [
                Reply::Respond(ann_result()),
                Reply::Quota,
                Reply::Respond(ann_result()),
            ],
            true,
        );
        let recognizer = r.recognizer.clone();
        let start = Instant::now();
        let handle = r.monitor.spawn();

        tokio::time::sleep(Duration::from_millis(14_500)).await;
        handle.cancel().await;

        let offsets: Vec<Duration> = recognizer.call_times().iter().map(|t| *t - start).collect();
        // 1s startup, 3s standard, 10s backoff after the quota hit.
        assert_eq!(
            offsets,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(14),
            ]
        );
        assert_eq!(recognizer.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(r.status.borrow().state, MonitorState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_flight_discards_result() {
        let r = rig([Reply::Hang], true);
        let recognizer = r.recognizer.clone();
        let announcer = r.announcer.clone();
        let status = r.status.clone();
        let handle = r.monitor.spawn();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(status.borrow().state, MonitorState::InFlight);

        handle.cancel().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(recognizer.call_times().len(), 1);
        assert!(announcer.spoken().is_empty());
        let snap = status.borrow();
        assert_eq!(snap.state, MonitorState::Cancelled);
        assert_eq!(snap.cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_loop() {
        let r = rig([], true);
        let recognizer = r.recognizer.clone();
        let status = r.status.clone();
        drop(r.monitor.spawn());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recognizer.call_times().is_empty());
        assert_eq!(status.borrow().state, MonitorState::Cancelled);
    }
}
