use crate::resolver::StepIdentityResolver;
use chrono::{DateTime, Utc};
use orderflow_core::{
    stage_position, RunStatus, Step, WorkflowRun, BLOCKCHAIN_STAGE, EMAIL_STAGE,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);
pub const DEFAULT_BLOCKCHAIN_PROGRESS_THRESHOLD: f64 = 85.0;
pub const DEFAULT_CRITICAL_PROGRESS_THRESHOLD: f64 = 80.0;
pub const DEFAULT_CRITICAL_STAGES: &[&str] =
    &["extraction", "validation", "payment", "order", "blockchain"];

const EMAIL_SENT_PHRASES: &[&str] = &["email sent", "message sent", "sent successfully"];
const EMAIL_RECEIPT_KEYS: &[&str] = &["message_id", "messageId", "thread_id", "threadId"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMode {
    /// A completed email step is enough.
    #[default]
    Lenient,
    /// The email step output must also show the message went out.
    Strict,
}

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub critical_stages: Vec<String>,
    pub blockchain_progress_threshold: f64,
    pub critical_progress_threshold: f64,
    pub debounce: Duration,
    pub mode: DetectionMode,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            critical_stages: DEFAULT_CRITICAL_STAGES
                .iter()
                .map(|stage| stage.to_string())
                .collect(),
            blockchain_progress_threshold: DEFAULT_BLOCKCHAIN_PROGRESS_THRESHOLD,
            critical_progress_threshold: DEFAULT_CRITICAL_PROGRESS_THRESHOLD,
            debounce: DEFAULT_DEBOUNCE,
            mode: DetectionMode::Lenient,
        }
    }
}

/// Which heuristic recognized the run as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    RunCompleted,
    EmailCompleted,
    BlockchainAnchored,
    CriticalStagesCompleted,
}

impl CompletionSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionSignal::RunCompleted => "run_completed",
            CompletionSignal::EmailCompleted => "email_completed",
            CompletionSignal::BlockchainAnchored => "blockchain_anchored",
            CompletionSignal::CriticalStagesCompleted => "critical_stages_completed",
        }
    }
}

impl fmt::Display for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionDetector {
    config: CompletionConfig,
    resolver: StepIdentityResolver,
}

impl CompletionDetector {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            config,
            resolver: StepIdentityResolver::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: StepIdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    pub fn detect(&self, run: Option<&WorkflowRun>) -> bool {
        self.signal(run).is_some()
    }

    /// First heuristic that recognizes `run` as finished, in priority order.
    pub fn signal(&self, run: Option<&WorkflowRun>) -> Option<CompletionSignal> {
        let run = run?;
        if run.status == RunStatus::Completed {
            return Some(CompletionSignal::RunCompleted);
        }

        let email_done = self.stage_steps(run, EMAIL_STAGE).any(|step| match self.config.mode {
            DetectionMode::Lenient => step.is_completed(),
            DetectionMode::Strict => email_confirmed(step),
        });
        if email_done {
            return Some(CompletionSignal::EmailCompleted);
        }

        if run.progress >= self.config.blockchain_progress_threshold
            && self
                .stage_steps(run, BLOCKCHAIN_STAGE)
                .any(Step::is_completed)
        {
            return Some(CompletionSignal::BlockchainAnchored);
        }

        if !self.config.critical_stages.is_empty()
            && run.progress >= self.config.critical_progress_threshold
            && self
                .config
                .critical_stages
                .iter()
                .all(|stage| self.stage_steps(run, stage).any(Step::is_completed))
        {
            return Some(CompletionSignal::CriticalStagesCompleted);
        }
        None
    }

    /// True when completion must not be triggered by this event: the trigger
    /// comes from a stage that runs before email, or email is not yet
    /// confirmed sent.
    pub fn should_block_premature_completion(
        &self,
        run: Option<&WorkflowRun>,
        trigger: Option<&str>,
    ) -> bool {
        let Some(run) = run else {
            return true;
        };
        if let Some(trigger) = trigger {
            let trigger_position = self
                .resolver
                .resolve_label(trigger)
                .and_then(|canonical| stage_position(&canonical));
            if let (Some(trigger_position), Some(email_position)) =
                (trigger_position, stage_position(EMAIL_STAGE))
            {
                if trigger_position < email_position {
                    return true;
                }
            }
        }
        !self.stage_steps(run, EMAIL_STAGE).any(email_confirmed)
    }

    fn stage_steps<'a>(
        &'a self,
        run: &'a WorkflowRun,
        stage: &'a str,
    ) -> impl Iterator<Item = &'a Step> + 'a {
        run.steps
            .iter()
            .filter(move |step| self.matches_stage(step, stage))
    }

    fn matches_stage(&self, step: &Step, stage: &str) -> bool {
        if step.id == stage {
            return true;
        }
        [Some(step.name.as_str()), step.tool_name.as_deref()]
            .into_iter()
            .flatten()
            .any(|label| self.resolver.resolve_label(label).as_deref() == Some(stage))
    }
}

/// A completed email step whose output shows the message was actually sent.
pub fn email_confirmed(step: &Step) -> bool {
    step.is_completed() && step.output.as_ref().is_some_and(has_sent_marker)
}

fn has_sent_marker(value: &Value) -> bool {
    match value {
        Value::String(text) => {
            let lowered = text.trim().to_lowercase();
            lowered == "sent" || EMAIL_SENT_PHRASES.iter().any(|phrase| lowered.contains(phrase))
        }
        Value::Array(items) => items.iter().any(has_sent_marker),
        Value::Object(map) => map.iter().any(|(key, value)| {
            (EMAIL_RECEIPT_KEYS.contains(&key.as_str()) && orderflow_core::has_content(value))
                || has_sent_marker(value)
        }),
        _ => false,
    }
}

/// Per-run notification bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionState {
    pub has_shown_card: bool,
    pub completion_time: Option<DateTime<Utc>>,
    pub card_dismissed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionNotice {
    pub run_id: String,
    pub order_id: Option<String>,
    pub signal: CompletionSignal,
    pub detected_at: DateTime<Utc>,
}

/// Receives the one-shot completion notification for each run.
pub trait CompletionSink: Send + Sync {
    fn on_completion(&self, notice: CompletionNotice);
}

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct NotifierInner {
    states: HashMap<String, CompletionState>,
    timers: HashMap<String, PendingTimer>,
    generation: u64,
}

fn lock(inner: &Mutex<NotifierInner>) -> MutexGuard<'_, NotifierInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Debounced, at-most-once completion notification. Must be used from
/// inside a tokio runtime.
#[derive(Clone)]
pub struct CompletionNotifier {
    detector: Arc<CompletionDetector>,
    sink: Arc<dyn CompletionSink>,
    inner: Arc<Mutex<NotifierInner>>,
}

impl CompletionNotifier {
    pub fn new(detector: CompletionDetector, sink: Arc<dyn CompletionSink>) -> Self {
        Self {
            detector: Arc::new(detector),
            sink,
            inner: Arc::new(Mutex::new(NotifierInner::default())),
        }
    }

    pub fn detector(&self) -> &CompletionDetector {
        &self.detector
    }

    /// Detect and, when done, (re)arm the debounce timer that delivers to the sink.
    pub fn notify(&self, run: &WorkflowRun) -> bool {
        let sink = Arc::clone(&self.sink);
        self.should_show_completion_card(run, move |notice| sink.on_completion(notice))
    }

    /// Returns true when a notification is now scheduled for `run`. Every call
    /// that detects completion restarts the timer; `on_show` runs only if the
    /// timer fires and the run has neither been shown nor dismissed.
    pub fn should_show_completion_card<F>(&self, run: &WorkflowRun, on_show: F) -> bool
    where
        F: FnOnce(CompletionNotice) + Send + 'static,
    {
        let Some(signal) = self.detector.signal(Some(run)) else {
            return false;
        };

        let mut guard = lock(&self.inner);
        let state = guard
            .states
            .entry(run.id.clone())
            .or_insert_with(|| CompletionState {
                completion_time: Some(Utc::now()),
                ..CompletionState::default()
            });
        if state.has_shown_card || state.card_dismissed {
            return false;
        }
        let detected_at = state.completion_time.unwrap_or_else(Utc::now);

        guard.generation += 1;
        let generation = guard.generation;
        if let Some(previous) = guard.timers.remove(&run.id) {
            previous.handle.abort();
            debug!(event = "completion_debounce_restarted", run_id = %run.id);
        }

        let notice = CompletionNotice {
            run_id: run.id.clone(),
            order_id: run.order_id.clone(),
            signal,
            detected_at,
        };
        let inner = Arc::clone(&self.inner);
        let delay = self.detector.config().debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut guard = lock(&inner);
                let current = guard
                    .timers
                    .get(&notice.run_id)
                    .is_some_and(|timer| timer.generation == generation);
                if !current {
                    return;
                }
                guard.timers.remove(&notice.run_id);
                let Some(state) = guard.states.get_mut(&notice.run_id) else {
                    return;
                };
                if state.has_shown_card || state.card_dismissed {
                    return;
                }
                state.has_shown_card = true;
            }
            info!(
                event = "completion_notified",
                run_id = %notice.run_id,
                signal = %notice.signal
            );
            on_show(notice);
        });
        guard
            .timers
            .insert(run.id.clone(), PendingTimer { generation, handle });
        true
    }

    /// Permanently suppress the notification for `run_id`.
    pub fn dismiss(&self, run_id: &str) {
        let mut guard = lock(&self.inner);
        if let Some(timer) = guard.timers.remove(run_id) {
            timer.handle.abort();
        }
        guard
            .states
            .entry(run_id.to_string())
            .or_default()
            .card_dismissed = true;
    }

    /// Forget everything about `run_id` so it may notify again.
    pub fn reset(&self, run_id: &str) {
        let mut guard = lock(&self.inner);
        if let Some(timer) = guard.timers.remove(run_id) {
            timer.handle.abort();
        }
        guard.states.remove(run_id);
    }

    pub fn state(&self, run_id: &str) -> Option<CompletionState> {
        lock(&self.inner).states.get(run_id).cloned()
    }

    pub fn is_pending(&self, run_id: &str) -> bool {
        lock(&self.inner).timers.contains_key(run_id)
    }
}

impl fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionNotifier")
            .field("detector", &self.detector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use orderflow_core::{StepStatus, StepUpdate};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0)
            .single()
            .expect("timestamp")
    }

    fn step(id: &str, tool: &str, status: StepStatus) -> Step {
        Step::from_update(id, &StepUpdate::new(status, ts(0)).with_tool_name(tool))
    }

    fn run_with(steps: Vec<Step>, progress: f64) -> WorkflowRun {
        let mut run = WorkflowRun::new("run-1", ts(0));
        run.status = RunStatus::Running;
        run.steps = steps;
        run.progress = progress;
        run
    }

    fn completed_run() -> WorkflowRun {
        let mut run = run_with(Vec::new(), 100.0);
        run.status = RunStatus::Completed;
        run
    }

    fn sent_email() -> Step {
        let mut email = step(
            "email",
            "portia:google:gmail:send_email",
            StepStatus::Completed,
        );
        email.output = Some(json!({"result": "Email sent to buyer", "message_id": "m-1"}));
        email
    }

    #[test]
    fn run_level_completion_needs_no_email_step() {
        let detector = CompletionDetector::default();
        assert_eq!(
            detector.signal(Some(&completed_run())),
            Some(CompletionSignal::RunCompleted)
        );
        assert!(!detector.detect(None));
        assert!(!detector.detect(Some(&run_with(Vec::new(), 99.0))));
    }

    #[test]
    fn strict_mode_requires_sent_marker() {
        let bare_email = step("email", "portia:google:gmail:send_email", StepStatus::Completed);
        let run = run_with(vec![bare_email], 40.0);

        let lenient = CompletionDetector::default();
        assert_eq!(lenient.signal(Some(&run)), Some(CompletionSignal::EmailCompleted));

        let strict = CompletionDetector::new(CompletionConfig {
            mode: DetectionMode::Strict,
            ..CompletionConfig::default()
        });
        assert!(!strict.detect(Some(&run)));
        assert!(strict.detect(Some(&run_with(vec![sent_email()], 40.0))));
    }

    #[test]
    fn email_step_is_matched_by_label_too() {
        let detector = CompletionDetector::default();
        let relabelled = step("notify_customer", "Gmail Sender", StepStatus::Completed);
        assert!(detector.detect(Some(&run_with(vec![relabelled], 10.0))));
    }

    #[test]
    fn blockchain_needs_progress_threshold() {
        let detector = CompletionDetector::default();
        let anchored = step("blockchain", "Blockchain Anchor Tool", StepStatus::Completed);
        assert!(!detector.detect(Some(&run_with(vec![anchored.clone()], 84.9))));
        assert_eq!(
            detector.signal(Some(&run_with(vec![anchored], 85.0))),
            Some(CompletionSignal::BlockchainAnchored)
        );
    }

    #[test]
    fn critical_stages_must_all_be_completed() {
        let detector = CompletionDetector::new(CompletionConfig {
            critical_stages: vec!["extraction".to_string(), "payment".to_string()],
            ..CompletionConfig::default()
        });
        let extraction = step("extraction", "OrderExtractionTool", StepStatus::Completed);
        let payment = step("payment", "StripePaymentTool", StepStatus::Completed);
        let pending_payment = step("payment", "StripePaymentTool", StepStatus::Active);

        assert!(!detector.detect(Some(&run_with(
            vec![extraction.clone(), pending_payment],
            90.0
        ))));
        assert!(!detector.detect(Some(&run_with(
            vec![extraction.clone(), payment.clone()],
            79.0
        ))));
        assert_eq!(
            detector.signal(Some(&run_with(vec![extraction, payment], 80.0))),
            Some(CompletionSignal::CriticalStagesCompleted)
        );
    }

    #[test]
    fn earlier_stage_triggers_are_blocked() {
        let detector = CompletionDetector::default();
        let run = run_with(vec![sent_email()], 100.0);

        assert!(detector.should_block_premature_completion(Some(&run), Some("StripePaymentTool")));
        assert!(detector.should_block_premature_completion(Some(&run), Some("finance_tool")));
        assert!(!detector.should_block_premature_completion(
            Some(&run),
            Some("portia:google:gmail:send_email")
        ));
        assert!(!detector.should_block_premature_completion(Some(&run), None));
        assert!(detector.should_block_premature_completion(None, None));

        let unconfirmed = run_with(
            vec![step("email", "portia:google:gmail:send_email", StepStatus::Completed)],
            100.0,
        );
        assert!(detector.should_block_premature_completion(Some(&unconfirmed), None));
    }

    #[test]
    fn email_confirmation_markers() {
        let mut email = step("email", "gmail", StepStatus::Completed);
        for output in [
            json!("sent"),
            json!({"status": "Message sent"}),
            json!({"threadId": "t-77"}),
            json!([{"note": "queued"}, "Sent successfully"]),
        ] {
            email.output = Some(output.clone());
            assert!(email_confirmed(&email), "{output}");
        }
        email.output = Some(json!({"status": "queued", "message_id": ""}));
        assert!(!email_confirmed(&email));
        email.status = StepStatus::Active;
        email.output = Some(json!("sent"));
        assert!(!email_confirmed(&email));
    }

    fn counting_notifier(debounce: Duration) -> CompletionNotifier {
        struct NullSink;
        impl CompletionSink for NullSink {
            fn on_completion(&self, _notice: CompletionNotice) {}
        }
        CompletionNotifier::new(
            CompletionDetector::new(CompletionConfig {
                debounce,
                ..CompletionConfig::default()
            }),
            Arc::new(NullSink),
        )
    }

    fn counter_callback(counter: &Arc<AtomicUsize>) -> impl FnOnce(CompletionNotice) + Send {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_detections_fire_once() {
        let notifier = counting_notifier(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        let run = completed_run();

        assert!(notifier.should_show_completion_card(&run, counter_callback(&fired)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(notifier.should_show_completion_card(&run, counter_callback(&fired)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(notifier.should_show_completion_card(&run, counter_callback(&fired)));

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(!notifier.should_show_completion_card(&run, counter_callback(&fired)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(notifier.state("run-1").is_some_and(|state| state.has_shown_card));
    }

    #[tokio::test(start_paused = true)]
    async fn dismissal_cancels_and_suppresses() {
        let notifier = counting_notifier(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        let run = completed_run();

        assert!(notifier.should_show_completion_card(&run, counter_callback(&fired)));
        notifier.dismiss("run-1");
        assert!(!notifier.is_pending("run-1"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!notifier.should_show_completion_card(&run, counter_callback(&fired)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_allows_a_second_notification() {
        let notifier = counting_notifier(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        let run = completed_run();

        notifier.should_show_completion_card(&run, counter_callback(&fired));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        notifier.reset("run-1");
        assert!(notifier.state("run-1").is_none());
        assert!(notifier.should_show_completion_card(&run, counter_callback(&fired)));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_runs_schedule_nothing() {
        let notifier = counting_notifier(Duration::from_secs(2));
        let fired = Arc::new(AtomicUsize::new(0));
        let run = run_with(Vec::new(), 50.0);

        assert!(!notifier.should_show_completion_card(&run, counter_callback(&fired)));
        assert!(notifier.state("run-1").is_none());
        assert!(!notifier.is_pending("run-1"));
    }
}
