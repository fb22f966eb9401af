use crate::connection::EventSource;
use crate::lock;
use crate::router::{Handler, RoutedEvent, Subscription};
use chrono::Utc;
use orderflow_core::wire::{ClientCommand, KNOWN_EVENT_TYPES};
use orderflow_core::{ConnectionState, WorkflowRun};
use orderflow_engine::{
    ApplyOutcome, CompletionDetector, CompletionNotifier, CompletionSink, EventMeta,
    WorkflowStore,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Wires an event source to the run store and the completion notifier and
/// exposes the resulting read model.
pub struct DashboardSession {
    source: Arc<dyn EventSource>,
    store: Arc<Mutex<WorkflowStore>>,
    notifier: CompletionNotifier,
    subscriptions: Vec<Subscription>,
}

impl DashboardSession {
    /// Subscribes immediately; must be created inside a tokio runtime because
    /// completion notifications are debounced on it.
    pub fn new(
        source: Arc<dyn EventSource>,
        store: WorkflowStore,
        detector: CompletionDetector,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        let store = Arc::new(Mutex::new(store));
        let notifier = CompletionNotifier::new(detector, sink);
        let handler = workflow_handler(Arc::clone(&store), notifier.clone());
        let subscriptions = KNOWN_EVENT_TYPES
            .iter()
            .map(|event_type| source.subscribe(event_type, Arc::clone(&handler)))
            .collect();
        Self {
            source,
            store,
            notifier,
            subscriptions,
        }
    }

    pub fn connect(&self) {
        self.source.connect();
    }

    pub fn disconnect(&self) {
        self.source.disconnect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.source.state()
    }

    pub fn is_connected(&self) -> bool {
        self.source.is_connected()
    }

    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    pub fn notifier(&self) -> &CompletionNotifier {
        &self.notifier
    }

    /// Snapshot of every run, in first-seen order.
    pub fn runs(&self) -> Vec<WorkflowRun> {
        lock(&self.store).runs().cloned().collect()
    }

    pub fn run(&self, run_id: &str) -> Option<WorkflowRun> {
        lock(&self.store).run(run_id).cloned()
    }

    pub fn latest_run(&self) -> Option<WorkflowRun> {
        lock(&self.store).latest_run().cloned()
    }

    pub fn start_order(&self, order_text: impl Into<String>, options: Option<Value>) -> bool {
        self.send_command(ClientCommand::StartOrderProcessing {
            order_text: order_text.into(),
            options,
        })
    }

    pub fn cancel_run(&self, run_id: impl Into<String>, reason: Option<String>) -> bool {
        self.send_command(ClientCommand::CancelProcessing {
            run_id: run_id.into(),
            reason,
        })
    }

    pub fn request_status(&self, run_id: impl Into<String>) -> bool {
        self.send_command(ClientCommand::GetProcessingStatus {
            run_id: run_id.into(),
        })
    }

    pub fn answer_clarification(
        &self,
        clarification_id: impl Into<String>,
        response: impl Into<String>,
    ) -> bool {
        self.send_command(ClientCommand::ClarificationResponse {
            clarification_id: clarification_id.into(),
            response: response.into(),
        })
    }

    pub fn dismiss_completion(&self, run_id: &str) {
        self.notifier.dismiss(run_id);
    }

    fn send_command(&self, command: ClientCommand) -> bool {
        match command.to_payload() {
            Ok(payload) => self.source.send_message(payload),
            Err(err) => {
                warn!(event = "command_encode_failed", error = %err);
                false
            }
        }
    }
}

impl Drop for DashboardSession {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }
}

fn workflow_handler(store: Arc<Mutex<WorkflowStore>>, notifier: CompletionNotifier) -> Handler {
    Arc::new(move |routed: &RoutedEvent| -> anyhow::Result<()> {
        let Some(event) = routed.event.as_ref() else {
            return Ok(());
        };
        let meta = EventMeta::from_envelope(&routed.envelope, Utc::now());
        let (outcome, run) = {
            let mut store = lock(&store);
            let outcome = store.apply(event, &meta)?;
            let run = outcome
                .run_id
                .as_deref()
                .and_then(|run_id| store.run(run_id))
                .cloned();
            (outcome, run)
        };
        let Some(run) = run.filter(|_| outcome.changed) else {
            return Ok(());
        };
        log_transition(&outcome, &run);
        offer_completion(&notifier, &outcome, &run);
        Ok(())
    })
}

fn log_transition(outcome: &ApplyOutcome, run: &WorkflowRun) {
    if outcome.became_terminal {
        info!(
            event = "run_terminal",
            run_id = %run.id,
            status = %run.status,
            completed_steps = run.completed_steps,
            total_steps = run.total_steps
        );
        return;
    }
    debug!(
        event = "run_updated",
        run_id = %run.id,
        status = %run.status,
        progress = run.progress,
        current_step = ?run.current_step,
        trigger = ?outcome.trigger_stage
    );
}

/// Step-triggered detections pass the premature-completion gate first;
/// run-level events go straight to the notifier.
fn offer_completion(notifier: &CompletionNotifier, outcome: &ApplyOutcome, run: &WorkflowRun) {
    if let Some(stage) = outcome.trigger_stage.as_deref() {
        if notifier
            .detector()
            .should_block_premature_completion(Some(run), Some(stage))
        {
            return;
        }
    }
    if notifier.notify(run) {
        debug!(event = "completion_armed", run_id = %run.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, WsConnection};
    use crate::simulated::{Scenario, SimulatedSource};
    use orderflow_core::{Envelope, RunStatus, StepStatus};
    use orderflow_engine::{CompletionNotice, CompletionSignal};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        notices: Mutex<Vec<CompletionNotice>>,
    }

    impl CompletionSink for RecordingSink {
        fn on_completion(&self, notice: CompletionNotice) {
            self.notices.lock().expect("lock").push(notice);
        }
    }

    fn session(source: &SimulatedSource, sink: &Arc<RecordingSink>) -> DashboardSession {
        DashboardSession::new(
            Arc::new(source.clone()),
            WorkflowStore::default(),
            CompletionDetector::default(),
            Arc::clone(sink) as Arc<dyn CompletionSink>,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_order_reconciles_and_notifies_once() {
        let step_delay = Duration::from_millis(10);
        let source = SimulatedSource::with_step_delay("sim-test", step_delay);
        let sink = Arc::new(RecordingSink::default());
        let session = session(&source, &sink);
        let scenario = Scenario::order_pipeline("run-7", "ORD-7", step_delay);
        let playtime = scenario.total_delay();
        source.queue(scenario);

        session.connect();
        assert!(session.is_connected());
        assert!(session.start_order("40 industrial widgets", None));
        tokio::time::sleep(playtime + Duration::from_secs(5)).await;

        let run = session.run("run-7").expect("run");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.order_id.as_deref(), Some("ORD-7"));
        assert_eq!(run.progress, 100.0);
        assert!(run.payment_link.is_some());
        assert!(run.transaction_hash.is_some());

        let ids: HashSet<&str> = run.steps.iter().map(|step| step.id.as_str()).collect();
        assert_eq!(ids.len(), run.steps.len());
        assert!(ids.contains("extraction"));
        assert!(ids.contains("email"));
        assert!(run
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Completed));

        let notices = sink.notices.lock().expect("lock");
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].run_id, "run-7");
        assert_eq!(notices[0].signal, CompletionSignal::RunCompleted);
    }

    #[tokio::test(start_paused = true)]
    async fn dismissed_runs_never_notify() {
        let source = SimulatedSource::new("sim-test");
        let sink = Arc::new(RecordingSink::default());
        let session = session(&source, &sink);
        session.connect();

        source.inject(Envelope::new(
            "processing_started",
            json!({"run_id": "run-9", "order_id": "ORD-9"}),
        ));
        source.inject(Envelope::new(
            "final_output",
            json!({"run_id": "run-9", "status": "completed"}),
        ));
        assert!(session.notifier().is_pending("run-9"));
        session.dismiss_completion("run-9");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(session.latest_run().map(|run| run.id), Some("run-9".to_string()));
        assert!(sink.notices.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn commands_are_stamped_and_sent() {
        let source = SimulatedSource::new("sim-cmd");
        let sink = Arc::new(RecordingSink::default());
        let session = session(&source, &sink);
        assert!(!session.request_status("run-1"));

        session.connect();
        assert!(session.answer_clarification("clar-1", "ship to Berlin"));
        assert!(session.cancel_run("run-1", Some("customer changed mind".into())));

        let sent = source.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["type"], "clarification_response");
        assert_eq!(sent[0]["data"]["response"], "ship to Berlin");
        assert_eq!(sent[0]["client_id"], "sim-cmd");
        assert!(sent[0]["timestamp"].is_string());
        assert_eq!(sent[1]["type"], "cancel_processing");
        assert_eq!(session.connection_state().stats.messages_sent, 2);
    }

    #[tokio::test]
    async fn dropping_the_session_releases_its_handlers() {
        let connection = WsConnection::new(
            ConnectionConfig::new("ws://127.0.0.1:9/ws", "drop-test").expect("config"),
        );
        let router = connection.router().clone();
        let session = DashboardSession::new(
            Arc::new(connection),
            WorkflowStore::default(),
            CompletionDetector::default(),
            Arc::new(RecordingSink::default()),
        );
        assert_eq!(router.handler_count("step_update"), 1);
        assert_eq!(router.handler_count("final_output"), 1);

        drop(session);
        assert!(!router.has_channel("step_update"));
        assert!(!router.has_channel("final_output"));
    }
}
