use crate::reconcile::{StepReconciler, SuppressionGate};
use crate::EngineError;
use chrono::{DateTime, Utc};
use orderflow_core::wire::{StepLogPayload, StepUpdatePayload, WorkflowEvent};
use orderflow_core::{
    has_content, non_empty, parse_timestamp, Envelope, PendingClarification, RunStatus, StepLog,
    StepStatus, StepUpdate, WorkflowRun,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Envelope-level context for one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMeta {
    pub run_id: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(observed_at: DateTime<Utc>) -> Self {
        Self {
            run_id: None,
            observed_at,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        self.run_id = non_empty(Some(run_id.as_str()));
        self
    }

    pub fn from_envelope(envelope: &Envelope, now: DateTime<Utc>) -> Self {
        Self {
            run_id: non_empty(envelope.run_id.as_deref()),
            observed_at: envelope.parsed_timestamp().unwrap_or(now),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub run_id: Option<String>,
    pub changed: bool,
    /// Canonical stage of the step update that produced this outcome.
    pub trigger_stage: Option<String>,
    pub became_terminal: bool,
}

impl ApplyOutcome {
    fn touched(run_id: &str) -> Self {
        Self {
            run_id: Some(run_id.to_string()),
            changed: true,
            ..Self::default()
        }
    }

    fn untouched(run_id: &str) -> Self {
        Self {
            run_id: Some(run_id.to_string()),
            ..Self::default()
        }
    }
}

/// Per-session run state. Every mutation goes through [`WorkflowStore::apply`].
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    reconciler: StepReconciler,
    gate: SuppressionGate,
    runs: HashMap<String, WorkflowRun>,
    order: Vec<String>,
    latest: Option<String>,
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::new(StepReconciler::default())
    }
}

impl WorkflowStore {
    pub fn new(reconciler: StepReconciler) -> Self {
        let config = reconciler.config();
        let gate = SuppressionGate::new(
            config.suppressed_stage.clone(),
            config.suppression_window,
        );
        Self {
            reconciler,
            gate,
            runs: HashMap::new(),
            order: Vec::new(),
            latest: None,
        }
    }

    pub fn reconciler(&self) -> &StepReconciler {
        &self.reconciler
    }

    /// Runs in the order they were first seen.
    pub fn runs(&self) -> impl Iterator<Item = &WorkflowRun> {
        self.order.iter().filter_map(|id| self.runs.get(id))
    }

    pub fn run(&self, run_id: &str) -> Option<&WorkflowRun> {
        self.runs.get(run_id)
    }

    pub fn latest_run(&self) -> Option<&WorkflowRun> {
        self.latest.as_deref().and_then(|id| self.runs.get(id))
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn apply_envelope(
        &mut self,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, EngineError> {
        match envelope.decode_event()? {
            Some(event) => self.apply(&event, &EventMeta::from_envelope(envelope, now)),
            None => Ok(ApplyOutcome::default()),
        }
    }

    pub fn apply(
        &mut self,
        event: &WorkflowEvent,
        meta: &EventMeta,
    ) -> Result<ApplyOutcome, EngineError> {
        match event {
            WorkflowEvent::Heartbeat(_)
            | WorkflowEvent::ConnectionAcknowledged(_)
            | WorkflowEvent::Connected(_)
            | WorkflowEvent::Disconnected(_)
            | WorkflowEvent::ConnectionError(_) => return Ok(ApplyOutcome::default()),
            WorkflowEvent::ClarificationAcknowledged(ack) => {
                return Ok(self.clear_clarification_anywhere(&ack.clarification_id));
            }
            WorkflowEvent::Error(payload) => return Ok(self.apply_error(event, payload, meta)),
            _ => {}
        }

        let run_id = self.target_run(event, meta)?;
        let at = meta.observed_at;
        let created = self.ensure_run(&run_id, at);
        let mut outcome = match event {
            WorkflowEvent::ProcessingStarted(payload) => {
                self.latest = Some(run_id.clone());
                let run = self.run_mut(&run_id);
                if let Some(order_id) = non_empty(payload.order_id.as_deref()) {
                    run.order_id = Some(order_id);
                }
                if let Some(total) = payload.total_steps.filter(|total| *total > 0) {
                    run.total_steps = total;
                }
                if at < run.start_time {
                    run.start_time = at;
                }
                mark_running(run);
                info!(event = "run_started", run_id = %run_id, order_id = ?run.order_id);
                ApplyOutcome::touched(&run_id)
            }
            WorkflowEvent::ProcessingStatus(payload) => {
                let current_step = payload
                    .current_step
                    .as_deref()
                    .and_then(|label| self.reconciler.resolver().resolve_label(label));
                let run = self.run_mut(&run_id);
                if let Some(total) = payload.total_steps.filter(|total| *total > 0) {
                    run.total_steps = total;
                }
                if let Some(progress) = payload.progress_percentage {
                    raise_progress(run, progress);
                }
                if current_step.is_some() {
                    run.current_step = current_step;
                }
                match payload.status.as_deref().map(str::parse::<RunStatus>) {
                    Some(Ok(status)) => {
                        let mut outcome = self.transition(&run_id, status, at);
                        outcome.changed |= payload.progress_percentage.is_some();
                        outcome
                    }
                    Some(Err(err)) => {
                        warn!(event = "run_status_unrecognized", run_id = %run_id, error = %err);
                        mark_running(self.run_mut(&run_id));
                        ApplyOutcome::touched(&run_id)
                    }
                    None => {
                        mark_running(self.run_mut(&run_id));
                        ApplyOutcome::touched(&run_id)
                    }
                }
            }
            WorkflowEvent::ProcessingCompleted(payload) => {
                let run = self.run_mut(&run_id);
                if let Some(output) = payload.final_output.as_ref().filter(|v| has_content(v)) {
                    run.final_output = Some(output.clone());
                }
                self.transition(&run_id, RunStatus::Completed, at)
            }
            WorkflowEvent::StepUpdate(payload) => self.apply_step_update(&run_id, payload, at)?,
            WorkflowEvent::PhaseTransition(payload) => {
                let run = self.run_mut(&run_id);
                run.current_phase = non_empty(Some(payload.to_phase.as_str()));
                mark_running(run);
                debug!(event = "phase_transition", run_id = %run_id, phase = %payload.to_phase);
                ApplyOutcome::touched(&run_id)
            }
            WorkflowEvent::ProgressUpdate(payload) => {
                let current_step = payload
                    .current_step
                    .as_deref()
                    .and_then(|label| self.reconciler.resolver().resolve_label(label));
                let run = self.run_mut(&run_id);
                if let Some(progress) = payload.progress_percentage {
                    raise_progress(run, progress);
                }
                if current_step.is_some() {
                    run.current_step = current_step;
                }
                ApplyOutcome::touched(&run_id)
            }
            WorkflowEvent::ClarificationRequest(payload) => {
                let run = self.run_mut(&run_id);
                run.pending_clarification = Some(PendingClarification {
                    clarification_id: payload.clarification_id.clone(),
                    question: payload.question.clone(),
                    options: payload.options.clone(),
                    timeout_seconds: payload.timeout_seconds,
                });
                mark_running(run);
                info!(
                    event = "clarification_requested",
                    run_id = %run_id,
                    clarification_id = %payload.clarification_id
                );
                ApplyOutcome::touched(&run_id)
            }
            WorkflowEvent::ClarificationResponse(payload) => {
                self.clear_clarification(&run_id, &payload.clarification_id)
            }
            WorkflowEvent::ClarificationTimeout(payload) => {
                self.clear_clarification(&run_id, &payload.clarification_id)
            }
            WorkflowEvent::PaymentLink(payload) => {
                let run = self.run_mut(&run_id);
                match non_empty(payload.payment_link.as_deref()) {
                    Some(link) => {
                        run.payment_link = Some(link);
                        if let Some(order_id) = non_empty(payload.order_id.as_deref()) {
                            run.order_id.get_or_insert(order_id);
                        }
                        ApplyOutcome::touched(&run_id)
                    }
                    None => ApplyOutcome::untouched(&run_id),
                }
            }
            WorkflowEvent::BlockchainTx(payload) => {
                let run = self.run_mut(&run_id);
                match non_empty(payload.tx_hash.as_deref()) {
                    Some(hash) => {
                        run.transaction_hash = Some(hash);
                        ApplyOutcome::touched(&run_id)
                    }
                    None => ApplyOutcome::untouched(&run_id),
                }
            }
            WorkflowEvent::FinalOutput(payload) => {
                let error = non_empty(payload.error.as_deref());
                let status = match payload.status.as_deref().map(str::parse::<RunStatus>) {
                    Some(Ok(status)) if status.is_terminal() => status,
                    Some(Err(err)) => {
                        warn!(event = "run_status_unrecognized", run_id = %run_id, error = %err);
                        terminal_for(error.as_deref())
                    }
                    _ => terminal_for(error.as_deref()),
                };
                let run = self.run_mut(&run_id);
                if let Some(output) = payload.output.as_ref().filter(|v| has_content(v)) {
                    run.final_output = Some(output.clone());
                }
                if error.is_some() {
                    run.error = error;
                }
                self.transition(&run_id, status, at)
            }
            WorkflowEvent::Heartbeat(_)
            | WorkflowEvent::ConnectionAcknowledged(_)
            | WorkflowEvent::Connected(_)
            | WorkflowEvent::Disconnected(_)
            | WorkflowEvent::ConnectionError(_)
            | WorkflowEvent::ClarificationAcknowledged(_)
            | WorkflowEvent::Error(_) => ApplyOutcome::untouched(&run_id),
        };
        outcome.changed |= created;
        Ok(outcome)
    }

    fn apply_step_update(
        &mut self,
        run_id: &str,
        payload: &StepUpdatePayload,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, EngineError> {
        let update = step_update_from_payload(payload, at);
        let canonical = self
            .reconciler
            .resolver()
            .resolve_update(&update)
            .ok_or(EngineError::UnidentifiedStep)?;

        if !self
            .gate
            .admit(run_id, &canonical, update.status, update.observed_at)
        {
            debug!(
                event = "step_update_suppressed",
                run_id = %run_id,
                canonical_id = %canonical,
                status = %update.status
            );
            return Ok(ApplyOutcome::untouched(run_id));
        }

        let Some(run) = self.runs.get_mut(run_id) else {
            return Ok(ApplyOutcome::default());
        };
        let action = self.reconciler.reconcile(&mut run.steps, &update)?;
        mark_running(run);
        if matches!(update.status, StepStatus::Active | StepStatus::Waiting) {
            run.current_step = Some(action.canonical_id().to_string());
        }
        refresh_aggregates(run);
        debug!(
            event = "step_reconciled",
            run_id = %run_id,
            canonical_id = %action.canonical_id(),
            completed_steps = run.completed_steps,
            progress = run.progress
        );

        let mut outcome = ApplyOutcome::touched(run_id);
        outcome.trigger_stage = Some(canonical);
        Ok(outcome)
    }

    fn apply_error(
        &mut self,
        event: &WorkflowEvent,
        payload: &orderflow_core::wire::ErrorPayload,
        meta: &EventMeta,
    ) -> ApplyOutcome {
        let message = payload
            .message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        let explicit = event
            .run_id()
            .map(str::to_string)
            .or_else(|| meta.run_id.clone());
        let Some(run_id) = explicit.filter(|id| self.runs.contains_key(id)) else {
            debug!(
                event = "error_event_unscoped",
                error_type = ?payload.error_type,
                message = %message
            );
            return ApplyOutcome::default();
        };
        if payload.recoverable {
            warn!(event = "run_error_recoverable", run_id = %run_id, message = %message);
            return ApplyOutcome::untouched(&run_id);
        }
        self.run_mut(&run_id).error = Some(message);
        self.transition(&run_id, RunStatus::Failed, meta.observed_at)
    }

    fn target_run(&self, event: &WorkflowEvent, meta: &EventMeta) -> Result<String, EngineError> {
        if let Some(run_id) = event.run_id() {
            return Ok(run_id.trim().to_string());
        }
        if let Some(run_id) = meta.run_id.as_deref() {
            return Ok(run_id.to_string());
        }
        let fallback = match event {
            WorkflowEvent::ProcessingStarted(_) => None,
            _ => self.latest.clone(),
        };
        fallback.ok_or_else(|| EngineError::MissingRunId {
            event_type: event.event_type().to_string(),
        })
    }

    /// Returns true when the run was created by this call.
    fn ensure_run(&mut self, run_id: &str, at: DateTime<Utc>) -> bool {
        if self.runs.contains_key(run_id) {
            return false;
        }
        self.runs
            .insert(run_id.to_string(), WorkflowRun::new(run_id, at));
        self.order.push(run_id.to_string());
        if self.latest.is_none() {
            self.latest = Some(run_id.to_string());
        }
        debug!(event = "run_created", run_id = %run_id);
        true
    }

    fn run_mut(&mut self, run_id: &str) -> &mut WorkflowRun {
        self.runs
            .entry(run_id.to_string())
            .or_insert_with(|| WorkflowRun::new(run_id, Utc::now()))
    }

    /// Terminal runs never change status again.
    fn transition(&mut self, run_id: &str, status: RunStatus, at: DateTime<Utc>) -> ApplyOutcome {
        let run = self.run_mut(run_id);
        if run.is_terminal() || run.status == status {
            return ApplyOutcome::untouched(run_id);
        }
        if !status.is_terminal() {
            if status == RunStatus::Running {
                mark_running(run);
            }
            return ApplyOutcome::touched(run_id);
        }

        run.status = status;
        run.end_time = Some(at);
        if status == RunStatus::Completed {
            run.progress = 100.0;
        }
        refresh_aggregates(run);
        info!(
            event = "run_finished",
            run_id = %run_id,
            status = %status,
            completed_steps = run.completed_steps
        );
        self.gate.clear(run_id);

        let mut outcome = ApplyOutcome::touched(run_id);
        outcome.became_terminal = true;
        outcome
    }

    fn clear_clarification(&mut self, run_id: &str, clarification_id: &str) -> ApplyOutcome {
        let run = self.run_mut(run_id);
        let matches = run
            .pending_clarification
            .as_ref()
            .is_some_and(|pending| pending.clarification_id == clarification_id);
        if matches {
            run.pending_clarification = None;
            ApplyOutcome::touched(run_id)
        } else {
            ApplyOutcome::untouched(run_id)
        }
    }

    fn clear_clarification_anywhere(&mut self, clarification_id: &str) -> ApplyOutcome {
        let owner = self.runs.values().find_map(|run| {
            run.pending_clarification
                .as_ref()
                .filter(|pending| pending.clarification_id == clarification_id)
                .map(|_| run.id.clone())
        });
        match owner {
            Some(run_id) => self.clear_clarification(&run_id, clarification_id),
            None => ApplyOutcome::default(),
        }
    }
}

fn step_update_from_payload(payload: &StepUpdatePayload, fallback_at: DateTime<Utc>) -> StepUpdate {
    let status = match payload.status.as_deref() {
        Some(raw) => raw.parse::<StepStatus>().unwrap_or_else(|err| {
            warn!(event = "step_status_unrecognized", error = %err);
            StepStatus::Active
        }),
        None => StepStatus::Active,
    };
    let observed_at = payload
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(fallback_at);
    StepUpdate {
        raw_id: non_empty(payload.step_id.as_deref()),
        tool_name: non_empty(payload.tool_name.as_deref()),
        name: non_empty(payload.step_name.as_deref()),
        status,
        observed_at,
        progress: payload.progress_percentage,
        output: payload.output.clone(),
        error: non_empty(payload.error.as_deref()),
        execution_time_ms: payload.execution_time_ms,
        logs: payload
            .logs
            .iter()
            .map(|log| step_log(log, observed_at))
            .collect(),
    }
}

fn step_log(log: &StepLogPayload, fallback_at: DateTime<Utc>) -> StepLog {
    StepLog {
        timestamp: log
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(fallback_at),
        message: log.message.clone(),
    }
}

fn terminal_for(error: Option<&str>) -> RunStatus {
    if error.is_some() {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    }
}

fn mark_running(run: &mut WorkflowRun) {
    if run.status == RunStatus::Pending {
        run.status = RunStatus::Running;
    }
}

fn raise_progress(run: &mut WorkflowRun, progress: f64) {
    if progress.is_finite() {
        run.progress = run.progress.max(progress.clamp(0.0, 100.0));
    }
}

fn refresh_aggregates(run: &mut WorkflowRun) {
    run.completed_steps = run
        .steps
        .iter()
        .filter(|step| matches!(step.status, StepStatus::Completed | StepStatus::Skipped))
        .count();
    run.total_steps = run.total_steps.max(run.steps.len());
    if run.total_steps > 0 {
        let derived = run.completed_steps as f64 * 100.0 / run.total_steps as f64;
        raise_progress(run, derived);
    }
    if let Some(active) = run
        .steps
        .iter()
        .rev()
        .find(|step| matches!(step.status, StepStatus::Active | StepStatus::Waiting))
    {
        run.current_step = Some(active.id.clone());
    }
}
