use crate::resolver::{RawStepIdentity, StepIdentityResolver};
use crate::EngineError;
use chrono::{DateTime, Utc};
use orderflow_core::{has_content, non_empty, stage_position, Step, StepStatus, StepUpdate};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_SAME_TOOL_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_SUPPRESSION_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Bucket width for treating two updates from the same tool as one step.
    pub same_tool_window: Duration,
    /// How long repeated non-terminal updates for `suppressed_stage` are dropped.
    pub suppression_window: Duration,
    pub suppressed_stage: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            same_tool_window: DEFAULT_SAME_TOOL_WINDOW,
            suppression_window: DEFAULT_SUPPRESSION_WINDOW,
            suppressed_stage: orderflow_core::EXTRACTION_STAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    Inserted(String),
    Merged(String),
}

impl MergeAction {
    pub fn canonical_id(&self) -> &str {
        match self {
            MergeAction::Inserted(id) | MergeAction::Merged(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepReconciler {
    resolver: StepIdentityResolver,
    config: ReconcileConfig,
}

impl Default for StepReconciler {
    fn default() -> Self {
        Self::new(StepIdentityResolver::default(), ReconcileConfig::default())
    }
}

impl StepReconciler {
    pub fn new(resolver: StepIdentityResolver, config: ReconcileConfig) -> Self {
        Self { resolver, config }
    }

    pub fn resolver(&self) -> &StepIdentityResolver {
        &self.resolver
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Pure merge: returns the reconciled, pipeline-ordered collection. An
    /// update with no usable identifier is logged and leaves the input as is.
    pub fn merge(&self, existing: &[Step], incoming: &StepUpdate) -> Vec<Step> {
        let mut steps = existing.to_vec();
        if let Err(err) = self.reconcile(&mut steps, incoming) {
            warn!(event = "step_update_dropped", error = %err);
        }
        steps
    }

    /// In-place merge used by the run store.
    pub fn reconcile(
        &self,
        steps: &mut Vec<Step>,
        incoming: &StepUpdate,
    ) -> Result<MergeAction, EngineError> {
        let canonical = self
            .resolver
            .resolve_update(incoming)
            .ok_or(EngineError::UnidentifiedStep)?;

        let action = match self.find_duplicate(steps, &canonical, incoming) {
            Some(idx) => {
                merge_into(&mut steps[idx], incoming);
                debug!(
                    event = "step_merged",
                    canonical_id = %steps[idx].id,
                    status = %steps[idx].status
                );
                MergeAction::Merged(steps[idx].id.clone())
            }
            None => {
                steps.push(Step::from_update(&canonical, incoming));
                debug!(event = "step_inserted", canonical_id = %canonical);
                MergeAction::Inserted(canonical)
            }
        };
        sort_steps(steps);
        Ok(action)
    }

    fn find_duplicate(
        &self,
        steps: &[Step],
        canonical: &str,
        incoming: &StepUpdate,
    ) -> Option<usize> {
        if let Some(idx) = steps.iter().position(|step| step.id == canonical) {
            return Some(idx);
        }
        if let Some(raw_id) = non_empty(incoming.raw_id.as_deref()) {
            if let Some(idx) = steps.iter().position(|step| step.raw_ids.contains(&raw_id)) {
                return Some(idx);
            }
        }
        let tool_canonical = incoming
            .tool_name
            .as_deref()
            .and_then(|tool| self.resolver.resolve(&RawStepIdentity::tool(tool)))?;
        let bucket = self.time_bucket(incoming.observed_at);
        steps.iter().position(|step| {
            step.tool_name
                .as_deref()
                .and_then(|tool| self.resolver.resolve(&RawStepIdentity::tool(tool)))
                .is_some_and(|existing| existing == tool_canonical)
                && self.time_bucket(step.updated_at) == bucket
        })
    }

    fn time_bucket(&self, at: DateTime<Utc>) -> i64 {
        let width = self.config.same_tool_window.as_secs().max(1) as i64;
        at.timestamp().div_euclid(width)
    }
}

/// Fold `incoming` into `step` without ever moving down the status lattice.
fn merge_into(step: &mut Step, incoming: &StepUpdate) {
    let current_rank = step.status.lattice_rank();
    let incoming_rank = incoming.status.lattice_rank();
    if incoming_rank > current_rank
        || (incoming_rank == current_rank && !step.status.is_terminal())
    {
        step.status = incoming.status;
    }

    if incoming.status != StepStatus::Pending {
        step.start_time = Some(match step.start_time {
            Some(existing) => existing.min(incoming.observed_at),
            None => incoming.observed_at,
        });
    }
    if incoming.status.is_terminal() {
        step.end_time = Some(match step.end_time {
            Some(existing) => existing.max(incoming.observed_at),
            None => incoming.observed_at,
        });
    }

    let newer = incoming.observed_at >= step.updated_at;
    if let Some(output) = incoming.output.as_ref().filter(|value| has_content(value)) {
        if newer || step.output.is_none() {
            step.output = Some(output.clone());
        }
    }
    if let Some(error) = non_empty(incoming.error.as_deref()) {
        if newer || step.error.is_none() {
            step.error = Some(error);
        }
    }
    if let Some(tool_name) = non_empty(incoming.tool_name.as_deref()) {
        if newer || step.tool_name.is_none() {
            step.tool_name = Some(tool_name);
        }
    }
    if let Some(ms) = incoming.execution_time_ms {
        if newer || step.execution_time_ms.is_none() {
            step.execution_time_ms = Some(ms);
        }
    }

    step.progress = match (step.progress, incoming.progress) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => old.or(new),
    };

    if let Some(raw_id) = non_empty(incoming.raw_id.as_deref()) {
        if !step.raw_ids.contains(&raw_id) {
            step.raw_ids.push(raw_id);
        }
    }

    if !incoming.logs.is_empty() {
        step.logs.extend(incoming.logs.iter().cloned());
        step.logs.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message.cmp(&b.message))
        });
        step.logs.dedup();
    }

    if newer {
        step.updated_at = incoming.observed_at;
    }
}

/// Known stages in pipeline order; everything else after them in first-seen order.
pub fn sort_steps(steps: &mut [Step]) {
    steps.sort_by_key(|step| match stage_position(&step.id) {
        Some(position) => (0, position),
        None => (1, 0),
    });
}

/// Per-run gate that drops rapid-fire repeats of one noisy stage.
#[derive(Debug, Clone)]
pub struct SuppressionGate {
    stage: String,
    window: chrono::Duration,
    opened: HashMap<String, DateTime<Utc>>,
}

impl SuppressionGate {
    pub fn new(stage: impl Into<String>, window: Duration) -> Self {
        Self {
            stage: stage.into(),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero()),
            opened: HashMap::new(),
        }
    }

    /// Returns false when the update must be dropped. Terminal updates always
    /// pass so a stage can still finish inside the window.
    pub fn admit(
        &mut self,
        run_id: &str,
        canonical_id: &str,
        status: StepStatus,
        now: DateTime<Utc>,
    ) -> bool {
        if canonical_id != self.stage {
            return true;
        }
        match self.opened.get(run_id) {
            None => {
                self.opened.insert(run_id.to_string(), now);
                true
            }
            Some(opened_at) => {
                let within = now - *opened_at < self.window;
                !(within && !status.is_terminal())
            }
        }
    }

    pub fn clear(&mut self, run_id: &str) {
        self.opened.remove(run_id);
    }

    pub fn is_open(&self, run_id: &str) -> bool {
        self.opened.contains_key(run_id)
    }
}
