use crate::connection::{EventSource, SourceCore, CLEAN_CLOSE_CODE};
use crate::lock;
use crate::router::{Handler, Subscription};
use orderflow_core::wire::{event_types, stamp_outbound, ErrorKind, DEFAULT_MAX_FRAME_BYTES};
use orderflow_core::{ConnectionState, ConnectionStatus, Envelope};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(150);

const START_COMMAND: &str = "start_order_processing";
const CANCEL_COMMAND: &str = "cancel_processing";
const STATUS_COMMAND: &str = "get_processing_status";

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedEvent {
    pub delay: Duration,
    pub envelope: Envelope,
}

/// A scripted list of inbound frames, each delivered after its delay.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub run_id: String,
    pub events: Vec<ScriptedEvent>,
}

impl Scenario {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, delay: Duration, event_type: &str, data: Value) {
        let envelope = Envelope::new(event_type, data).with_run_id(self.run_id.clone());
        self.events.push(ScriptedEvent { delay, envelope });
    }

    pub fn total_delay(&self) -> Duration {
        self.events.iter().map(|event| event.delay).sum()
    }

    /// The happy path of one order, delivered the way the backend really
    /// delivers it: repeated extraction signals, a fresh raw id per update,
    /// tool names in varying casing, and stale `active` updates after a
    /// stage has completed.
    pub fn order_pipeline(run_id: &str, order_id: &str, step_delay: Duration) -> Self {
        let mut scenario = Scenario::new(run_id);
        let quick = step_delay / 5;
        let raw_id = |tool: &str| format!("{tool}_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let step = |tool: &str, status: &str| {
            json!({
                "run_id": run_id,
                "step_id": raw_id(tool),
                "step_name": tool,
                "tool_name": tool,
                "status": status,
            })
        };
        let finished = |tool: &str, output: Value| {
            let mut data = step(tool, "completed");
            data["output"] = output;
            data
        };

        scenario.push(
            Duration::ZERO,
            event_types::PROCESSING_STARTED,
            json!({"run_id": run_id, "order_id": order_id, "status": "started"}),
        );
        scenario.push(
            quick,
            event_types::PHASE_TRANSITION,
            json!({"run_id": run_id, "to_phase": "planning", "phase_description": "Building plan"}),
        );

        scenario.push(step_delay, event_types::STEP_UPDATE, step("OrderExtractionTool", "started"));
        scenario.push(quick, event_types::STEP_UPDATE, step("OrderExtractionTool", "processing"));
        scenario.push(quick, event_types::STEP_UPDATE, step("order_extraction_tool", "processing"));
        scenario.push(
            step_delay,
            event_types::STEP_UPDATE,
            finished(
                "order_extraction_tool",
                json!({"product": "industrial widget", "quantity": 40}),
            ),
        );

        for (tool, variant, output) in [
            ("ValidatorTool", "validatortool", json!({"valid": true})),
            ("Merge Fields Tool", "merge_fields_tool", json!({"merged": true})),
            ("Inventory Check Tool", "inventory_tool", json!({"in_stock": 120})),
            ("Pricing Calculator", "pricing_tool", json!({"unit_price_usd": 18.5})),
            ("Supplier Quote Tool", "supplier_tool", json!({"supplier": "Acme"})),
            ("LogisticsShippingTool", "logistics_tool", json!({"eta_days": 4})),
            ("Finance & Payment Tool", "finance_tool", json!({"taxes_usd": 59.2})),
        ] {
            scenario.push(step_delay, event_types::STEP_UPDATE, step(tool, "started"));
            scenario.push(step_delay, event_types::STEP_UPDATE, finished(variant, output));
        }

        scenario.push(
            step_delay,
            event_types::STEP_UPDATE,
            step("StripePaymentTool", "started"),
        );
        scenario.push(
            quick,
            event_types::PAYMENT_LINK,
            json!({
                "run_id": run_id,
                "order_id": order_id,
                "payment_link": format!("https://checkout.stripe.test/{order_id}"),
                "amount": 799.2,
                "currency": "USD",
            }),
        );
        scenario.push(
            step_delay,
            event_types::STEP_UPDATE,
            finished("stripe_payment_tool", json!({"payment_status": "paid"})),
        );
        scenario.push(
            quick,
            event_types::STEP_UPDATE,
            step("OrderExtractionTool", "active"),
        );

        scenario.push(step_delay, event_types::STEP_UPDATE, step("Order Tool", "started"));
        scenario.push(
            step_delay,
            event_types::STEP_UPDATE,
            finished("order_tool", json!({"order_record": order_id})),
        );

        let tx_hash = format!("0x{}", Uuid::new_v4().simple());
        scenario.push(
            step_delay,
            event_types::STEP_UPDATE,
            step("Blockchain Anchor Tool", "started"),
        );
        scenario.push(
            quick,
            event_types::BLOCKCHAIN_TX,
            json!({"run_id": run_id, "order_id": order_id, "tx_hash": tx_hash, "network": "demo"}),
        );
        scenario.push(
            step_delay,
            event_types::STEP_UPDATE,
            finished("blockchain:anchor", json!({"tx_hash": tx_hash})),
        );

        scenario.push(
            step_delay,
            event_types::STEP_UPDATE,
            step("portia:google:gmail:send_email", "started"),
        );
        scenario.push(
            step_delay,
            event_types::STEP_UPDATE,
            finished(
                "portia:google:gmail:send_email",
                json!({"status": "Email sent", "message_id": Uuid::new_v4().simple().to_string()}),
            ),
        );
        scenario.push(
            quick,
            event_types::STEP_UPDATE,
            step("StripePaymentTool", "active"),
        );

        scenario.push(
            step_delay,
            event_types::FINAL_OUTPUT,
            json!({
                "run_id": run_id,
                "status": "completed",
                "output": {"order_id": order_id, "transaction_hash": tx_hash},
            }),
        );
        scenario.push(
            quick,
            event_types::PROCESSING_COMPLETED,
            json!({"run_id": run_id, "message": "Order processed"}),
        );
        scenario
    }
}

#[derive(Default)]
struct Playback {
    task: Option<JoinHandle<()>>,
    run_id: Option<String>,
    queued: Option<Scenario>,
    autoplay: bool,
    sent: Vec<Value>,
}

struct SimShared {
    core: SourceCore,
    step_delay: Duration,
    playback: Mutex<Playback>,
}

/// Scripted stand-in for the live connection. Replays a [`Scenario`] when an
/// order is started, or on connect when autoplay is set.
#[derive(Clone)]
pub struct SimulatedSource {
    shared: Arc<SimShared>,
}

impl SimulatedSource {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_step_delay(client_id, DEFAULT_STEP_DELAY)
    }

    /// `step_delay` paces the scenarios generated for `start_order_processing`.
    pub fn with_step_delay(client_id: impl Into<String>, step_delay: Duration) -> Self {
        Self {
            shared: Arc::new(SimShared {
                core: SourceCore::new(client_id.into(), DEFAULT_MAX_FRAME_BYTES),
                step_delay,
                playback: Mutex::new(Playback::default()),
            }),
        }
    }

    /// Play `scenario` for the next `start_order_processing` command.
    pub fn queue(&self, scenario: Scenario) {
        lock(&self.shared.playback).queued = Some(scenario);
    }

    /// Play `scenario` as soon as the source connects.
    pub fn autoplay(&self, scenario: Scenario) {
        let mut playback = lock(&self.shared.playback);
        playback.queued = Some(scenario);
        playback.autoplay = true;
    }

    /// Every stamped payload accepted by `send_message`.
    pub fn sent_messages(&self) -> Vec<Value> {
        lock(&self.shared.playback).sent.clone()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.shared.playback)
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Deliver one frame immediately, as if the backend had sent it.
    pub fn inject(&self, envelope: Envelope) {
        self.shared.core.receive(envelope);
    }

    pub fn inject_text(&self, text: &str) -> bool {
        self.shared.core.receive_text(text)
    }

    fn play(&self, scenario: Scenario) {
        let mut playback = lock(&self.shared.playback);
        if let Some(previous) = playback.task.take() {
            previous.abort();
        }
        info!(
            event = "scenario_started",
            run_id = %scenario.run_id,
            frames = scenario.events.len()
        );
        playback.run_id = Some(scenario.run_id.clone());
        let shared = Arc::clone(&self.shared);
        playback.task = Some(tokio::spawn(async move {
            for scripted in scenario.events {
                if !scripted.delay.is_zero() {
                    tokio::time::sleep(scripted.delay).await;
                }
                if shared.core.status() != ConnectionStatus::Connected {
                    debug!(event = "scenario_interrupted", run_id = %scenario.run_id);
                    return;
                }
                let mut envelope = scripted.envelope;
                envelope.timestamp = chrono::Utc::now().to_rfc3339();
                shared.core.receive(envelope);
            }
            debug!(event = "scenario_finished", run_id = %scenario.run_id);
        }));
    }

    fn handle_command(&self, payload: &Value) {
        let command = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        match command {
            START_COMMAND => {
                let queued = lock(&self.shared.playback).queued.take();
                let scenario = queued.unwrap_or_else(|| {
                    let run_id = format!("run-{}", Uuid::new_v4().simple());
                    let order_id = format!("ORD-{}", &Uuid::new_v4().simple().to_string()[..6])
                        .to_uppercase();
                    Scenario::order_pipeline(&run_id, &order_id, self.shared.step_delay)
                });
                self.play(scenario);
            }
            CANCEL_COMMAND => {
                let run_id = data
                    .get("run_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let active = {
                    let mut playback = lock(&self.shared.playback);
                    let matches = run_id.is_none() || run_id == playback.run_id;
                    if matches {
                        if let Some(task) = playback.task.take() {
                            task.abort();
                        }
                    }
                    playback.run_id.clone().filter(|_| matches)
                };
                if let Some(run_id) = active {
                    self.shared.core.receive(
                        Envelope::new(
                            event_types::FINAL_OUTPUT,
                            json!({"run_id": run_id, "status": "cancelled", "error": "Processing cancelled"}),
                        )
                        .with_run_id(run_id.clone()),
                    );
                }
            }
            STATUS_COMMAND => {
                let run_id = lock(&self.shared.playback).run_id.clone();
                if let Some(run_id) = run_id {
                    let status = if self.is_playing() { "running" } else { "completed" };
                    self.shared.core.receive(
                        Envelope::new(
                            event_types::PROCESSING_STATUS,
                            json!({"run_id": run_id, "status": status}),
                        )
                        .with_run_id(run_id.clone()),
                    );
                }
            }
            _ => {}
        }
    }
}

impl EventSource for SimulatedSource {
    fn connect(&self) {
        if matches!(
            self.shared.core.status(),
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            return;
        }
        self.shared.core.mark_open();
        info!(event = "simulated_connected", client_id = %self.shared.core.client_id());
        self.shared.core.emit_connected(None);

        let autoplay = {
            let mut playback = lock(&self.shared.playback);
            if playback.autoplay {
                playback.autoplay = false;
                playback.queued.take()
            } else {
                None
            }
        };
        if let Some(scenario) = autoplay {
            self.play(scenario);
        }
    }

    fn disconnect(&self) {
        if let Some(task) = lock(&self.shared.playback).task.take() {
            task.abort();
        }
        if self.shared.core.status() == ConnectionStatus::Disconnected {
            return;
        }
        self.shared.core.set_status(ConnectionStatus::Disconnected);
        self.shared
            .core
            .emit_disconnected(CLEAN_CLOSE_CODE, "client disconnect", false);
    }

    fn send_message(&self, payload: Value) -> bool {
        if self.shared.core.status() != ConnectionStatus::Connected {
            self.shared.core.emit_error(
                ErrorKind::SendError,
                "send attempted while the connection is not open",
            );
            return false;
        }
        let timestamp = chrono::Utc::now().to_rfc3339();
        let stamped = stamp_outbound(payload.clone(), &self.shared.core.client_id(), &timestamp);
        lock(&self.shared.playback).sent.push(stamped);
        self.shared.core.record_sent();
        self.handle_command(&payload);
        true
    }

    fn subscribe(&self, event_type: &str, handler: Handler) -> Subscription {
        self.shared.core.router().subscribe(event_type, handler)
    }

    fn state(&self) -> ConnectionState {
        self.shared.core.snapshot()
    }
}
