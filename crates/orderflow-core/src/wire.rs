use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Wildcard channel that receives every inbound envelope.
pub const MESSAGE_CHANNEL: &str = "message";

pub mod event_types {
    pub const PROCESSING_STARTED: &str = "processing_started";
    pub const PROCESSING_STATUS: &str = "processing_status";
    pub const PROCESSING_COMPLETED: &str = "processing_completed";
    pub const STEP_UPDATE: &str = "step_update";
    pub const PHASE_TRANSITION: &str = "phase_transition";
    pub const PROGRESS_UPDATE: &str = "progress_update";
    pub const CLARIFICATION_REQUEST: &str = "clarification_request";
    pub const CLARIFICATION_RESPONSE: &str = "clarification_response";
    pub const CLARIFICATION_TIMEOUT: &str = "clarification_timeout";
    pub const CLARIFICATION_ACKNOWLEDGED: &str = "clarification_acknowledged";
    pub const PAYMENT_LINK: &str = "payment_link";
    pub const BLOCKCHAIN_TX: &str = "blockchain_tx";
    pub const FINAL_OUTPUT: &str = "final_output";
    pub const ERROR: &str = "error";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const CONNECTION_ACKNOWLEDGED: &str = "connection_acknowledged";
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const CONNECTION_ERROR: &str = "connection_error";
    pub const PING: &str = "ping";
}

pub const KNOWN_EVENT_TYPES: &[&str] = &[
    event_types::PROCESSING_STARTED,
    event_types::PROCESSING_STATUS,
    event_types::PROCESSING_COMPLETED,
    event_types::STEP_UPDATE,
    event_types::PHASE_TRANSITION,
    event_types::PROGRESS_UPDATE,
    event_types::CLARIFICATION_REQUEST,
    event_types::CLARIFICATION_RESPONSE,
    event_types::CLARIFICATION_TIMEOUT,
    event_types::CLARIFICATION_ACKNOWLEDGED,
    event_types::PAYMENT_LINK,
    event_types::BLOCKCHAIN_TX,
    event_types::FINAL_OUTPUT,
    event_types::ERROR,
    event_types::HEARTBEAT,
    event_types::CONNECTION_ACKNOWLEDGED,
    event_types::CONNECTED,
    event_types::DISCONNECTED,
    event_types::CONNECTION_ERROR,
];

/// Machine-readable `error_type` values for locally generated error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionError,
    ParseError,
    SendError,
    ConnectionFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::SendError => "send_error",
            ErrorKind::ConnectionFailed => "connection_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now().to_rfc3339(),
            correlation_id: None,
            run_id: None,
            client_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Local diagnostic event on the `error` channel.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(
            event_types::ERROR,
            json!({
                "error_type": kind.as_str(),
                "error_code": kind.as_str(),
                "message": message.into(),
                "recoverable": true,
            }),
        )
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        crate::parse_timestamp(&self.timestamp)
    }

    /// Decode into the typed event union. Unrecognized types yield `Ok(None)`.
    pub fn decode_event(&self) -> Result<Option<WorkflowEvent>, FrameError> {
        if !KNOWN_EVENT_TYPES.contains(&self.event_type.as_str()) {
            return Ok(None);
        }
        let data = match &self.data {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        let tagged = json!({ "type": self.event_type, "data": data });
        serde_json::from_value(tagged)
            .map(Some)
            .map_err(|err| FrameError::Payload {
                event_type: self.event_type.clone(),
                reason: err.to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ProcessingStarted(ProcessingStartedPayload),
    ProcessingStatus(ProcessingStatusPayload),
    ProcessingCompleted(ProcessingCompletedPayload),
    StepUpdate(StepUpdatePayload),
    PhaseTransition(PhaseTransitionPayload),
    ProgressUpdate(ProgressUpdatePayload),
    ClarificationRequest(ClarificationRequestPayload),
    ClarificationResponse(ClarificationResponsePayload),
    ClarificationTimeout(ClarificationTimeoutPayload),
    ClarificationAcknowledged(ClarificationAcknowledgedPayload),
    PaymentLink(PaymentLinkPayload),
    BlockchainTx(BlockchainTxPayload),
    FinalOutput(FinalOutputPayload),
    Error(ErrorPayload),
    Heartbeat(HeartbeatPayload),
    ConnectionAcknowledged(ConnectionAcknowledgedPayload),
    Connected(ConnectedPayload),
    Disconnected(DisconnectedPayload),
    ConnectionError(ErrorPayload),
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::ProcessingStarted(_) => event_types::PROCESSING_STARTED,
            WorkflowEvent::ProcessingStatus(_) => event_types::PROCESSING_STATUS,
            WorkflowEvent::ProcessingCompleted(_) => event_types::PROCESSING_COMPLETED,
            WorkflowEvent::StepUpdate(_) => event_types::STEP_UPDATE,
            WorkflowEvent::PhaseTransition(_) => event_types::PHASE_TRANSITION,
            WorkflowEvent::ProgressUpdate(_) => event_types::PROGRESS_UPDATE,
            WorkflowEvent::ClarificationRequest(_) => event_types::CLARIFICATION_REQUEST,
            WorkflowEvent::ClarificationResponse(_) => event_types::CLARIFICATION_RESPONSE,
            WorkflowEvent::ClarificationTimeout(_) => event_types::CLARIFICATION_TIMEOUT,
            WorkflowEvent::ClarificationAcknowledged(_) => {
                event_types::CLARIFICATION_ACKNOWLEDGED
            }
            WorkflowEvent::PaymentLink(_) => event_types::PAYMENT_LINK,
            WorkflowEvent::BlockchainTx(_) => event_types::BLOCKCHAIN_TX,
            WorkflowEvent::FinalOutput(_) => event_types::FINAL_OUTPUT,
            WorkflowEvent::Error(_) => event_types::ERROR,
            WorkflowEvent::Heartbeat(_) => event_types::HEARTBEAT,
            WorkflowEvent::ConnectionAcknowledged(_) => event_types::CONNECTION_ACKNOWLEDGED,
            WorkflowEvent::Connected(_) => event_types::CONNECTED,
            WorkflowEvent::Disconnected(_) => event_types::DISCONNECTED,
            WorkflowEvent::ConnectionError(_) => event_types::CONNECTION_ERROR,
        }
    }

    /// Run id carried inside the payload, if any.
    pub fn run_id(&self) -> Option<&str> {
        let run_id = match self {
            WorkflowEvent::ProcessingStarted(p) => p.run_id.as_deref(),
            WorkflowEvent::ProcessingStatus(p) => p.run_id.as_deref(),
            WorkflowEvent::ProcessingCompleted(p) => p.run_id.as_deref(),
            WorkflowEvent::StepUpdate(p) => p.run_id.as_deref(),
            WorkflowEvent::PhaseTransition(p) => p.run_id.as_deref(),
            WorkflowEvent::ProgressUpdate(p) => p.run_id.as_deref(),
            WorkflowEvent::ClarificationRequest(p) => p.run_id.as_deref(),
            WorkflowEvent::ClarificationResponse(p) => p.run_id.as_deref(),
            WorkflowEvent::ClarificationTimeout(p) => p.run_id.as_deref(),
            WorkflowEvent::PaymentLink(p) => p.run_id.as_deref(),
            WorkflowEvent::BlockchainTx(p) => p.run_id.as_deref(),
            WorkflowEvent::FinalOutput(p) => p.run_id.as_deref(),
            WorkflowEvent::Error(p) | WorkflowEvent::ConnectionError(p) => p.run_id.as_deref(),
            WorkflowEvent::ClarificationAcknowledged(_)
            | WorkflowEvent::Heartbeat(_)
            | WorkflowEvent::ConnectionAcknowledged(_)
            | WorkflowEvent::Connected(_)
            | WorkflowEvent::Disconnected(_) => None,
        };
        run_id.filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingStartedPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub total_steps: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingStatusPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress_percentage: Option<f64>,
    #[serde(default)]
    pub steps_completed: Option<usize>,
    #[serde(default)]
    pub total_steps: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingCompletedPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub final_output: Option<Value>,
    #[serde(default)]
    pub processing_time_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepLogPayload {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepUpdatePayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default, alias = "id")]
    pub step_id: Option<String>,
    #[serde(default, alias = "name")]
    pub step_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "progress")]
    pub progress_percentage: Option<f64>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "toolName")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub logs: Vec<StepLogPayload>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseTransitionPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub from_phase: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub to_phase: String,
    #[serde(default)]
    pub phase_description: Option<String>,
    #[serde(default)]
    pub estimated_duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressUpdatePayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub progress_percentage: Option<f64>,
    #[serde(default)]
    pub estimated_time_remaining_seconds: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClarificationRequestPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    pub clarification_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub question: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: Vec<String>,
    #[serde(default)]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClarificationResponsePayload {
    #[serde(default)]
    pub run_id: Option<String>,
    pub clarification_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub response: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClarificationTimeoutPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    pub clarification_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClarificationAcknowledgedPayload {
    pub clarification_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentLinkPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default, alias = "url", alias = "link")]
    pub payment_link: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockchainTxPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default, alias = "transaction_hash", alias = "hash")]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub explorer_url: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FinalOutputPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "result")]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub recoverable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub server_status: Option<String>,
    #[serde(default)]
    pub active_connections: Option<u64>,
    #[serde(default)]
    pub active_processing_sessions: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionAcknowledgedPayload {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub server_capabilities: Vec<String>,
}

/// Synthetic event emitted when a transport opens. The recovery data is
/// opaque and only plumbed through to listeners.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectedPayload {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub has_recovery_data: bool,
    #[serde(default)]
    pub recovery_data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectedPayload {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub will_reconnect: bool,
}

/// Commands the dashboard sends to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    StartOrderProcessing {
        order_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
    CancelProcessing {
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    GetProcessingStatus {
        run_id: String,
    },
    ClarificationResponse {
        clarification_id: String,
        response: String,
    },
}

impl ClientCommand {
    pub fn to_payload(&self) -> Result<Value, FrameError> {
        serde_json::to_value(self).map_err(|err| FrameError::Encode(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame is missing a type")]
    MissingType,
    #[error("invalid {event_type} payload: {reason}")]
    Payload { event_type: String, reason: String },
}

pub fn decode_envelope(text: &str, max_frame_bytes: usize) -> Result<Envelope, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    if envelope.event_type.trim().is_empty() {
        return Err(FrameError::MissingType);
    }
    Ok(envelope)
}

/// The backend writes unset optionals as `null`; read those as the default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Merge `timestamp` and `client_id` into an outbound payload. Non-object
/// payloads are wrapped under `data`.
pub fn stamp_outbound(payload: Value, client_id: &str, timestamp: &str) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    object.insert("timestamp".to_string(), Value::String(timestamp.to_string()));
    object.insert("client_id".to_string(), Value::String(client_id.to_string()));
    Value::Object(object)
}

pub fn encode_outbound(
    payload: Value,
    client_id: &str,
    timestamp: &str,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    let stamped = stamp_outbound(payload, client_id, timestamp);
    let encoded =
        serde_json::to_string(&stamped).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn heartbeat_payload() -> Value {
    json!({ "type": event_types::PING })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_step_update_with_backend_field_names() {
        let envelope = decode_envelope(
            r#"{
                "type": "step_update",
                "data": {
                    "step_id": "OrderExtractionTool_8c1d2e3f",
                    "step_name": "OrderExtractionTool",
                    "status": "started",
                    "tool_name": "order_extraction_tool"
                },
                "timestamp": "2026-02-07T21:00:00Z",
                "run_id": "run-1",
                "correlation_id": "corr-9"
            }"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode envelope");
        assert_eq!(envelope.run_id.as_deref(), Some("run-1"));
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr-9"));
        assert!(envelope.parsed_timestamp().is_some());

        let Some(WorkflowEvent::StepUpdate(step)) = envelope.decode_event().expect("typed")
        else {
            panic!("expected step update");
        };
        assert_eq!(step.step_id.as_deref(), Some("OrderExtractionTool_8c1d2e3f"));
        assert_eq!(step.tool_name.as_deref(), Some("order_extraction_tool"));
        assert_eq!(step.status.as_deref(), Some("started"));
    }

    #[test]
    fn dashboard_style_aliases_are_accepted() {
        let envelope = Envelope::new(
            event_types::STEP_UPDATE,
            json!({"id": "a1", "toolName": "StripePaymentTool", "progress": 40.0}),
        );
        let Some(WorkflowEvent::StepUpdate(step)) = envelope.decode_event().expect("typed")
        else {
            panic!("expected step update");
        };
        assert_eq!(step.step_id.as_deref(), Some("a1"));
        assert_eq!(step.tool_name.as_deref(), Some("StripePaymentTool"));
        assert_eq!(step.progress_percentage, Some(40.0));
    }

    #[test]
    fn every_known_type_decodes_from_minimal_data() {
        for event_type in KNOWN_EVENT_TYPES {
            let data = match *event_type {
                event_types::CLARIFICATION_REQUEST
                | event_types::CLARIFICATION_RESPONSE
                | event_types::CLARIFICATION_TIMEOUT
                | event_types::CLARIFICATION_ACKNOWLEDGED => json!({"clarification_id": "c-1"}),
                _ => Value::Null,
            };
            let envelope = Envelope::new(*event_type, data);
            let event = envelope
                .decode_event()
                .unwrap_or_else(|err| panic!("{event_type}: {err}"))
                .expect("known type");
            assert_eq!(event.event_type(), *event_type);
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let envelope = Envelope::new("server_debug", json!({"anything": 1}));
        assert_eq!(envelope.decode_event(), Ok(None));
    }

    #[test]
    fn payload_run_id_is_exposed() {
        let envelope = Envelope::new(
            event_types::FINAL_OUTPUT,
            json!({"run_id": "run-7", "status": "completed", "result": {"ok": true}}),
        );
        let event = envelope.decode_event().expect("decode").expect("typed");
        assert_eq!(event.run_id(), Some("run-7"));
        let WorkflowEvent::FinalOutput(payload) = event else {
            panic!("expected final output");
        };
        assert_eq!(payload.output, Some(json!({"ok": true})));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            decode_envelope("not json", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        assert!(matches!(
            decode_envelope(r#"{"type": "  ", "data": {}}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::MissingType)
        ));
        let oversized = format!(r#"{{"type":"x","data":"{}"}}"#, "x".repeat(200));
        assert!(matches!(
            decode_envelope(&oversized, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn bad_payload_shape_reports_event_type() {
        let envelope = Envelope::new(event_types::STEP_UPDATE, json!({"progress": "lots"}));
        match envelope.decode_event() {
            Err(FrameError::Payload { event_type, .. }) => assert_eq!(event_type, "step_update"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn outbound_payloads_are_stamped() {
        let command = ClientCommand::StartOrderProcessing {
            order_text: "10 widgets to Berlin".to_string(),
            options: None,
        };
        let encoded = encode_outbound(
            command.to_payload().expect("payload"),
            "dashboard-1",
            "2026-02-07T21:00:00Z",
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["type"], "start_order_processing");
        assert_eq!(value["data"]["order_text"], "10 widgets to Berlin");
        assert_eq!(value["client_id"], "dashboard-1");
        assert_eq!(value["timestamp"], "2026-02-07T21:00:00Z");

        let wrapped = stamp_outbound(json!("bare"), "c", "t");
        assert_eq!(wrapped["data"], "bare");

        let ping = stamp_outbound(heartbeat_payload(), "c", "t");
        assert_eq!(ping, json!({"type": "ping", "timestamp": "t", "client_id": "c"}));
    }

    #[test]
    fn local_error_envelope_carries_error_type() {
        let envelope = Envelope::error(ErrorKind::SendError, "socket closed");
        assert_eq!(envelope.event_type, "error");
        let Some(WorkflowEvent::Error(payload)) = envelope.decode_event().expect("decode") else {
            panic!("expected error");
        };
        assert_eq!(payload.error_type.as_deref(), Some("send_error"));
        assert_eq!(payload.message.as_deref(), Some("socket closed"));
    }

    #[test]
    fn null_optionals_decode_as_empty() {
        let envelope = decode_envelope(
            r#"{
                "type": "clarification_request",
                "data": {
                    "run_id": "run-1",
                    "clarification_id": "c-1",
                    "question": null,
                    "options": null,
                    "timeout_seconds": null,
                    "required": null
                },
                "timestamp": null,
                "correlation_id": null
            }"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("envelope");
        assert!(envelope.timestamp.is_empty());
        match envelope.decode_event().expect("decode") {
            Some(WorkflowEvent::ClarificationRequest(payload)) => {
                assert_eq!(payload.clarification_id, "c-1");
                assert!(payload.question.is_empty());
                assert!(payload.options.is_empty());
                assert_eq!(payload.required, None);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let ack = Envelope::new(
            "connection_acknowledged",
            serde_json::json!({"client_id": "dash-1", "server_capabilities": null}),
        );
        match ack.decode_event().expect("decode") {
            Some(WorkflowEvent::ConnectionAcknowledged(payload)) => {
                assert!(payload.server_capabilities.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn backend_isoformat_timestamps_parse_as_utc() {
        let mut envelope = Envelope::new("ping", Value::Null);
        envelope.timestamp = "2025-10-09T08:53:20.000000".to_string();
        assert_eq!(
            envelope.parsed_timestamp().map(|at| at.to_rfc3339()),
            Some("2025-10-09T08:53:20+00:00".to_string())
        );
    }
}
