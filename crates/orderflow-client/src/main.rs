use anyhow::Context;
use clap::Parser;
use orderflow_client::{ConnectionConfig, DashboardSession, EventSource, SimulatedSource, WsConnection};
use orderflow_core::new_client_id;
use orderflow_engine::{
    CompletionConfig, CompletionDetector, CompletionNotice, CompletionSink, DetectionMode,
    WorkflowStore,
};
use std::{
    env,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";
const CONNECT_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "orderflow-dash", about = "Headless order workflow dashboard")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    client_id: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Replay a scripted order instead of connecting to a backend.
    #[arg(long)]
    simulate: bool,
    /// Order text to submit once connected.
    #[arg(long)]
    order: Option<String>,
    #[arg(long, default_value_t = 30)]
    heartbeat_interval: u64,
    #[arg(long, default_value_t = 5)]
    max_reconnect_attempts: u32,
    #[arg(long, default_value_t = 1000)]
    reconnect_delay_ms: u64,
    /// Only treat email as done once the step output confirms it was sent.
    #[arg(long)]
    strict_email: bool,
}

#[derive(Clone, Debug)]
struct RuntimeConfig {
    ws_url: String,
    client_id: String,
    simulate: bool,
    order: Option<String>,
    heartbeat_interval: Duration,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    detection_mode: DetectionMode,
    log_dir: String,
    log_stdout: bool,
}

/// Tees formatted log lines to stdout and the optional log file.
struct MultiWriter {
    stdout: bool,
    file: Option<Arc<StdMutex<File>>>,
}

/// Reports each finished order once.
struct LoggingSink;

impl CompletionSink for LoggingSink {
    fn on_completion(&self, notice: CompletionNotice) {
        info!(
            event = "order_completed",
            run_id = %notice.run_id,
            order_id = notice.order_id.as_deref().unwrap_or("-"),
            signal = %notice.signal,
            detected_at = %notice.detected_at.to_rfc3339()
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args);
    init_logging(&config);

    let source: Arc<dyn EventSource> = if config.simulate {
        Arc::new(SimulatedSource::new(config.client_id.clone()))
    } else {
        let mut connection = ConnectionConfig::new(&config.ws_url, config.client_id.clone())
            .with_context(|| format!("invalid websocket url {}", config.ws_url))?;
        connection.heartbeat_interval = config.heartbeat_interval;
        connection.max_reconnect_attempts = config.max_reconnect_attempts;
        connection.reconnect_base_delay = config.reconnect_delay;
        Arc::new(WsConnection::new(connection))
    };

    let detector = CompletionDetector::new(CompletionConfig {
        mode: config.detection_mode,
        ..CompletionConfig::default()
    });
    let session = DashboardSession::new(
        source,
        WorkflowStore::default(),
        detector,
        Arc::new(LoggingSink),
    );
    info!(
        event = "dashboard_started",
        client_id = %config.client_id,
        simulate = config.simulate,
        url = %config.ws_url
    );
    session.connect();

    if let Some(order) = config.order.clone() {
        if wait_for_connection(&session, CONNECT_WAIT).await {
            if session.start_order(order, None) {
                info!(event = "order_submitted");
            } else {
                warn!(event = "order_submit_failed");
            }
        } else {
            warn!(event = "order_not_submitted", reason = "connection not established");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    session.disconnect();

    for run in session.runs() {
        info!(
            event = "run_summary",
            run_id = %run.id,
            status = %run.status,
            progress = run.progress,
            completed_steps = run.completed_steps,
            total_steps = run.total_steps
        );
    }
    let stats = session.connection_state().stats;
    info!(
        event = "dashboard_stopped",
        messages_received = stats.messages_received,
        messages_sent = stats.messages_sent,
        reconnect_attempts = stats.reconnect_attempts
    );
    Ok(())
}

async fn wait_for_connection(session: &DashboardSession, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !session.is_connected() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    true
}

fn load_config(args: Args) -> RuntimeConfig {
    let ws_url = resolve_ws_url(&args.url);
    let client_id = resolve_client_id(&args.client_id);
    let log_dir = resolve_log_dir(&args.log_dir);
    let log_stdout = resolve_log_stdout(&log_dir);
    RuntimeConfig {
        ws_url,
        client_id,
        simulate: args.simulate,
        order: args.order.filter(|order| !order.trim().is_empty()),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        max_reconnect_attempts: args.max_reconnect_attempts,
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        detection_mode: if args.strict_email {
            DetectionMode::Strict
        } else {
            DetectionMode::Lenient
        },
        log_dir,
        log_stdout,
    }
}

fn init_logging(config: &RuntimeConfig) {
    let level = env::var("ORDERFLOW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = open_log_file(&config.log_dir, &config.client_id)
        .map_err(|err| eprintln!("log_file_error: {err}"))
        .ok()
        .flatten()
        .map(|file| Arc::new(StdMutex::new(file)));
    let stdout = config.log_stdout || file.is_none();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stdout,
        file: file.clone(),
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .try_init();
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            let _ = file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout {
            io::stdout().flush()?;
        }
        if let Some(file) = &self.file {
            file.lock().unwrap_or_else(PoisonError::into_inner).flush()?;
        }
        Ok(())
    }
}

/// `None` when no log directory is configured.
fn open_log_file(log_dir: &str, client_id: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("orderflow-dash-{}.log", sanitize_component(client_id)));
    OpenOptions::new().create(true).append(true).open(path).map(Some)
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn resolve_ws_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var("ORDERFLOW_WS_URL") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    DEFAULT_WS_URL.to_string()
}

fn resolve_client_id(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var("ORDERFLOW_CLIENT_ID") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    new_client_id()
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = env::var("ORDERFLOW_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

/// Without a log directory, stdout is the only sink.
fn resolve_log_stdout(log_dir: &str) -> bool {
    env::var("ORDERFLOW_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or_else(|| log_dir.trim().is_empty())
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
