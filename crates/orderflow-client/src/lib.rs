pub mod connection;
pub mod dashboard;
pub mod router;
pub mod simulated;

use orderflow_core::wire::FrameError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub use connection::{
    reconnect_delay, ConnectionConfig, EventSource, RecoveryProvider, WsConnection,
};
pub use dashboard::DashboardSession;
pub use router::{EventRouter, Handler, RoutedEvent, Subscription};
pub use simulated::{Scenario, ScriptedEvent, SimulatedSource};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Handlers may panic while a lock is held; keep going with the inner value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
