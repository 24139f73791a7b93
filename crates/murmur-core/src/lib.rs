//! Core streaming turn reconciliation for murmur.
//!
//! The reconciler drives one request/response cycle against a model session:
//! it consumes the fragment stream, accumulates text, detects stalls, retries
//! transport failures, and commits the completed turn to the persistence
//! gateway exactly once.

pub mod config;
pub mod error_handling;
pub mod events;
pub mod reconciler;
pub mod session;
pub mod throttle;

pub use config::{Config, GatewayConfig, ProviderConfig, ReconcilerConfig};
pub use error_handling::ErrorKind;
pub use events::{TurnEvent, TurnEvents};
pub use reconciler::{Reconciler, SubmitRequest, TurnHandle};
pub use session::{CommitGuard, SessionStatus, StreamSession};
pub use throttle::UpdateThrottle;
