//! Events observed by the presenter for one submission.

use murmur_gateway::Turn;
use tokio_stream::wrappers::ReceiverStream;

use crate::error_handling::ErrorKind;

#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Full accumulated snapshot, throttled. The last update before a commit
    /// always carries the complete text.
    Update { text: String },
    /// Terminal success: the turn is durably appended.
    Committed(Turn),
    /// Terminal failure. Partial text already shown is not rolled back.
    Failed(ErrorKind),
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Committed(_) | TurnEvent::Failed(_))
    }
}

pub type TurnEvents = ReceiverStream<TurnEvent>;
