//! The stream reconciler: one request/response cycle per submitted input.
//!
//! Each submission runs on its own task as an explicit state machine over
//! {cancellation, fragment arrival, stall deadline}. Transport failures are
//! retried with a fixed backoff and a fresh buffer; a stall is treated as
//! soft stream completion so a partial answer is preserved rather than lost;
//! the commit is issued at most once behind the session's commit guard.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use murmur_gateway::{AppendTurn, HistoryEntry, PersistenceGateway, Turn, TurnRole};
use murmur_providers::{ChatSession, FragmentStream, Message, MessageRole, ModelProvider};

use crate::config::ReconcilerConfig;
use crate::error_handling::ErrorKind;
use crate::events::{TurnEvent, TurnEvents};
use crate::session::StreamSession;
use crate::throttle::UpdateThrottle;

/// One user-submitted input against an existing chat.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub chat_id: String,
    /// Stored history as of submission. Exactly one prior entry means the
    /// question was already persisted at chat creation and the commit omits
    /// it (first-turn replay).
    pub history: Vec<HistoryEntry>,
    pub input: String,
    pub image_ref: Option<String>,
}

/// Handle for tearing down an in-flight session. Cancellation stops fragment
/// processing, aborts any backoff or stall sleep, and suppresses a pending
/// commit.
pub struct TurnHandle {
    cancel: CancellationToken,
    session_id: String,
}

impl TurnHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

pub struct Reconciler {
    provider: Arc<dyn ModelProvider>,
    gateway: Arc<dyn PersistenceGateway>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        gateway: Arc<dyn PersistenceGateway>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            provider,
            gateway,
            config,
        }
    }

    /// Start one stream session. The caller must not overlap submissions
    /// against the same chat; awaiting the event stream until a terminal
    /// event enforces that naturally.
    pub fn submit(&self, request: SubmitRequest) -> (TurnHandle, TurnEvents) {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let session = StreamSession::new();
        let session_id = session.id().to_string();

        let worker = SessionWorker {
            provider: Arc::clone(&self.provider),
            gateway: Arc::clone(&self.gateway),
            config: self.config.clone(),
            cancel: cancel.clone(),
            tx,
            session,
            throttle: UpdateThrottle::new(self.config.update_throttle()),
            request,
        };
        tokio::spawn(worker.run());

        (TurnHandle { cancel, session_id }, ReceiverStream::new(rx))
    }
}

/// Why one streaming attempt stopped consuming fragments.
enum StreamEnd {
    /// Fragment source exhausted cleanly.
    Completed,
    /// No fragment within the stall deadline; soft completion.
    Stalled,
    /// Transport failure at open or mid-stream.
    Transport(String),
    Cancelled,
}

struct SessionWorker {
    provider: Arc<dyn ModelProvider>,
    gateway: Arc<dyn PersistenceGateway>,
    config: ReconcilerConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<TurnEvent>,
    session: StreamSession,
    throttle: UpdateThrottle,
    request: SubmitRequest,
}

impl SessionWorker {
    async fn run(mut self) {
        debug!(
            session = %self.session.id(),
            chat = %self.request.chat_id,
            "starting stream session"
        );

        loop {
            let attempt = self.session.begin_attempt();
            self.throttle.reset();
            if attempt > 1 {
                debug!(attempt, "re-entering streaming with a fresh buffer");
            }

            let chat = ChatSession::new(
                Arc::clone(&self.provider),
                history_messages(&self.request.history),
            );
            let stream = match chat
                .send_streaming(&self.request.input, self.request.image_ref.as_deref())
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    if self.handle_transport_failure(e.to_string()).await {
                        continue;
                    }
                    return;
                }
            };

            match self.consume(stream).await {
                StreamEnd::Completed => {
                    debug!(
                        session = %self.session.id(),
                        chars = self.session.accumulated().len(),
                        "stream completed"
                    );
                    break;
                }
                StreamEnd::Stalled => {
                    warn!(
                        session = %self.session.id(),
                        stall_ms = self.config.stall_timeout_ms,
                        "no fragment within stall timeout, accepting accumulated text as final"
                    );
                    self.session.mark_stalled();
                    break;
                }
                StreamEnd::Transport(message) => {
                    if self.handle_transport_failure(message).await {
                        continue;
                    }
                    return;
                }
                StreamEnd::Cancelled => {
                    debug!(session = %self.session.id(), "session cancelled mid-stream");
                    return;
                }
            }
        }

        self.commit().await;
    }

    /// Consume fragments until clean end, stall, error, or cancellation.
    /// Fragments are processed in arrival order on this single task; the
    /// stall deadline is re-armed by every fragment.
    async fn consume(&mut self, mut stream: FragmentStream) -> StreamEnd {
        let stall = self.config.stall_timeout();
        let cancel = self.cancel.clone();
        let mut deadline = tokio::time::Instant::now() + stall;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return StreamEnd::Stalled,
                item = stream.next() => match item {
                    Some(Ok(fragment)) => {
                        deadline = tokio::time::Instant::now() + stall;
                        if !fragment.text.is_empty() {
                            self.session.apply_fragment(&fragment.text);
                            if self.throttle.offer(std::time::Instant::now()) {
                                self.emit_snapshot().await;
                            }
                        }
                        if fragment.finished {
                            return StreamEnd::Completed;
                        }
                    }
                    Some(Err(e)) => return StreamEnd::Transport(e.to_string()),
                    None => return StreamEnd::Completed,
                },
            }
        }
    }

    /// Returns true when the session should re-enter Streaming.
    async fn handle_transport_failure(&mut self, message: String) -> bool {
        if self.session.attempt() >= self.config.max_attempts {
            error!(
                session = %self.session.id(),
                attempt = self.session.attempt(),
                %message,
                "transport failure, retry budget exhausted"
            );
            self.session.mark_failed();
            self.emit(TurnEvent::Failed(ErrorKind::Transport(message))).await;
            return false;
        }

        warn!(
            session = %self.session.id(),
            attempt = self.session.attempt(),
            backoff_ms = self.config.retry_backoff_ms,
            %message,
            "transport failure, retrying"
        );

        // The backoff is a cancellation point: teardown must stop the retry.
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry_backoff()) => true,
        }
    }

    async fn commit(&mut self) {
        if self.cancel.is_cancelled() {
            debug!(session = %self.session.id(), "session cancelled, suppressing commit");
            return;
        }

        // The guard keeps the append at-most-once even if completion signals
        // were to race; losers stop here.
        if !self.session.begin_commit() {
            debug!(session = %self.session.id(), "commit already issued, skipping");
            return;
        }

        // Mandatory final flush: the presenter must see the full accumulation
        // before the terminal event.
        if self.throttle.take_pending() {
            self.emit_snapshot().await;
        }

        let question = if self.is_first_turn_replay() {
            None
        } else {
            Some(self.request.input.clone())
        };
        let payload = AppendTurn {
            question: question.clone(),
            answer: self.session.accumulated().to_string(),
            image_ref: self.request.image_ref.clone(),
        };

        match self.gateway.append_turn(&self.request.chat_id, payload).await {
            Ok(()) => {
                self.session.mark_committed();
                debug!(session = %self.session.id(), "turn committed");
                let turn = Turn {
                    question,
                    answer: self.session.accumulated().to_string(),
                    image_ref: self.request.image_ref.clone(),
                    committed_at: Utc::now(),
                };
                self.emit(TurnEvent::Committed(turn)).await;
            }
            Err(e) => {
                error!(session = %self.session.id(), error = %e, "append failed");
                self.session.mark_failed();
                self.emit(TurnEvent::Failed(ErrorKind::from_gateway(e))).await;
            }
        }
    }

    /// A newly created chat already holds the question as its only history
    /// entry; sending it again in the commit would duplicate it.
    fn is_first_turn_replay(&self) -> bool {
        self.request.history.len() == 1
    }

    async fn emit_snapshot(&self) {
        self.emit(TurnEvent::Update {
            text: self.session.accumulated().to_string(),
        })
        .await;
    }

    async fn emit(&self, event: TurnEvent) {
        if self.tx.send(event).await.is_err() {
            debug!(session = %self.session.id(), "event receiver dropped");
        }
    }
}

fn history_messages(history: &[HistoryEntry]) -> Vec<Message> {
    history
        .iter()
        .map(|entry| {
            let role = match entry.role {
                TurnRole::User => MessageRole::User,
                TurnRole::Model => MessageRole::Model,
            };
            Message {
                role,
                content: entry.text.clone(),
                image_ref: entry.image_ref.clone(),
            }
        })
        .collect()
}
