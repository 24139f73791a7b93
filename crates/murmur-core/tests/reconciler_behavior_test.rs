//! Reconciler Behavior Integration Tests
//!
//! CHARACTERIZATION: These tests verify the observable behavior of the
//! stream reconciliation loop through its stable public interface
//! (Reconciler::submit and the resulting event stream).
//!
//! What these tests protect:
//! - Fragments accumulate in arrival order; the last update before a commit
//!   carries the full concatenation
//! - At most one append per session, even with trailing fragments after the
//!   completion marker
//! - Transport failures retry once with a fresh buffer under the default
//!   two-attempt budget, never a third attempt
//! - Stalls are soft completion: partial (or empty) text is committed
//! - First-turn replay omits the question from the commit payload
//! - Cancellation suppresses the commit and ends the event stream
//! - Commit and auth failures surface as terminal error kinds
//!
//! What these tests intentionally do NOT assert:
//! - Exact timing of stall or backoff waits (only that they resolve)
//! - Internal session state transitions (covered by unit tests)
//! - Provider wire formats (scripted provider stands in for the model)

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use murmur_core::{ErrorKind, Reconciler, ReconcilerConfig, SubmitRequest, TurnEvent, TurnEvents};
use murmur_gateway::{
    AppendTurn, Chat, ChatId, ChatSummary, GatewayError, HistoryEntry, PersistenceGateway,
};
use murmur_providers::{Fragment, FragmentStream, ModelProvider, TurnRequest};

// =============================================================================
// Scripted collaborators
// =============================================================================

/// One step of a scripted streaming attempt.
#[derive(Debug, Clone)]
enum Step {
    Text(&'static str),
    /// The model's explicit stop signal.
    Finish,
    /// Mid-stream transport failure.
    Error(&'static str),
    /// Stop sending without closing the channel (silent stall).
    Hang,
}

/// Provider that plays one script per attempt, in order. The last script
/// repeats if more attempts arrive than scripts were given.
struct ScriptedProvider {
    scripts: Mutex<Vec<Vec<Step>>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream_turn(&self, _request: TurnRequest) -> anyhow::Result<FragmentStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                scripts[0].clone()
            }
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Text(text) => {
                        let _ = tx
                            .send(Ok(Fragment {
                                text: text.to_string(),
                                finished: false,
                            }))
                            .await;
                    }
                    Step::Finish => {
                        // Keep playing the script: anything after the stop
                        // signal exercises the ignore-trailing-input path.
                        let _ = tx
                            .send(Ok(Fragment {
                                text: String::new(),
                                finished: true,
                            }))
                            .await;
                    }
                    Step::Error(message) => {
                        let _ = tx.send(Err(anyhow::anyhow!("{}", message))).await;
                        return;
                    }
                    Step::Hang => {
                        // Hold the sender open so the stream never closes.
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                }
            }
            // Dropping the sender is a clean end of stream.
        });

        Ok(ReceiverStream::new(rx))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-test"
    }
}

#[derive(Debug, Clone, Copy)]
enum FailMode {
    None,
    Server,
    Auth,
}

/// Gateway that records every append and can be told to fail them.
struct RecordingGateway {
    appended: Mutex<Vec<AppendTurn>>,
    append_calls: AtomicU32,
    fail: FailMode,
}

impl RecordingGateway {
    fn new(fail: FailMode) -> Arc<Self> {
        Arc::new(Self {
            appended: Mutex::new(Vec::new()),
            append_calls: AtomicU32::new(0),
            fail,
        })
    }

    fn append_calls(&self) -> u32 {
        self.append_calls.load(Ordering::SeqCst)
    }

    fn appended(&self) -> Vec<AppendTurn> {
        self.appended.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceGateway for RecordingGateway {
    async fn create_chat(&self, _question: &str) -> Result<ChatId, GatewayError> {
        Ok("chat-1".to_string())
    }

    async fn append_turn(&self, _chat_id: &str, payload: AppendTurn) -> Result<(), GatewayError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        match self.fail {
            FailMode::None => {
                self.appended.lock().unwrap().push(payload);
                Ok(())
            }
            FailMode::Server => Err(GatewayError::Http {
                status: 500,
                body: "Error adding conversation!".to_string(),
            }),
            FailMode::Auth => Err(GatewayError::Auth("token expired".to_string())),
        }
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Chat, GatewayError> {
        Ok(Chat {
            id: chat_id.to_string(),
            owner_id: "owner-1".to_string(),
            history: Vec::new(),
        })
    }

    async fn list_chats(&self) -> Result<Vec<ChatSummary>, GatewayError> {
        Ok(Vec::new())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        stall_timeout_ms: 200,
        max_attempts: 2,
        retry_backoff_ms: 20,
        update_throttle_ms: 0,
    }
}

fn request_with_history(history: Vec<HistoryEntry>) -> SubmitRequest {
    SubmitRequest {
        chat_id: "chat-1".to_string(),
        history,
        input: "what is streaming reconciliation?".to_string(),
        image_ref: None,
    }
}

fn follow_up_history() -> Vec<HistoryEntry> {
    vec![
        HistoryEntry::user("first question"),
        HistoryEntry::model("first answer"),
        HistoryEntry::user("second question"),
    ]
}

/// Collect every event until the worker closes the stream.
async fn drain(mut events: TurnEvents) -> Vec<TurnEvent> {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut out = Vec::new();
        while let Some(event) = events.next().await {
            out.push(event);
        }
        out
    })
    .await
    .expect("event stream did not terminate")
}

fn updates(events: &[TurnEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            TurnEvent::Update { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn committed_answer(events: &[TurnEvent]) -> Option<String> {
    events.iter().find_map(|event| match event {
        TurnEvent::Committed(turn) => Some(turn.answer.clone()),
        _ => None,
    })
}

// =============================================================================
// Tests: fragment accumulation and updates
// =============================================================================

mod fragment_accumulation {
    use super::*;

    /// The final update equals the in-order concatenation of all fragments.
    #[tokio::test]
    async fn fragments_concatenate_in_arrival_order() {
        let provider = ScriptedProvider::new(vec![vec![
            Step::Text("Hello"),
            Step::Text(", "),
            Step::Text("world"),
            Step::Finish,
        ]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        let updates = updates(&events);
        assert_eq!(updates.last().map(String::as_str), Some("Hello, world"));
        assert_eq!(
            committed_answer(&events).as_deref(),
            Some("Hello, world"),
            "committed answer should match accumulation"
        );
    }

    /// A large throttle window coalesces intermediate updates but never
    /// drops the final snapshot.
    #[tokio::test]
    async fn throttle_coalesces_but_flushes_final_snapshot() {
        let provider = ScriptedProvider::new(vec![vec![
            Step::Text("a"),
            Step::Text("b"),
            Step::Text("c"),
            Step::Finish,
        ]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let config = ReconcilerConfig {
            update_throttle_ms: 10_000,
            ..fast_config()
        };
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), config);

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        let updates = updates(&events);
        assert_eq!(
            updates,
            vec!["a".to_string(), "abc".to_string()],
            "first update goes out immediately, the rest coalesce into the final flush"
        );
        assert_eq!(committed_answer(&events).as_deref(), Some("abc"));
    }
}

// =============================================================================
// Tests: at-most-once commit
// =============================================================================

mod commit_once {
    use super::*;

    /// Fragments after the completion marker must not trigger a second
    /// append or extend the committed answer.
    #[tokio::test]
    async fn trailing_fragments_after_finish_are_ignored() {
        let provider = ScriptedProvider::new(vec![vec![
            Step::Text("the answer"),
            Step::Finish,
            Step::Text(" and more"),
        ]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        assert_eq!(gateway.append_calls(), 1, "exactly one append per session");
        assert_eq!(committed_answer(&events).as_deref(), Some("the answer"));
    }

    /// Every successful session appends exactly once.
    #[tokio::test]
    async fn clean_stream_end_appends_once() {
        let provider =
            ScriptedProvider::new(vec![vec![Step::Text("done"), Step::Finish]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        drain(events).await;

        assert_eq!(gateway.append_calls(), 1);
    }
}

// =============================================================================
// Tests: retry behavior
// =============================================================================

mod retry_behavior {
    use super::*;

    /// Transport error before any fragment, two-attempt budget: exactly one
    /// retry, then success.
    #[tokio::test]
    async fn transport_error_retries_once_then_succeeds() {
        let provider = ScriptedProvider::new(vec![
            vec![Step::Error("connection reset by peer")],
            vec![Step::Text("recovered"), Step::Finish],
        ]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        assert_eq!(provider.calls(), 2, "one retry after the original attempt");
        assert_eq!(committed_answer(&events).as_deref(), Some("recovered"));
    }

    /// Retries exhaust after the second failure - never a third attempt,
    /// never a commit.
    #[tokio::test]
    async fn exhausted_retries_fail_without_commit() {
        let provider = ScriptedProvider::new(vec![
            vec![Step::Error("connection reset")],
            vec![Step::Error("connection reset again")],
        ]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        assert_eq!(provider.calls(), 2, "never a third attempt");
        assert_eq!(gateway.append_calls(), 0, "no commit on terminal failure");
        assert!(
            matches!(events.last(), Some(TurnEvent::Failed(ErrorKind::Transport(_)))),
            "terminal event should be a transport failure: {:?}",
            events.last()
        );
    }

    /// A retry starts from an empty buffer; partial text from the failed
    /// attempt is discarded, not resumed.
    #[tokio::test]
    async fn retry_discards_partial_accumulation() {
        let provider = ScriptedProvider::new(vec![
            vec![Step::Text("doomed partial"), Step::Error("connection reset")],
            vec![Step::Text("clean"), Step::Finish],
        ]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        assert_eq!(committed_answer(&events).as_deref(), Some("clean"));
        let appended = gateway.appended();
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].answer, "clean");
    }
}

// =============================================================================
// Tests: stall handling
// =============================================================================

mod stall_handling {
    use super::*;

    /// Zero fragments within the stall window commits an empty answer.
    #[tokio::test]
    async fn stall_with_no_fragments_commits_empty_answer() {
        let provider = ScriptedProvider::new(vec![vec![Step::Hang]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        assert_eq!(gateway.append_calls(), 1);
        assert_eq!(committed_answer(&events).as_deref(), Some(""));
    }

    /// A stall after a delivered fragment commits exactly that partial text.
    #[tokio::test]
    async fn stall_after_partial_commits_partial_answer() {
        let provider =
            ScriptedProvider::new(vec![vec![Step::Text("partial answer"), Step::Hang]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        assert_eq!(committed_answer(&events).as_deref(), Some("partial answer"));
        assert_eq!(gateway.append_calls(), 1);
    }
}

// =============================================================================
// Tests: first-turn replay
// =============================================================================

mod first_turn_replay {
    use super::*;

    /// Exactly one prior history entry means the question was persisted at
    /// chat creation; the commit payload omits it.
    #[tokio::test]
    async fn single_entry_history_omits_question() {
        let provider = ScriptedProvider::new(vec![vec![Step::Text("answer"), Step::Finish]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let history = vec![HistoryEntry::user("the very first question")];
        let (_handle, events) = reconciler.submit(request_with_history(history));
        drain(events).await;

        let appended = gateway.appended();
        assert_eq!(appended.len(), 1);
        assert!(
            appended[0].question.is_none(),
            "first-turn replay must not duplicate the question"
        );
    }

    /// A follow-up turn carries its question in the payload.
    #[tokio::test]
    async fn follow_up_turn_carries_question() {
        let provider = ScriptedProvider::new(vec![vec![Step::Text("answer"), Step::Finish]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        drain(events).await;

        let appended = gateway.appended();
        assert_eq!(
            appended[0].question.as_deref(),
            Some("what is streaming reconciliation?")
        );
    }
}

// =============================================================================
// Tests: cancellation
// =============================================================================

mod cancellation {
    use super::*;

    /// Cancelling mid-stream suppresses the commit and ends the event
    /// stream without a terminal event.
    #[tokio::test]
    async fn cancel_mid_stream_suppresses_commit() {
        let provider = ScriptedProvider::new(vec![vec![Step::Text("partial"), Step::Hang]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let config = ReconcilerConfig {
            stall_timeout_ms: 60_000,
            ..fast_config()
        };
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), config);

        let (handle, mut events) = reconciler.submit(request_with_history(follow_up_history()));

        // Wait for the first update so the stream is known to be live.
        let first = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("no update before cancel");
        assert!(matches!(first, Some(TurnEvent::Update { .. })));

        handle.cancel();
        let rest = drain(events).await;

        assert!(
            !rest.iter().any(TurnEvent::is_terminal),
            "no terminal event after cancellation: {:?}",
            rest
        );
        assert_eq!(gateway.append_calls(), 0, "cancellation suppresses the commit");
    }

    /// Cancelling during the retry backoff stops the session without a
    /// second attempt.
    #[tokio::test]
    async fn cancel_during_backoff_stops_retry() {
        let provider = ScriptedProvider::new(vec![vec![Step::Error("connection reset")]]);
        let gateway = RecordingGateway::new(FailMode::None);
        let config = ReconcilerConfig {
            retry_backoff_ms: 60_000,
            ..fast_config()
        };
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), config);

        let (handle, events) = reconciler.submit(request_with_history(follow_up_history()));

        // Give the first attempt time to fail and enter the backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        let events = drain(events).await;

        assert_eq!(provider.calls(), 1, "backoff cancelled before the retry");
        assert!(!events.iter().any(TurnEvent::is_terminal));
        assert_eq!(gateway.append_calls(), 0);
    }
}

// =============================================================================
// Tests: commit failures
// =============================================================================

mod commit_failures {
    use super::*;

    /// A failed append surfaces as a terminal commit error; the text shown
    /// so far stays visible.
    #[tokio::test]
    async fn append_failure_surfaces_commit_error() {
        let provider =
            ScriptedProvider::new(vec![vec![Step::Text("the answer"), Step::Finish]]);
        let gateway = RecordingGateway::new(FailMode::Server);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        assert!(matches!(
            events.last(),
            Some(TurnEvent::Failed(ErrorKind::Commit(_)))
        ));
        assert_eq!(
            updates(&events).last().map(String::as_str),
            Some("the answer"),
            "partial answer stays visible after a commit failure"
        );
    }

    /// An auth rejection keeps its own kind.
    #[tokio::test]
    async fn auth_rejection_surfaces_auth_error() {
        let provider = ScriptedProvider::new(vec![vec![Step::Text("answer"), Step::Finish]]);
        let gateway = RecordingGateway::new(FailMode::Auth);
        let reconciler = Reconciler::new(provider.clone(), gateway.clone(), fast_config());

        let (_handle, events) = reconciler.submit(request_with_history(follow_up_history()));
        let events = drain(events).await;

        assert!(matches!(
            events.last(),
            Some(TurnEvent::Failed(ErrorKind::Auth(_)))
        ));
    }
}
