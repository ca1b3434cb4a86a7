//! End-to-end turn scenarios: a scripted provider, a mock container
//! runtime, and an in-memory SQLite store. Each test asserts both the
//! emitted frame sequence and the persisted rows.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use dg_domain::config::Config;
use dg_domain::error::Result as DgResult;
use dg_domain::selection::Selection;
use dg_domain::stream::{BoxStream, StreamEvent};
use dg_domain::todo::{Todo, TodoStatus};
use dg_domain::tool::{Role, ToolCall};
use dg_gateway::auth::CurrentUser;
use dg_gateway::runtime::{run_turn, TurnEvent, TurnInput};
use dg_gateway::state::AppState;
use dg_providers::{ChatRequest, ChatResponse, LlmProvider};
use dg_sandbox::testing::MockRuntime;
use dg_store::entities::{ConversationState, MessageRole};
use dg_store::Repository;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Plays back one pre-programmed event script per `chat_stream` call, and
/// one canned response per `chat` call (the subagent loop is
/// non-streaming).
struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    chat_scripts: Mutex<VecDeque<ChatResponse>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Self::with_chat(scripts, vec![])
    }

    fn with_chat(scripts: Vec<Vec<StreamEvent>>, chats: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            chat_scripts: Mutex::new(chats.into()),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _req: &ChatRequest) -> DgResult<ChatResponse> {
        Ok(self.chat_scripts.lock().pop_front().unwrap_or(ChatResponse {
            content: "ok".into(),
            tool_calls: vec![],
            usage: None,
            finish_reason: Some("stop".into()),
        }))
    }

    async fn chat_stream(
        &self,
        _req: &ChatRequest,
    ) -> DgResult<BoxStream<'static, DgResult<StreamEvent>>> {
        let script = self.scripts.lock().pop_front().unwrap_or_else(|| {
            vec![StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            }]
        });
        Ok(Box::pin(futures_util::stream::iter(
            script.into_iter().map(Ok),
        )))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

fn token(text: &str) -> StreamEvent {
    StreamEvent::Token { text: text.into() }
}

fn call(id: &str, name: &str, args: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCallFinished {
        call_id: id.into(),
        tool_name: name.into(),
        arguments: args,
    }
}

fn done() -> StreamEvent {
    StreamEvent::Done {
        usage: None,
        finish_reason: Some("stop".into()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Fixture {
    state: AppState,
    runtime: Arc<MockRuntime>,
    user: CurrentUser,
    conversation_id: i64,
    _base: TempDir,
}

async fn fixture() -> Fixture {
    let base = TempDir::new().unwrap();
    let mut config = Config::default();
    config.auth.jwt_secret = "test-secret".into();
    config.storage.base_dir = base.path().to_path_buf();

    let repo = Arc::new(Repository::connect_in_memory().await.unwrap());
    let user_id = repo.insert_user("alice", false, None).await.unwrap();
    let conversation = repo.create_conversation(user_id, None).await.unwrap();

    let runtime = MockRuntime::new();
    let state = AppState::build(Arc::new(config), repo, runtime.clone());

    Fixture {
        state,
        runtime,
        user: CurrentUser {
            id: user_id,
            username: "alice".into(),
            is_admin: false,
        },
        conversation_id: conversation.id,
        _base: base,
    }
}

fn input(fx: &Fixture, message: &str, provider: Arc<dyn LlmProvider>) -> TurnInput {
    TurnInput {
        user: fx.user.clone(),
        conversation_id: fx.conversation_id,
        message: message.into(),
        provider,
        enable_subagents: false,
        tool_selection: Selection::Auto,
        skill_selection: Selection::Auto,
        upload_path: None,
    }
}

async fn collect_events(fx: &Fixture, turn_input: TurnInput) -> Vec<TurnEvent> {
    let permit = fx
        .state
        .conversation_locks
        .acquire(fx.conversation_id)
        .await;
    let mut rx = run_turn(fx.state.clone(), turn_input, permit);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn text_of(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn plain_text_turn() {
    let fx = fixture().await;
    let provider = ScriptedProvider::new(vec![vec![token("hi "), token("there"), done()]]);

    let events = collect_events(&fx, input(&fx, "hello", provider)).await;
    assert_eq!(text_of(&events), "hi there");
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));

    let rows = fx.state.repo.list_messages(fx.conversation_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].step_order, 1);
    assert_eq!(rows[0].role, MessageRole::User);
    assert_eq!(rows[0].content.as_deref(), Some("hello"));
    assert_eq!(rows[1].step_order, 2);
    assert_eq!(rows[1].role, MessageRole::Model);
    assert_eq!(rows[1].content.as_deref(), Some("hi there"));
    assert!(rows[1].tool_calls.is_none());
}

#[tokio::test]
async fn one_tool_call_one_return() {
    let fx = fixture().await;
    // Three discovery execs happen before the tool runs.
    for _ in 0..3 {
        fx.runtime.push_output("", 0);
    }
    fx.runtime.push_output("uploads/\nintermediate/\n", 0);

    let provider = ScriptedProvider::new(vec![
        vec![call("c1", "ls", serde_json::json!({"path": "/workspace"})), done()],
        vec![token("there are two directories"), done()],
    ]);

    let events = collect_events(&fx, input(&fx, "list files", provider)).await;

    // Frame order: tool_call, then its tool_result, then text.
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            TurnEvent::Text { .. } => "text",
            TurnEvent::ToolCall { .. } => "tool_call",
            TurnEvent::ToolResult { .. } => "tool_result",
            TurnEvent::Error { .. } => "error",
        })
        .collect();
    assert_eq!(kinds, vec!["tool_call", "tool_result", "text"]);

    match &events[1] {
        TurnEvent::ToolResult {
            tool_name,
            result,
            tool_call_id,
        } => {
            assert_eq!(tool_name, "ls");
            assert_eq!(tool_call_id, "c1");
            let text = result.as_str().unwrap();
            assert!(text.contains("Contents of /workspace:"));
            assert!(text.contains("  uploads/"));
        }
        other => panic!("expected tool_result, got {other:?}"),
    }

    // Persisted: user@1, model+calls@2, tool_return@3, model@4.
    let rows = fx.state.repo.list_messages(fx.conversation_id).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[1].role, MessageRole::Model);
    assert_eq!(rows[1].content.as_deref(), Some(""));
    assert_eq!(rows[1].tool_calls.as_ref().unwrap().len(), 1);
    assert_eq!(rows[2].role, MessageRole::ToolReturn);
    assert_eq!(rows[2].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(rows[2].tool_name.as_deref(), Some("ls"));
    assert_eq!(rows[3].role, MessageRole::Model);
    assert_eq!(rows[3].content.as_deref(), Some("there are two directories"));

    let steps: Vec<i64> = rows.iter().map(|r| r.step_order).collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn two_parallel_tool_calls_share_one_model_row() {
    let fx = fixture().await;
    let provider = ScriptedProvider::new(vec![
        vec![
            call("c1", "read_todos", serde_json::json!({})),
            call("c2", "read_todos", serde_json::json!({})),
            done(),
        ],
        vec![token("done"), done()],
    ]);

    let events = collect_events(&fx, input(&fx, "check twice", provider)).await;

    // Both calls are announced before any result.
    let call_ids: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::ToolCall { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(call_ids, vec!["c1", "c2"]);

    // Every tool_result pairs with an earlier tool_call.
    let mut seen_calls = Vec::new();
    for event in &events {
        match event {
            TurnEvent::ToolCall { tool_call_id, .. } => seen_calls.push(tool_call_id.clone()),
            TurnEvent::ToolResult { tool_call_id, .. } => {
                assert!(seen_calls.contains(tool_call_id), "unpaired result frame");
            }
            _ => {}
        }
    }

    // One model row carries BOTH calls; then two returns; then final text.
    let rows = fx.state.repo.list_messages(fx.conversation_id).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[1].tool_calls.as_ref().unwrap().len(), 2);
    assert_eq!(rows[2].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(rows[3].tool_call_id.as_deref(), Some("c2"));
    assert_eq!(rows[4].content.as_deref(), Some("done"));

    let steps: Vec<i64> = rows.iter().map(|r| r.step_order).collect();
    assert_eq!(steps, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn resumed_turn_continues_step_order() {
    let fx = fixture().await;

    // A prior completed turn occupies steps 1-2.
    let first = ScriptedProvider::new(vec![vec![token("first answer"), done()]]);
    collect_events(&fx, input(&fx, "first question", first)).await;

    // The resumed turn adds user@3, model+call@4, return@5, model@6.
    let second = ScriptedProvider::new(vec![
        vec![call("c9", "read_todos", serde_json::json!({})), done()],
        vec![token("resumed answer"), done()],
    ]);
    collect_events(&fx, input(&fx, "second question", second)).await;

    let rows = fx.state.repo.list_messages(fx.conversation_id).await.unwrap();
    let steps: Vec<i64> = rows.iter().map(|r| r.step_order).collect();
    assert_eq!(steps, vec![1, 2, 3, 4, 5, 6]);

    // And the reconstructed history is a valid alternation the next turn
    // can be fed from.
    let history = fx
        .state
        .history
        .read_history(fx.conversation_id)
        .await
        .unwrap();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Assistant,
        ]
    );
    assert_eq!(history[3].content.tool_calls().len(), 1);
}

#[tokio::test]
async fn tool_error_is_recovered_not_fatal() {
    let fx = fixture().await;
    let provider = ScriptedProvider::new(vec![
        // write_todos with two in_progress entries: rejected as a result.
        vec![
            call(
                "c1",
                "write_todos",
                serde_json::json!({"todos": [
                    {"content": "a", "status": "in_progress", "active_form": "a"},
                    {"content": "b", "status": "in_progress", "active_form": "b"}
                ]}),
            ),
            done(),
        ],
        vec![token("let me fix that"), done()],
    ]);

    let events = collect_events(&fx, input(&fx, "plan it", provider)).await;
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));

    let result_text = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::ToolResult { result, .. } => Some(result.as_str().unwrap().to_string()),
            _ => None,
        })
        .unwrap();
    assert!(result_text.contains("in_progress"));

    // The turn continued to a final answer and the bad todos were never saved.
    assert_eq!(text_of(&events), "let me fix that");
    let conv = fx
        .state
        .repo
        .get_conversation(fx.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert!(conv.state.todos.is_empty());
}

#[tokio::test]
async fn todos_survive_into_conversation_state() {
    let fx = fixture().await;
    let provider = ScriptedProvider::new(vec![
        vec![
            call(
                "c1",
                "write_todos",
                serde_json::json!({"todos": [
                    {"content": "analyze", "status": "in_progress", "active_form": "Analyzing"}
                ]}),
            ),
            done(),
        ],
        vec![token("ok"), done()],
    ]);

    collect_events(&fx, input(&fx, "track this", provider)).await;

    let conv = fx
        .state
        .repo
        .get_conversation(fx.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.state.todos.len(), 1);
    assert_eq!(conv.state.todos[0].content, "analyze");
}

#[tokio::test]
async fn subagent_todos_never_leak_into_conversation_state() {
    let fx = fixture().await;

    // The parent conversation already carries a todo the user cares about.
    let parent_state = ConversationState {
        todos: vec![Todo {
            content: "ship the report".into(),
            status: TodoStatus::Pending,
            active_form: "Shipping the report".into(),
        }],
        uploads: Default::default(),
    };
    fx.state
        .repo
        .save_state(fx.conversation_id, &parent_state)
        .await
        .unwrap();

    // Parent turn: delegate via `task`, then answer. Inside the subagent
    // (non-streaming): plan with write_todos, then finish.
    let provider = ScriptedProvider::with_chat(
        vec![
            vec![
                call(
                    "c1",
                    "task",
                    serde_json::json!({
                        "description": "plan the cleanup",
                        "subagent_type": "general-purpose"
                    }),
                ),
                done(),
            ],
            vec![token("parent done"), done()],
        ],
        vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    call_id: "s1".into(),
                    tool_name: "write_todos".into(),
                    arguments: serde_json::json!({"todos": [
                        {"content": "subagent scratch", "status": "pending", "active_form": "Scratching"}
                    ]}),
                }],
                usage: None,
                finish_reason: Some("tool_calls".into()),
            },
            ChatResponse {
                content: "cleanup planned".into(),
                tool_calls: vec![],
                usage: None,
                finish_reason: Some("stop".into()),
            },
        ],
    );

    let mut turn_input = input(&fx, "delegate it", provider);
    turn_input.enable_subagents = true;
    let events = collect_events(&fx, turn_input).await;

    // The subagent's final answer came back as the task result.
    let task_result = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::ToolResult { result, .. } => Some(result.as_str().unwrap().to_string()),
            _ => None,
        })
        .unwrap();
    assert!(task_result.contains("cleanup planned"));
    assert_eq!(text_of(&events), "parent done");

    // The subagent planned on its own todo list; the parent's persisted
    // todos are exactly what the user had before.
    let conv = fx
        .state
        .repo
        .get_conversation(fx.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.state.todos.len(), 1);
    assert_eq!(conv.state.todos[0].content, "ship the report");
    assert_eq!(conv.state.todos[0].status, TodoStatus::Pending);
}

#[tokio::test]
async fn provider_stream_error_emits_error_frame_and_keeps_prefix() {
    let fx = fixture().await;
    let provider = ScriptedProvider::new(vec![vec![
        token("partial "),
        StreamEvent::Error {
            message: "upstream 500".into(),
        },
    ]]);

    let events = collect_events(&fx, input(&fx, "hello", provider)).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Error { content } if content.contains("upstream 500"))));

    // The partial prefix is persisted and readable.
    let rows = fx.state.repo.list_messages(fx.conversation_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].role, MessageRole::Model);
    assert_eq!(rows[1].content.as_deref(), Some("partial "));
}

#[tokio::test]
async fn client_disconnect_terminates_cleanly() {
    let fx = fixture().await;
    let provider = ScriptedProvider::new(vec![vec![token("never seen"), done()]]);

    let permit = fx
        .state
        .conversation_locks
        .acquire(fx.conversation_id)
        .await;
    let rx = run_turn(fx.state.clone(), input(&fx, "hello", provider), permit);
    drop(rx); // client went away immediately

    // Let the turn task run to completion; the lock is free again once it
    // finishes.
    let _ = fx.state.conversation_locks.acquire(fx.conversation_id).await;

    let rows = fx.state.repo.list_messages(fx.conversation_id).await.unwrap();
    // The user row is persisted; no tool-return row exists without its
    // model row, so the prefix is valid and resumable.
    assert!(!rows.is_empty());
    assert_eq!(rows[0].role, MessageRole::User);
    for pair in rows.windows(2) {
        assert!(pair[1].step_order == pair[0].step_order + 1, "gap in step_order");
    }
}

#[tokio::test]
async fn sandbox_stop_scheduled_after_turn() {
    let fx = fixture().await;
    let provider = ScriptedProvider::new(vec![vec![token("hi"), done()]]);
    collect_events(&fx, input(&fx, "hello", provider)).await;

    // The deferred stop runs on its own task.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(fx.runtime.stop_count(), 1);
}
