use std::time::Duration;

use futures_util::StreamExt;
use relay_model::{
    ContentBlock, ErrorKind, Message, Role, StopReason, ToolCallRequest, Usage,
};
use relay_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, timeout};

use crate::context::RunContext;
use crate::history::HistoryConfig;
use crate::tool::{BlockingTool, ExecuteResult, Tool, ToolOutput};
use crate::{AgentBuilder, AgentConfig, AgentError, LoopState, StreamEvent};

#[derive(Deserialize, JsonSchema)]
struct AddInput {
    a: i64,
    b: i64,
}

#[derive(Serialize, Deserialize, JsonSchema)]
struct AddOutput {
    result: i64,
}

struct AddTool;

impl BlockingTool for AddTool {
    type Input = AddInput;
    type Output = AddOutput;

    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Adds two integers"
    }

    fn execute(
        &self,
        input: AddInput,
        _ctx: Option<RunContext>,
    ) -> ExecuteResult<AddOutput> {
        Ok(AddOutput {
            result: input.a + input.b,
        }
        .into())
    }
}

#[derive(Deserialize, JsonSchema)]
struct RememberInput {
    key: String,
}

/// Stores a large vector in the run context and reports only its size.
struct RememberTool {
    delay: Duration,
}

impl Tool for RememberTool {
    type Input = RememberInput;
    type Output = usize;

    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Remembers a vector"
    }

    fn accepts_context(&self) -> bool {
        true
    }

    #[allow(clippy::manual_async_fn)]
    fn execute(
        &self,
        input: RememberInput,
        ctx: Option<RunContext>,
    ) -> impl Future<Output = ExecuteResult<usize>> + Send + 'static {
        let delay = self.delay;
        async move {
            sleep(delay).await;
            let ctx = ctx.ok_or_else(crate::tool::Error::execution_error)?;
            ctx.set(input.key, vec![0.5f32; 256], "remember");
            Ok(ToolOutput::new(256).with_summary("stored 256 values"))
        }
    }
}

fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> PresetEvent {
    PresetEvent::ToolCall(ToolCallRequest {
        id: id.to_owned(),
        name: name.to_owned(),
        arguments,
    })
}

fn add_call(id: &str, a: i64, b: i64) -> PresetEvent {
    tool_call(id, "add", json!({ "a": a, "b": b }))
}

#[tokio::test]
async fn test_tool_round_trip() {
    let provider = TestModelProvider::with_script([
        PresetResponse::with_events([add_call("call_1", 3, 5)]),
        PresetResponse::text("3+5=8"),
    ]);
    let mut agent = AgentBuilder::with_model_provider(provider.clone())
        .with_blocking_tool(AddTool)
        .with_system_prompt("You are a calculator.")
        .build();
    assert_eq!(agent.state(), LoopState::Idle);

    let answer = agent.run("what is 3+5").await.unwrap();
    assert_eq!(answer, "3+5=8");
    assert_eq!(provider.request_count(), 2);
    assert_eq!(agent.state(), LoopState::Done);

    let requests = provider.requests();
    assert_eq!(requests[0].system.as_deref(), Some("You are a calculator."));
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].tools[0].name, "add");
    assert_eq!(requests[0].messages, [Message::user("what is 3+5")]);

    let messages = agent.history().messages();
    assert_eq!(messages.len(), 4);
    assert!(messages[1].has_tool_use());
    assert_eq!(
        messages[2],
        Message::with_blocks(
            Role::User,
            vec![ContentBlock::tool_result("call_1", r#"{"result":8}"#)],
        )
    );
    assert_eq!(messages[3].text(), "3+5=8");
    assert_eq!(requests[1].messages, messages[..3]);
}

#[tokio::test]
async fn test_results_follow_request_order() {
    let provider = TestModelProvider::with_script([
        PresetResponse::with_events([
            add_call("b", 1, 1),
            tool_call("x", "missing", json!({})),
            add_call("a", 2, 2),
        ]),
        PresetResponse::text("done"),
    ]);
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_blocking_tool(AddTool)
        .build();
    agent.run("go").await.unwrap();

    let results = agent.history().messages()[2].blocks();
    let ids: Vec<_> = results
        .iter()
        .map(|block| match block {
            ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
            _ => panic!("unexpected block: {block:?}"),
        })
        .collect();
    assert_eq!(ids, ["b", "x", "a"]);
    assert!(matches!(
        &results[1],
        ContentBlock::ToolResult { content, .. } if content.starts_with("Error: ")
    ));
}

#[tokio::test]
async fn test_iteration_budget() {
    let provider = TestModelProvider::default();
    provider.set_fallback(PresetResponse::with_events([add_call("c", 1, 2)]));
    let mut agent = AgentBuilder::with_model_provider(provider.clone())
        .with_blocking_tool(AddTool)
        .with_max_iterations(3)
        .build();

    let err = agent.run("loop forever").await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::IterationBudgetExceeded { max_iterations: 3 }
    ));
    assert_eq!(provider.request_count(), 3);
    assert_eq!(agent.state(), LoopState::Failed);
    // Every finished tool round is still in the history.
    assert_eq!(agent.history().len(), 1 + 3 * 2);
}

#[tokio::test]
async fn test_length_limit_returns_partial_text() {
    let provider = TestModelProvider::with_script([PresetResponse::text(
        "The answer is",
    )
    .with_stop_reason(StopReason::LengthLimit)]);
    let mut agent = AgentBuilder::with_model_provider(provider).build();

    assert_eq!(agent.run("tell me").await.unwrap(), "The answer is");
    assert_eq!(agent.history().len(), 2);
}

#[tokio::test]
async fn test_length_limit_without_text_fails() {
    let provider = TestModelProvider::with_script([PresetResponse::with_events(
        [add_call("call_1", 3, 5)],
    )
    .with_stop_reason(StopReason::LengthLimit)]);
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_blocking_tool(AddTool)
        .build();

    assert!(matches!(
        agent.run("add them").await,
        Err(AgentError::EmptyResponse)
    ));
    assert!(agent.history().is_empty());
    assert_eq!(agent.state(), LoopState::Failed);
}

#[tokio::test]
async fn test_answer_matches_stored_turn() {
    let provider = TestModelProvider::with_script([PresetResponse::with_events([
        PresetEvent::TextDelta("first".to_owned()),
        add_call("stray", 1, 1),
        PresetEvent::TextDelta("second".to_owned()),
    ])
    .with_stop_reason(StopReason::EndOfTurn)]);
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_blocking_tool(AddTool)
        .build();

    let answer = agent.run("go").await.unwrap();
    assert_eq!(answer, "first\nsecond");
    let stored = &agent.history().messages()[1];
    assert!(!stored.has_tool_use());
    assert_eq!(stored.text(), answer);
}

#[tokio::test]
async fn test_model_failure_commits_nothing() {
    let provider = TestModelProvider::with_script([
        PresetResponse::text("hello"),
        PresetResponse::failure(ErrorKind::RateLimitExceeded),
    ]);
    let mut agent = AgentBuilder::with_model_provider(provider).build();
    agent.run("hi").await.unwrap();

    let err = agent.run("again").await.unwrap_err();
    assert_eq!(err.model_error_kind(), Some(ErrorKind::RateLimitExceeded));
    assert_eq!(agent.history().len(), 2);
    assert_eq!(agent.state(), LoopState::Failed);
}

#[tokio::test]
async fn test_degenerate_responses() {
    let provider = TestModelProvider::with_script([
        PresetResponse::text("   "),
        PresetResponse::text("calling nothing")
            .with_stop_reason(StopReason::ToolRequested),
    ]);
    let mut agent = AgentBuilder::with_model_provider(provider).build();

    assert!(matches!(
        agent.run("a").await,
        Err(AgentError::EmptyResponse)
    ));
    assert!(matches!(
        agent.run("b").await,
        Err(AgentError::MissingToolCalls)
    ));
    assert!(agent.history().is_empty());
}

#[tokio::test]
async fn test_context_summary_is_appended() {
    let script = || {
        [
            PresetResponse::with_events([
                tool_call("r", "remember", json!({ "key": "vec" })),
                add_call("s", 1, 1),
            ]),
            PresetResponse::text("ok"),
        ]
    };

    let provider = TestModelProvider::with_script(script());
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_tool(RememberTool {
            delay: Duration::ZERO,
        })
        .with_blocking_tool(AddTool)
        .build();
    agent.run("store it").await.unwrap();

    let line = "[Run context: vec (type=Vec<f32>, source=remember)]";
    let blocks = agent.history().messages()[2].blocks();
    assert_eq!(
        blocks[0],
        ContentBlock::tool_result("r", format!("stored 256 values\n{line}"))
    );
    assert_eq!(
        blocks[1],
        ContentBlock::tool_result("s", format!("{{\"result\":2}}\n{line}"))
    );

    let provider = TestModelProvider::with_script(script());
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_config(AgentConfig {
            context_summary: false,
            ..Default::default()
        })
        .with_tool(RememberTool {
            delay: Duration::ZERO,
        })
        .with_blocking_tool(AddTool)
        .build();
    agent.run("store it").await.unwrap();
    let blocks = agent.history().messages()[2].blocks();
    assert_eq!(blocks[0], ContentBlock::tool_result("r", "stored 256 values"));
}

#[tokio::test]
async fn test_context_lives_for_one_run() {
    let provider = TestModelProvider::with_script([
        PresetResponse::with_events([tool_call(
            "r",
            "remember",
            json!({ "key": "vec" }),
        )]),
        PresetResponse::text("first"),
        PresetResponse::with_events([add_call("s", 1, 1)]),
        PresetResponse::text("second"),
    ]);
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_tool(RememberTool {
            delay: Duration::ZERO,
        })
        .with_blocking_tool(AddTool)
        .build();
    agent.run("one").await.unwrap();
    agent.run("two").await.unwrap();

    // The second run starts with an empty context, so nothing is appended.
    let last_results = &agent.history().messages()[6];
    assert_eq!(
        last_results.blocks(),
        [ContentBlock::tool_result("s", r#"{"result":2}"#)]
    );
}

#[tokio::test]
async fn test_streaming() {
    let provider = TestModelProvider::with_script([
        PresetResponse::with_events([
            PresetEvent::TextDelta("Adding".to_owned()),
            add_call("call_1", 3, 5),
        ]),
        PresetResponse::with_events([
            PresetEvent::TextDelta("3+5".to_owned()),
            PresetEvent::TextDelta("=8".to_owned()),
        ]),
    ]);
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_blocking_tool(AddTool)
        .build();

    let events: Vec<_> = agent
        .run_stream("what is 3+5")
        .map(|event| event.unwrap())
        .collect()
        .await;
    assert_eq!(
        events,
        [
            StreamEvent::TextDelta("Adding".to_owned()),
            StreamEvent::ToolResult {
                invocation_id: "call_1".to_owned(),
                tool_name: "add".to_owned(),
                success: true,
            },
            StreamEvent::TextDelta("3+5".to_owned()),
            StreamEvent::TextDelta("=8".to_owned()),
            StreamEvent::Finished("3+5=8".to_owned()),
        ]
    );
    assert_eq!(agent.history().len(), 4);
}

#[tokio::test]
async fn test_streaming_error_ends_stream() {
    let provider = TestModelProvider::default();
    let mut agent = AgentBuilder::with_model_provider(provider).build();

    let mut stream = agent.run_stream("hi");
    assert!(matches!(stream.next().await, Some(Err(AgentError::Model(_)))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_cancel_during_model_call() {
    let mut provider = TestModelProvider::with_script([
        PresetResponse::text("too slow"),
        PresetResponse::text("fine"),
    ]);
    provider.set_delay(Duration::from_millis(300));
    let mut agent = AgentBuilder::with_model_provider(provider).build();

    let cancelled = timeout(Duration::from_millis(30), agent.run("hi")).await;
    assert!(cancelled.is_err());
    assert!(agent.history().is_empty());
    assert!(agent.state().is_running());

    assert_eq!(agent.run("hi again").await.unwrap(), "fine");
    assert_eq!(agent.history().messages()[0], Message::user("hi again"));
}

#[tokio::test]
async fn test_cancel_during_tool_round() {
    let provider = TestModelProvider::with_script([
        PresetResponse::text("first"),
        PresetResponse::with_events([tool_call(
            "r",
            "remember",
            json!({ "key": "vec" }),
        )]),
    ]);
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_tool(RememberTool {
            delay: Duration::from_millis(300),
        })
        .build();
    agent.run("hi").await.unwrap();

    let mut stream = agent.run_stream("remember");
    let cancelled = timeout(Duration::from_millis(50), stream.next()).await;
    assert!(cancelled.is_err());
    drop(stream);
    assert_eq!(agent.state(), LoopState::AwaitingTools);

    // The unanswered tool request never reached the history.
    let messages = agent.history().messages();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|msg| !msg.has_tool_use()));
}

#[tokio::test]
async fn test_history_is_trimmed_between_rounds() {
    let provider = TestModelProvider::default();
    provider.set_fallback(
        PresetResponse::text("noted").with_usage(Usage {
            input_tokens: 1_000,
            output_tokens: 10,
        }),
    );
    let config = AgentConfig {
        history: HistoryConfig {
            max_tokens: Some(500),
            max_messages: None,
            keep_recent: 1,
            summarize: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_config(config)
        .build();

    for i in 0..4 {
        agent.run(format!("note {i}")).await.unwrap();
    }
    // Each run starts by compacting what the previous ones left over.
    let messages = agent.history().messages();
    assert_eq!(messages[0].text(), "[Earlier conversation omitted]");
    assert_eq!(messages.last().unwrap().text(), "noted");
    assert!(messages.len() < 8);
}

#[tokio::test]
async fn test_reset() {
    let provider = TestModelProvider::default();
    provider.set_fallback(PresetResponse::text("hello"));
    let mut agent = AgentBuilder::with_model_provider(provider)
        .with_blocking_tool(AddTool)
        .build();
    agent.run("hi").await.unwrap();

    agent.reset();
    assert!(agent.history().is_empty());
    assert_eq!(agent.state(), LoopState::Idle);
    assert_eq!(agent.registry().names(), ["add"]);
}
