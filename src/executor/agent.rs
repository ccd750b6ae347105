//! ReAct loop: ask the model, run the tools it asks for, feed the results
//! back, until it answers without tool calls.

use super::contract::ProgressSink;
use super::conversation::ChatMessage;
use super::error::{ExecutorError, Result};
use super::format::{format_tool_args, format_tool_result, remove_html_blocks};
use super::llm::{ChatModel, ModelRequest, TextSink, ToolCall, TurnMessage};
use super::mcp::{McpTool, ToolProvider};
use serde_json::Value;
use tracing::{debug, error, info};

pub struct AgentRunner<'a> {
    model: &'a dyn ChatModel,
    tools: &'a dyn ToolProvider,
    tool_specs: &'a [McpTool],
    max_iterations: usize,
}

impl<'a> AgentRunner<'a> {
    pub fn new(
        model: &'a dyn ChatModel,
        tools: &'a dyn ToolProvider,
        tool_specs: &'a [McpTool],
        max_iterations: usize,
    ) -> Self {
        Self {
            model,
            tools,
            tool_specs,
            max_iterations,
        }
    }

    /// Appends the user turn to `messages`, runs the loop and returns the
    /// final answer. On success a non-empty answer is appended to
    /// `messages` as well, dashboards included.
    pub async fn run(
        &self,
        messages: &mut Vec<ChatMessage>,
        user_input: &str,
        sink: &dyn ProgressSink,
    ) -> Result<String> {
        messages.push(ChatMessage::user(user_input));
        let mut turns: Vec<TurnMessage> = messages.iter().cloned().map(TurnMessage::Chat).collect();
        let relay = |text: &str| sink.append_intermediate_output(text);

        for iteration in 1..=self.max_iterations {
            debug!("Agent iteration {} with {}", iteration, self.model.describe());
            let request = ModelRequest {
                messages: &turns,
                tools: self.tool_specs,
            };
            let turn = self.model.stream_turn(&request, &relay).await?;

            if turn.tool_calls.is_empty() {
                info!(
                    "Agent finished after {} iteration(s) ({} characters)",
                    iteration,
                    turn.text.len()
                );
                debug!("Final answer: {}", remove_html_blocks(&turn.text));
                if !turn.text.is_empty() {
                    messages.push(ChatMessage::assistant(turn.text.clone()));
                }
                return Ok(turn.text);
            }

            for call in &turn.tool_calls {
                sink.append_intermediate_output(&format!("\n**Calling tool:** `{}`", call.name));
                if has_arguments(&call.arguments) {
                    sink.append_intermediate_output(&format!(
                        "**Arguments:** {}",
                        format_tool_args(&call.arguments)
                    ));
                }
            }

            let calls = turn.tool_calls.clone();
            turns.push(TurnMessage::AssistantToolCalls {
                text: turn.text,
                calls: turn.tool_calls,
            });
            for call in &calls {
                turns.push(self.invoke(call, sink).await);
            }
        }

        Err(ExecutorError::Agent(format!(
            "no final answer after {} iterations",
            self.max_iterations
        )))
    }

    async fn invoke(&self, call: &ToolCall, sink: &dyn ProgressSink) -> TurnMessage {
        let (content, is_error) = match self.tools.call_tool(&call.name, call.arguments.clone()).await {
            Ok(output) => {
                sink.append_intermediate_output(&format!(
                    "\n**Tool Result:**\n{}\n",
                    format_tool_result(&output.text)
                ));
                (output.text, output.is_error)
            }
            Err(e) => {
                error!("Tool {} failed: {}", call.name, e);
                sink.append_intermediate_output(&format!("\n**Error:** {}\n", e));
                (format!("Error: {}", e), true)
            }
        };
        TurnMessage::ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error,
        }
    }
}

fn has_arguments(arguments: &Value) -> bool {
    match arguments {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::conversation::Role;
    use crate::executor::llm::ModelTurn;
    use crate::executor::mcp::ToolOutput;
    use crate::executor::sinks::{ProgressEvent, RecordingSink};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted turns, streaming each turn's text in two halves.
    #[derive(Default)]
    pub struct ScriptedModel {
        turns: Mutex<VecDeque<ModelTurn>>,
        pub requests: Mutex<Vec<Vec<TurnMessage>>>,
    }

    impl ScriptedModel {
        pub fn new(turns: Vec<ModelTurn>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn describe(&self) -> String {
            "scripted/test".to_string()
        }

        async fn stream_turn(
            &self,
            request: &ModelRequest<'_>,
            on_text: &TextSink<'_>,
        ) -> Result<ModelTurn> {
            self.requests.lock().unwrap().push(request.messages.to_vec());
            let turn = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ExecutorError::Model("script exhausted".to_string()))?;
            let mid = turn.text.len() / 2;
            if turn.text.is_char_boundary(mid) && mid > 0 {
                on_text(&turn.text[..mid]);
                on_text(&turn.text[mid..]);
            } else if !turn.text.is_empty() {
                on_text(&turn.text);
            }
            Ok(turn)
        }
    }

    #[derive(Default)]
    pub struct FakeTools {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolProvider for FakeTools {
        async fn list_tools(&self) -> Result<Vec<McpTool>> {
            Ok(vec![McpTool {
                name: "query_data".to_string(),
                description: Some("Run a query".to_string()),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, name: &str, _arguments: Value) -> Result<ToolOutput> {
            self.calls.lock().unwrap().push(name.to_string());
            match name {
                "query_data" => Ok(ToolOutput {
                    text: r#"{"rows":[["west",10]]}"#.to_string(),
                    is_error: false,
                }),
                other => Err(ExecutorError::Mcp(format!("unknown tool {}", other))),
            }
        }
    }

    pub fn text_turn(text: &str) -> ModelTurn {
        ModelTurn {
            text: text.to_string(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_turn(text: &str, name: &str, arguments: Value) -> ModelTurn {
        ModelTurn {
            text: text.to_string(),
            tool_calls: vec![ToolCall {
                id: format!("call_{}", name),
                name: name.to_string(),
                arguments,
            }],
        }
    }

    #[tokio::test]
    async fn relays_text_tool_calls_and_results_in_order() {
        let model = ScriptedModel::new(vec![
            tool_turn("Let me look.", "query_data", json!({"sql": "select region"})),
            text_turn("West leads with 10."),
        ]);
        let tools = FakeTools::default();
        let specs = tools.list_tools().await.unwrap();
        let sink = RecordingSink::default();
        let mut history = vec![ChatMessage::system("prompt")];

        let answer = AgentRunner::new(&model, &tools, &specs, 5)
            .run(&mut history, "Which region leads?", &sink)
            .await
            .unwrap();

        assert_eq!(answer, "West leads with 10.");
        let outputs = sink.outputs();
        assert_eq!(
            outputs,
            vec![
                "Let me".to_string(),
                " look.".to_string(),
                "\n**Calling tool:** `query_data`".to_string(),
                "**Arguments:** `{\"sql\": \"select region\"}`".to_string(),
                "\n**Tool Result:**\n```json\n{\n  \"rows\": [\n    [\n      \"west\",\n      10\n    ]\n  ]\n}\n```\n".to_string(),
                "West lead".to_string(),
                "s with 10.".to_string(),
            ]
        );
        assert!(sink
            .events()
            .iter()
            .all(|event| matches!(event, ProgressEvent::Output { .. })));

        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(matches!(
            requests[1].last(),
            Some(TurnMessage::ToolResult { is_error: false, .. })
        ));
    }

    #[tokio::test]
    async fn tool_failure_is_relayed_and_fed_back() {
        let model = ScriptedModel::new(vec![
            tool_turn("", "drop_tables", json!({})),
            text_turn("That tool is not available."),
        ]);
        let tools = FakeTools::default();
        let sink = RecordingSink::default();
        let mut history = Vec::new();

        let answer = AgentRunner::new(&model, &tools, &[], 5)
            .run(&mut history, "drop everything", &sink)
            .await
            .unwrap();

        assert_eq!(answer, "That tool is not available.");
        let outputs = sink.outputs();
        assert_eq!(outputs[0], "\n**Calling tool:** `drop_tables`");
        assert_eq!(outputs[1], "\n**Error:** MCP error: unknown tool drop_tables\n");

        let requests = model.requests.lock().unwrap();
        match requests[1].last() {
            Some(TurnMessage::ToolResult { content, is_error, .. }) => {
                assert!(*is_error);
                assert!(content.starts_with("Error: "));
            }
            other => panic!("unexpected last message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn iteration_cap_is_an_error() {
        let model = ScriptedModel::new(vec![
            tool_turn("", "query_data", json!({"sql": "1"})),
            tool_turn("", "query_data", json!({"sql": "2"})),
            tool_turn("", "query_data", json!({"sql": "3"})),
        ]);
        let tools = FakeTools::default();
        let sink = RecordingSink::default();
        let mut history = Vec::new();

        let result = AgentRunner::new(&model, &tools, &[], 2)
            .run(&mut history, "loop forever", &sink)
            .await;

        assert!(matches!(result, Err(ExecutorError::Agent(_))));
        assert_eq!(tools.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dashboards_stay_in_history() {
        let reply = "```html\n<html><head></head><body>x</body></html>\n```";
        let model = ScriptedModel::new(vec![text_turn(reply)]);
        let tools = FakeTools::default();
        let sink = RecordingSink::default();
        let mut history = Vec::new();

        let answer = AgentRunner::new(&model, &tools, &[], 3)
            .run(&mut history, "make a dashboard", &sink)
            .await
            .unwrap();

        assert_eq!(answer, reply);
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(history[1].text(), reply);
    }

    #[tokio::test]
    async fn empty_answer_is_not_remembered() {
        let model = ScriptedModel::new(vec![text_turn("")]);
        let tools = FakeTools::default();
        let mut history = Vec::new();

        let answer = AgentRunner::new(&model, &tools, &[], 3)
            .run(&mut history, "anything?", &RecordingSink::default())
            .await
            .unwrap();

        assert!(answer.is_empty());
        assert_eq!(history.len(), 1);
    }
}
