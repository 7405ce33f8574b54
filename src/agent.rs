//! Conversational agent: plan, validate, dispatch, reply
//!
//! Each user message goes through a planning prompt that decides between a
//! direct answer and a tool call. Planned calls are checked against the
//! [`ToolCatalog`] before they reach the worker; the tool outcome (or the
//! reason no tool ran) is folded into the prompt for the final reply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use crate::catalog::{CatalogError, ToolCatalog};
use crate::llm::{GenerationRequest, JsonRetryPolicy, LlmError, TextGenerator};
use crate::worker::{CallOutcome, ToolClient, WorkerError};

const PLAN_TEMPERATURE: f32 = 0.1;
const PLAN_MAX_TOKENS: u32 = 512;
const REPLY_TEMPERATURE: f32 = 0.7;
const REPLY_MAX_TOKENS: u32 = 1024;

const REPLY_SYSTEM_PROMPT: &str = "You are a friendly and professional bioinformatics assistant. \
Using the context provided, write a clear, accurate and natural reply to the user.";

/// Something that can run a named tool.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallOutcome, WorkerError>;

    async fn shutdown(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

#[async_trait]
impl ToolDispatcher for ToolClient {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallOutcome, WorkerError> {
        self.call(name, arguments).await
    }

    async fn shutdown(&self) -> Result<(), WorkerError> {
        self.stop().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    DirectResponse,
    CallTool,
}

/// Decision returned by the planning prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub action: PlanAction,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// What happened on the tool side of one message.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolStep {
    /// The plan did not ask for a tool
    NotRequested,
    /// The tool ran; its outcome rendered as JSON
    Executed { tool: String, result: Value },
    /// Required arguments were missing, so the user must be asked
    NeedsArguments { tool: String, missing: Vec<String> },
    /// The planned call could not be dispatched
    Rejected { error: Value },
}

impl ToolStep {
    /// JSON shown to the reply prompt, if any.
    pub fn result(&self) -> Option<&Value> {
        match self {
            ToolStep::Executed { result, .. } => Some(result),
            ToolStep::Rejected { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub text: String,
    pub plan: Option<Plan>,
    pub tool_step: ToolStep,
}

pub struct Agent {
    generator: Arc<dyn TextGenerator>,
    tools: Arc<dyn ToolDispatcher>,
    catalog: ToolCatalog,
    json_policy: JsonRetryPolicy,
    history: Vec<Turn>,
}

impl Agent {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        tools: Arc<dyn ToolDispatcher>,
        catalog: ToolCatalog,
    ) -> Self {
        tracing::info!(
            "Agent ready: text generator '{}', {} tools",
            generator.name(),
            catalog.len()
        );
        Self {
            generator,
            tools,
            catalog,
            json_policy: JsonRetryPolicy::default(),
            history: Vec::new(),
        }
    }

    pub fn with_json_policy(mut self, policy: JsonRetryPolicy) -> Self {
        self.json_policy = policy;
        self
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        tracing::info!("Conversation history cleared");
    }

    /// Stop the tool worker.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        tracing::info!("Shutting down agent");
        self.tools.shutdown().await
    }

    /// Handle one user message end to end.
    ///
    /// A failed planning step degrades to a reply without tools; only a
    /// failure of the final reply is returned as an error.
    pub async fn process_message(&mut self, input: &str) -> Result<AgentReply, LlmError> {
        tracing::info!("User message: {}", input);
        self.history.push(Turn {
            role: Role::User,
            content: input.to_string(),
        });

        let plan = self.plan(input).await;
        let tool_step = match &plan {
            Some(plan) if plan.action == PlanAction::CallTool => self.execute(plan).await,
            Some(_) => ToolStep::NotRequested,
            None => {
                tracing::error!("Planning failed, replying without tools");
                ToolStep::NotRequested
            }
        };

        let prompt = reply_prompt(&self.history, input, plan.as_ref(), &tool_step);
        tracing::debug!(
            "Reply prompt: {}",
            prompt.chars().take(500).collect::<String>()
        );
        let request = GenerationRequest::new(prompt)
            .system(REPLY_SYSTEM_PROMPT)
            .temperature(REPLY_TEMPERATURE)
            .max_tokens(REPLY_MAX_TOKENS);
        let text = self.generator.generate(&request).await?;

        self.history.push(Turn {
            role: Role::Assistant,
            content: text.clone(),
        });
        Ok(AgentReply {
            text,
            plan,
            tool_step,
        })
    }

    async fn plan(&self, input: &str) -> Option<Plan> {
        let catalog_json = match self.catalog.to_json_pretty() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to render tool catalog: {}", e);
                return None;
            }
        };
        let request = GenerationRequest::new(format!("Latest user request: {input}"))
            .system(planning_prompt(&catalog_json, &self.history, input))
            .temperature(PLAN_TEMPERATURE)
            .max_tokens(PLAN_MAX_TOKENS);

        let value = match self.generator.generate_json(&request, &self.json_policy).await {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Planning request failed: {}", e);
                return None;
            }
        };
        match serde_json::from_value::<Plan>(value) {
            Ok(plan) => {
                tracing::info!(
                    "Plan: {:?}, tool: {:?}, reason: {:?}",
                    plan.action,
                    plan.tool_name,
                    plan.explanation
                );
                Some(plan)
            }
            Err(e) => {
                tracing::error!("Model did not produce a valid plan: {}", e);
                None
            }
        }
    }

    async fn execute(&self, plan: &Plan) -> ToolStep {
        let (Some(tool), Some(arguments)) = (
            plan.tool_name.as_deref(),
            plan.arguments.as_ref().filter(|a| a.is_object()),
        ) else {
            tracing::error!("Plan asks for a tool call without a tool name or arguments");
            return ToolStep::Rejected {
                error: json!({"error": "Internal planning error: could not determine the tool or its arguments."}),
            };
        };

        match self.catalog.validate(tool, arguments) {
            Ok(()) => {}
            Err(CatalogError::MissingParameters { missing, .. }) => {
                tracing::info!("Tool '{}' needs arguments from the user: {:?}", tool, missing);
                return ToolStep::NeedsArguments {
                    tool: tool.to_string(),
                    missing,
                };
            }
            Err(e) => {
                tracing::error!("Planned call rejected: {}", e);
                return ToolStep::Rejected {
                    error: json!({"error": format!("Internal error: {e}")}),
                };
            }
        }

        tracing::info!("Calling tool '{}' with {}", tool, arguments);
        let result = match self.tools.call_tool(tool, arguments.clone()).await {
            Ok(outcome) => {
                if !outcome.is_success() {
                    tracing::warn!("Tool '{}' did not succeed: {:?}", tool, outcome);
                }
                outcome.to_json()
            }
            Err(e) => {
                tracing::error!("Tool '{}' could not be called: {}", tool, e);
                json!({"error": format!("Tool '{tool}' is unavailable: {e}")})
            }
        };
        ToolStep::Executed {
            tool: tool.to_string(),
            result,
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("generator", &self.generator.name())
            .field("tools", &self.catalog.len())
            .field("history", &self.history.len())
            .finish()
    }
}

/// Conversation rendered as `User:` / `Assistant:` lines.
pub fn format_history(history: &[Turn]) -> String {
    history
        .iter()
        .map(|turn| match turn.role {
            Role::User => format!("User: {}", turn.content),
            Role::Assistant => format!("Assistant: {}", turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn planning_prompt(catalog_json: &str, history: &[Turn], input: &str) -> String {
    format!(
        r#"You are a bioinformatics assistant. Understand the user's request and decide the next action.
You can answer directly, or call one of the available tools to fetch information or perform an operation.
Available tools (JSON description):
```json
{catalog_json}
```
Based on the conversation history and the latest request, decide on exactly one of:
1. Direct response: small talk, greetings, simple questions, or anything you can answer without tools.
2. Call tool: the request needs one of the tools above.

Your output must be strict JSON with these fields:
- "action": "direct_response" or "call_tool".
- "tool_name": the tool to call when action is "call_tool", otherwise null.
- "arguments": an object of tool arguments when action is "call_tool", otherwise null. Only use parameters the tool declares, with the declared types. If a required parameter was not provided by the user, ask for it instead of calling the tool.
- "explanation": a short reason for the decision.

Conversation history:
{history}

Latest user request:
{input}"#,
        history = format_history(history),
    )
}

pub fn reply_prompt(history: &[Turn], input: &str, plan: Option<&Plan>, step: &ToolStep) -> String {
    let mut context = format!(
        "Conversation history:\n{}\n\nLatest user request:\n{}\n\n",
        format_history(history),
        input
    );

    match plan {
        Some(plan) => {
            let action = match plan.action {
                PlanAction::DirectResponse => "direct_response",
                PlanAction::CallTool => "call_tool",
            };
            context.push_str(&format!(
                "Assistant plan:\nAction: {}\nTool: {}\nArguments: {}\nExplanation: {}\n\n",
                action,
                plan.tool_name.as_deref().unwrap_or("none"),
                plan.arguments
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "none".to_string()),
                plan.explanation.as_deref().unwrap_or("none"),
            ));
        }
        None => context.push_str("The planning step failed.\n\n"),
    }

    match step {
        ToolStep::NeedsArguments { tool, missing } => context.push_str(&format!(
            "The tool '{}' was not called because these required parameters are missing: {}. \
Ask the user to provide them.\n\n",
            tool,
            missing.join(", ")
        )),
        _ => {
            if let Some(result) = step.result() {
                let rendered =
                    serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
                context.push_str(&format!("Tool result:\n```json\n{rendered}\n```\n\n"));
            } else if plan.is_some_and(|p| p.action == PlanAction::CallTool) {
                context.push_str("The tool call was not executed or failed.\n\n");
            }
        }
    }

    context.push_str("Using all of the information above, write the final reply to the user.");
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedGenerator;
    use crate::worker::ToolFailure;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTools {
        calls: Mutex<Vec<(String, Value)>>,
        outcome: Option<CallOutcome>,
    }

    #[async_trait]
    impl ToolDispatcher for RecordingTools {
        async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallOutcome, WorkerError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            self.outcome.clone().ok_or(WorkerError::ProcessTerminated {
                id: 1,
                exit_code: None,
            })
        }
    }

    fn agent(generator: &ScriptedGenerator, tools: Arc<RecordingTools>) -> Agent {
        Agent::new(
            Arc::new(generator.clone()),
            tools,
            ToolCatalog::protein_tools(),
        )
        .with_json_policy(JsonRetryPolicy {
            retries: 1,
            pause: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_direct_response_skips_tools() {
        let generator = ScriptedGenerator::new([
            r#"{"action":"direct_response","tool_name":null,"arguments":null,"explanation":"greeting"}"#,
            "Hello! How can I help?",
        ]);
        let tools = Arc::new(RecordingTools::default());
        let mut agent = agent(&generator, Arc::clone(&tools));

        let reply = agent.process_message("hi").await.unwrap();
        assert_eq!(reply.text, "Hello! How can I help?");
        assert_eq!(reply.tool_step, ToolStep::NotRequested);
        assert!(tools.calls.lock().unwrap().is_empty());
        assert_eq!(agent.history().len(), 2);

        let requests = generator.requests();
        assert_eq!(requests[0].temperature, PLAN_TEMPERATURE);
        assert_eq!(requests[0].max_tokens, PLAN_MAX_TOKENS);
        assert_eq!(requests[1].temperature, REPLY_TEMPERATURE);
    }

    #[tokio::test]
    async fn test_tool_call_result_reaches_reply_prompt() {
        let generator = ScriptedGenerator::new([
            r#"```json
{"action":"call_tool","tool_name":"get_protein_data","arguments":{"identifier":"P01308"},"explanation":"lookup"}
```"#,
            "Insulin is from Homo sapiens.",
        ]);
        let tools = Arc::new(RecordingTools {
            outcome: Some(CallOutcome::Result(json!({"organism": "Homo sapiens"}))),
            ..Default::default()
        });
        let mut agent = agent(&generator, Arc::clone(&tools));

        let reply = agent.process_message("Where is P01308 from?").await.unwrap();
        assert!(matches!(reply.tool_step, ToolStep::Executed { ref tool, .. } if tool == "get_protein_data"));
        assert_eq!(
            tools.calls.lock().unwrap()[0],
            ("get_protein_data".to_string(), json!({"identifier": "P01308"}))
        );
        assert!(generator.requests()[1].prompt.contains("Homo sapiens"));
    }

    #[tokio::test]
    async fn test_missing_arguments_are_requested_not_dispatched() {
        let generator = ScriptedGenerator::new([
            r#"{"action":"call_tool","tool_name":"predict_protein_function_tool","arguments":{},"explanation":"predict"}"#,
            "Please send the sequence.",
        ]);
        let tools = Arc::new(RecordingTools::default());
        let mut agent = agent(&generator, Arc::clone(&tools));

        let reply = agent.process_message("predict a function").await.unwrap();
        assert_eq!(
            reply.tool_step,
            ToolStep::NeedsArguments {
                tool: "predict_protein_function_tool".to_string(),
                missing: vec!["sequence".to_string()],
            }
        );
        assert!(tools.calls.lock().unwrap().is_empty());
        assert!(generator.requests()[1].prompt.contains("missing: sequence"));
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_error_object() {
        let generator = ScriptedGenerator::new([
            r#"{"action":"call_tool","tool_name":"echo","arguments":{"message":"x"}}"#,
            "The tool service is down.",
        ]);
        let tools = Arc::new(RecordingTools::default());
        let mut agent = agent(&generator, tools);

        let reply = agent.process_message("echo x").await.unwrap();
        match reply.tool_step {
            ToolStep::Executed { result, .. } => {
                assert!(result["error"].as_str().unwrap().contains("unavailable"));
            }
            other => panic!("Expected executed step, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_error_outcome_is_rendered() {
        let generator = ScriptedGenerator::new([
            r#"{"action":"call_tool","tool_name":"echo","arguments":{"message":"x"}}"#,
            "ok",
        ]);
        let tools = Arc::new(RecordingTools {
            outcome: Some(CallOutcome::ToolError(ToolFailure::new("boom"))),
            ..Default::default()
        });
        let mut agent = agent(&generator, tools);
        let reply = agent.process_message("echo x").await.unwrap();
        assert_eq!(
            reply.tool_step.result(),
            Some(&json!({"error": "Tool error: boom"}))
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let generator = ScriptedGenerator::new([
            r#"{"action":"call_tool","tool_name":"fold","arguments":{}}"#,
            "I can't do that.",
        ]);
        let tools = Arc::new(RecordingTools::default());
        let mut agent = agent(&generator, Arc::clone(&tools));
        let reply = agent.process_message("fold this").await.unwrap();
        assert!(matches!(reply.tool_step, ToolStep::Rejected { .. }));
        assert!(tools.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_plan_still_replies() {
        let generator = ScriptedGenerator::new(["nope", "still nope", "Sorry, could you rephrase?"]);
        let tools = Arc::new(RecordingTools::default());
        let mut agent = agent(&generator, tools);
        let reply = agent.process_message("???").await.unwrap();
        assert!(reply.plan.is_none());
        assert_eq!(reply.text, "Sorry, could you rephrase?");
        assert!(generator.requests()[2]
            .prompt
            .contains("The planning step failed."));
    }

    #[tokio::test]
    async fn test_clear_history() {
        let generator = ScriptedGenerator::new([
            r#"{"action":"direct_response"}"#,
            "hi",
        ]);
        let mut agent = agent(&generator, Arc::new(RecordingTools::default()));
        agent.process_message("hello").await.unwrap();
        assert_eq!(format_history(agent.history()), "User: hello\nAssistant: hi");
        agent.clear_history();
        assert!(agent.history().is_empty());
    }
}
