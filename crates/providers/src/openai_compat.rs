//! OpenAI-compatible adapter. Works against OpenAI, Azure-style gateways,
//! vLLM, Ollama, LM Studio — anything speaking the chat-completions
//! contract.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use dg_domain::error::{Error, Result};
use dg_domain::stream::{BoxStream, StreamEvent, Usage};
use dg_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};

use crate::sse;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::from_reqwest;

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_wire).collect());
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_return_to_wire(msg),
        Role::Assistant => assistant_to_wire(msg),
        Role::System => serde_json::json!({
            "role": "system",
            "content": msg.content.extract_all_text(),
        }),
        Role::User => serde_json::json!({
            "role": "user",
            "content": msg.content.extract_all_text(),
        }),
    }
}

fn assistant_to_wire(msg: &Message) -> Value {
    let text = msg.content.extract_all_text();
    let tool_calls: Vec<Value> = msg
        .content
        .tool_calls()
        .iter()
        .map(|tc| {
            serde_json::json!({
                "id": tc.call_id,
                "type": "function",
                "function": {
                    "name": tc.tool_name,
                    "arguments": tc.arguments.to_string(),
                }
            })
        })
        .collect();

    let mut obj = serde_json::json!({"role": "assistant"});
    obj["content"] = if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_return_to_wire(msg: &Message) -> Value {
    if let MessageContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } = part
            {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({
        "role": "tool",
        "tool_call_id": "",
        "content": msg.content.extract_all_text(),
    })
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Non-streaming response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(provider: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: provider.into(),
            message: "no choices in response".into(),
        })?;
    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: provider.into(),
        message: "no message in choice".into(),
    })?;

    Ok(ChatResponse {
        content: message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        tool_calls: parse_wire_tool_calls(message),
        usage: body.get("usage").and_then(parse_wire_usage),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

fn parse_wire_tool_calls(message: &Value) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let call_id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let tool_name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
                    let arguments =
                        serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
                    Some(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_wire_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming: tool-call assembly across delta chunks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct PendingCall {
    call_id: String,
    name: String,
    args: String,
}

/// Chunk parser state: tool calls arrive sliced across deltas keyed by
/// index; they are assembled here and emitted as `ToolCallFinished` when
/// the finish chunk arrives.
#[derive(Default)]
struct StreamState {
    calls: BTreeMap<u64, PendingCall>,
}

impl StreamState {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data.trim() == "[DONE]" {
            let mut events = self.flush_calls();
            events.push(Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            }));
            return events;
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first());

        // Usage-only chunk (stream_options.include_usage).
        let Some(choice) = choice else {
            if let Some(usage) = v.get("usage").and_then(parse_wire_usage) {
                return vec![Ok(StreamEvent::Done {
                    usage: Some(usage),
                    finish_reason: None,
                })];
            }
            return Vec::new();
        };

        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            let mut events = self.flush_calls();
            events.push(Ok(StreamEvent::Done {
                usage: v.get("usage").and_then(parse_wire_usage),
                finish_reason: Some(reason.to_string()),
            }));
            return events;
        }

        let delta = choice.get("delta").unwrap_or(&Value::Null);
        let mut events = Vec::new();

        if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    entry.call_id = id.to_string();
                }
                if let Some(func) = tc.get("function") {
                    if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                        entry.name.push_str(name);
                        events.push(Ok(StreamEvent::ToolCallStarted {
                            call_id: entry.call_id.clone(),
                            tool_name: entry.name.clone(),
                        }));
                    }
                    if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                        entry.args.push_str(args);
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            call_id: entry.call_id.clone(),
                            delta: args.to_string(),
                        }));
                    }
                }
            }
        }

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token {
                    text: text.to_string(),
                }));
            }
        }

        events
    }

    fn flush_calls(&mut self) -> Vec<Result<StreamEvent>> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|pending| {
                let arguments = if pending.args.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&pending.args).unwrap_or_else(|e| {
                        tracing::warn!(
                            call_id = %pending.call_id,
                            tool = %pending.name,
                            error = %e,
                            "tool call arguments are not valid JSON, defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                };
                Ok(StreamEvent::ToolCallFinished {
                    call_id: pending.call_id,
                    tool_name: pending.name,
                    arguments,
                })
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);
        tracing::debug!(provider = %self.id, model = %self.model, "chat request");

        let resp = self
            .authed_post(&self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = resp.status();
        let text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }
        parse_chat_response(&self.id, &serde_json::from_str(&text)?)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(req, true);
        tracing::debug!(provider = %self.id, model = %self.model, "stream request");

        let resp = self
            .authed_post(&self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let mut state = StreamState::default();
        Ok(sse::sse_response_stream(resp, move |data| state.parse(data)))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(state: &mut StreamState, chunks: &[&str]) -> Vec<StreamEvent> {
        chunks
            .iter()
            .flat_map(|c| state.parse(c))
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn text_deltas_become_tokens() {
        let mut state = StreamState::default();
        let events = parse_all(
            &mut state,
            &[
                r#"{"choices":[{"delta":{"content":"hi "}}]}"#,
                r#"{"choices":[{"delta":{"content":"there"}}]}"#,
            ],
        );
        assert!(matches!(&events[0], StreamEvent::Token { text } if text == "hi "));
        assert!(matches!(&events[1], StreamEvent::Token { text } if text == "there"));
    }

    #[test]
    fn tool_call_assembles_across_deltas() {
        let mut state = StreamState::default();
        let events = parse_all(
            &mut state,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"ls","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"/workspace\"}"}}]}}]}"#,
                r#"{"choices":[{"finish_reason":"tool_calls"}]}"#,
            ],
        );

        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => Some((call_id.clone(), tool_name.clone(), arguments.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, "c1");
        assert_eq!(finished[0].1, "ls");
        assert_eq!(finished[0].2["path"], "/workspace");
        assert!(matches!(events.last().unwrap(), StreamEvent::Done { .. }));
    }

    #[test]
    fn parallel_tool_calls_by_index() {
        let mut state = StreamState::default();
        let events = parse_all(
            &mut state,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"glob","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"c2","function":{"name":"grep","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"finish_reason":"tool_calls"}]}"#,
            ],
        );
        let ids: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallFinished { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn malformed_args_default_to_empty_object() {
        let mut state = StreamState::default();
        state
            .parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"ls","arguments":"not json"}}]}}]}"#)
            .into_iter()
            .for_each(|e| {
                e.unwrap();
            });

        let done = state.parse("[DONE]");
        let finished = done
            .iter()
            .find_map(|e| match e {
                Ok(StreamEvent::ToolCallFinished { arguments, .. }) => Some(arguments.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(finished, serde_json::json!({}));
    }

    #[test]
    fn unparseable_chunk_surfaces_json_error() {
        let mut state = StreamState::default();
        let events = state.parse("definitely not json");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }

    #[test]
    fn usage_only_chunk_yields_done_with_usage() {
        let mut state = StreamState::default();
        let events = parse_all(
            &mut state,
            &[r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#],
        );
        match &events[0] {
            StreamEvent::Done { usage: Some(u), .. } => assert_eq!(u.total_tokens, 15),
            other => panic!("expected Done with usage, got {other:?}"),
        }
    }

    #[test]
    fn non_streaming_response_parses_tool_calls() {
        let body = serde_json::json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "ls", "arguments": "{\"path\":\"/\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        });
        let resp = parse_chat_response("test", &body).unwrap();
        assert_eq!(resp.content, "");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "ls");
        assert_eq!(resp.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn assistant_message_with_calls_serializes_for_wire() {
        let msg = Message::assistant_with_tool_calls(
            "",
            &[ToolCall {
                call_id: "c1".into(),
                tool_name: "ls".into(),
                arguments: serde_json::json!({"path": "/"}),
            }],
        );
        let wire = msg_to_wire(&msg);
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "ls");
    }

    #[test]
    fn tool_return_serializes_with_call_id() {
        let msg = Message::tool_return("c1", "ls", "uploads/");
        let wire = msg_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
        assert_eq!(wire["content"], "uploads/");
    }
}
