use serde::{Deserialize, Serialize};

/// A tool invocation requested by the model (provider-agnostic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// The provider-assigned call id (`tool_call_id` on the wire).
    #[serde(rename = "tool_call_id")]
    pub call_id: String,
    #[serde(rename = "name")]
    pub tool_name: String,
    #[serde(rename = "args")]
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A message in the conversation history (provider-agnostic).
///
/// Read back from the store in `step_order`, a conversation is a valid
/// alternation: user request → (model response with tool calls → one tool
/// return per call)* → model response (final text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// A tool return, tagged with both the originating call id and the tool
    /// name so history reconstruction can re-attribute it.
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// An assistant response carrying optional text plus its tool calls.
    pub fn assistant_with_tool_calls(text: &str, tool_calls: &[ToolCall]) -> Self {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text: text.to_owned() });
        }
        for tc in tool_calls {
            parts.push(ContentPart::ToolUse {
                id: tc.call_id.clone(),
                name: tc.tool_name.clone(),
                input: tc.arguments.clone(),
            });
        }
        Self {
            role: Role::Assistant,
            content: MessageContent::Parts(parts),
        }
    }

    pub fn tool_return(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                tool_name: tool_name.into(),
                content: content.into(),
                is_error: false,
            }]),
        }
    }
}

impl MessageContent {
    /// Extract and join all text content.
    ///
    /// `Text` returns the string directly; `Parts` joins all text parts with
    /// `"\n"`, skipping tool-use and tool-result parts.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// The tool calls carried by this content, if any.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolUse { id, name, input } => Some(ToolCall {
                        call_id: id.clone(),
                        tool_name: name.clone(),
                        arguments: input.clone(),
                    }),
                    _ => None,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_wire_field_names() {
        let tc = ToolCall {
            call_id: "c1".into(),
            tool_name: "ls".into(),
            arguments: serde_json::json!({"path": "/workspace"}),
        };
        let v = serde_json::to_value(&tc).unwrap();
        assert_eq!(v["tool_call_id"], "c1");
        assert_eq!(v["name"], "ls");
        assert_eq!(v["args"]["path"], "/workspace");
    }

    #[test]
    fn assistant_with_tool_calls_empty_text() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_name: "grep".into(),
            arguments: serde_json::json!({}),
        }];
        let msg = Message::assistant_with_tool_calls("", &calls);
        match &msg.content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                assert!(matches!(parts[0], ContentPart::ToolUse { .. }));
            }
            _ => panic!("expected Parts content"),
        }
        assert_eq!(msg.content.tool_calls(), calls);
    }

    #[test]
    fn assistant_with_tool_calls_text_and_calls() {
        let calls = vec![
            ToolCall {
                call_id: "a".into(),
                tool_name: "read_file".into(),
                arguments: serde_json::json!({"path": "x"}),
            },
            ToolCall {
                call_id: "b".into(),
                tool_name: "write_file".into(),
                arguments: serde_json::json!({"path": "y", "content": ""}),
            },
        ];
        let msg = Message::assistant_with_tool_calls("working on it", &calls);
        assert_eq!(msg.content.extract_all_text(), "working on it");
        assert_eq!(msg.content.tool_calls().len(), 2);
    }

    #[test]
    fn tool_return_carries_name_and_id() {
        let msg = Message::tool_return("c9", "execute", "exit 0");
        match &msg.content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::ToolResult {
                    tool_use_id,
                    tool_name,
                    content,
                    is_error,
                } => {
                    assert_eq!(tool_use_id, "c9");
                    assert_eq!(tool_name, "execute");
                    assert_eq!(content, "exit 0");
                    assert!(!is_error);
                }
                _ => panic!("expected ToolResult part"),
            },
            _ => panic!("expected Parts content"),
        }
    }

    #[test]
    fn extract_all_text_skips_non_text_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "one".into() },
            ContentPart::ToolUse {
                id: "c".into(),
                name: "ls".into(),
                input: serde_json::json!({}),
            },
            ContentPart::Text { text: "two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "one\ntwo");
    }
}
