//! Conversation store (C8): an ordered message list split into base,
//! initial, and appended regions, with a single-writer invariant enforced
//! by construction (only the loop holds a `&mut ConversationStore`).

use crate::parser::{ParserConfig, ToolCallRecord};
use runtime_core::chat::ChatMessage;

/// Three-region message list. `base` and `initial` are fixed at
/// construction; `appended` is the only region a running loop writes to
/// (§4.7, §5 "single-writer invariant").
#[derive(Debug, Clone)]
pub struct ConversationStore {
    base: Vec<ChatMessage>,
    initial: Vec<ChatMessage>,
    appended: Vec<ChatMessage>,
}

impl ConversationStore {
    /// `base` is the system prompt plus tool instructions built at agent
    /// construction; `initial` is caller-supplied prior history.
    pub fn new(base: Vec<ChatMessage>, initial: Vec<ChatMessage>) -> Self {
        ConversationStore { base, initial, appended: Vec::new() }
    }

    /// Concatenation of all three regions, in order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.base
            .iter()
            .chain(self.initial.iter())
            .chain(self.appended.iter())
            .cloned()
            .collect()
    }

    /// Length of the base + initial regions, which compaction (C9) must
    /// never shrink below.
    pub fn protected_len(&self) -> usize {
        self.base.len() + self.initial.len()
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.appended.push(message);
    }

    pub fn append_all(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.appended.extend(messages);
    }

    /// Replaces the appended region wholesale — the only way compaction
    /// (C9) may shrink the conversation, since base/initial are untouched.
    pub fn replace_appended(&mut self, messages: Vec<ChatMessage>) {
        self.appended = messages;
    }

    pub fn appended(&self) -> &[ChatMessage] {
        &self.appended
    }

    pub fn initial(&self) -> &[ChatMessage] {
        &self.initial
    }

    pub fn base(&self) -> &[ChatMessage] {
        &self.base
    }
}

/// Renders one completed tool call as the synthetic user/assistant message
/// pair appended to the conversation so later iterations can reparse the
/// call and its result in the same grammar the live parser understands
/// (§4.7, §6 "Tool result back to the model").
pub fn render_tool_record(config: &ParserConfig, call: &ToolCallRecord, result: &str) -> (ChatMessage, ChatMessage) {
    let mut block = String::new();
    block.push_str(&config.start_prefix);
    block.push_str(&call.gadget_name);
    block.push(':');
    block.push_str(&call.invocation_id);
    if !call.dependencies.is_empty() {
        block.push(':');
        block.push_str(&call.dependencies.join(","));
    }
    block.push('\n');
    if let Some(obj) = call.parameters.as_object() {
        for (name, value) in obj {
            render_arg(&mut block, config, name, value);
        }
    }
    block.push_str(&config.end_prefix);
    block.push('\n');

    let call_message = ChatMessage::user(block);
    let result_message = ChatMessage::assistant(result.to_string());
    (call_message, result_message)
}

/// Writes one argument into `block`. A top-level array value — the only
/// shape the parser's "repeated arg names accumulate into an array" rule
/// (§4.5) produces — is rendered as one `ARG` line per element rather than a
/// single JSON-array string, so it reparses back into an array instead of a
/// scalar. A string containing a newline is written as a `<<<HEREDOC …
/// HEREDOC` block rather than inline, since an inline line break would
/// truncate the value on reparse (§6, §8 round-trip invariant).
fn render_arg(block: &mut String, config: &ParserConfig, name: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                render_arg(block, config, name, item);
            }
        }
        serde_json::Value::String(s) if s.contains('\n') => {
            block.push_str(&config.arg_prefix);
            block.push_str(name);
            block.push('\n');
            block.push_str("<<<EOF\n");
            for line in s.split('\n') {
                block.push_str(line);
                block.push('\n');
            }
            block.push_str("EOF\n");
        }
        other => {
            block.push_str(&config.arg_prefix);
            block.push_str(name);
            block.push(' ');
            block.push_str(&render_scalar(other));
            block.push('\n');
        }
    }
}

fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
