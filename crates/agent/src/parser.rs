//! Streaming gadget-call parser (C6): consumes model output incrementally
//! and yields text fragments and tool-call records in arrival order.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// The three literal markers a [`ParserConfig`] binds. Defaults match §6's
/// example trio; a caller may rebind them so long as the system prompt that
/// instructs the model uses the same values.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub start_prefix: String,
    pub end_prefix: String,
    pub arg_prefix: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            start_prefix: "!!!GADGET_START:".into(),
            end_prefix: "!!!GADGET_END".into(),
            arg_prefix: "!!!ARG:".into(),
        }
    }
}

/// A parsed (or partially parsed) gadget invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub invocation_id: String,
    pub gadget_name: String,
    pub dependencies: Vec<String>,
    pub parameters: Value,
    pub parameters_raw: String,
    pub parse_error: Option<String>,
}

/// One event the parser yields, in the order model output arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Text(String),
    ToolCall(ToolCallRecord),
}

/// Process-wide fallback for auto-generated invocation ids when no run-scoped
/// counter is threaded through (§5: "only fall back to a process-wide one
/// for opt-in auto-IDs at parse time where no context is available").
static AUTO_ID: AtomicU64 = AtomicU64::new(0);

fn next_auto_id() -> String {
    format!("auto-{}", AUTO_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug)]
enum State {
    Text,
    Block {
        name: String,
        invocation_id: String,
        dependencies: Vec<String>,
        raw: String,
    },
}

/// Incremental parser. Feed it text line-by-line (or in arbitrary chunks via
/// [`StreamParser::feed`], which internally re-buffers to line granularity)
/// and drain [`ParseEvent`]s with [`StreamParser::drain`]. Call
/// [`StreamParser::finish`] at end-of-stream to flush any block left open.
pub struct StreamParser {
    config: ParserConfig,
    state: State,
    pending: Vec<ParseEvent>,
    line_buf: String,
    text_buf: String,
}

impl StreamParser {
    pub fn new(config: ParserConfig) -> Self {
        StreamParser {
            config,
            state: State::Text,
            pending: Vec::new(),
            line_buf: String::new(),
            text_buf: String::new(),
        }
    }

    /// Feeds another chunk of streamed text. Lines are processed as soon as
    /// a `\n` completes them; a trailing partial line is held until the next
    /// `feed` or `finish`.
    pub fn feed(&mut self, chunk: &str) {
        self.line_buf.push_str(chunk);
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            self.process_line(line.strip_suffix('\n').unwrap_or(&line).to_string());
        }
    }

    /// Flushes any buffered partial line and, if a block is still open,
    /// emits it with whatever parameters could be parsed plus a
    /// `parseError` (§4.5 Buffering).
    pub fn finish(mut self) -> Vec<ParseEvent> {
        if !self.line_buf.is_empty() {
            let remainder = std::mem::take(&mut self.line_buf);
            self.process_line(remainder);
        }
        self.flush_text();
        if let State::Block {
            name,
            invocation_id,
            dependencies,
            raw,
        } = std::mem::replace(&mut self.state, State::Text)
        {
            self.pending.push(ParseEvent::ToolCall(finalize_block(
                &name,
                &invocation_id,
                dependencies,
                &raw,
                &self.config.arg_prefix,
                Some("unterminated gadget block at end of stream".to_string()),
            )));
        }
        self.pending
    }

    /// Drains every [`ParseEvent`] produced so far.
    pub fn drain(&mut self) -> Vec<ParseEvent> {
        std::mem::take(&mut self.pending)
    }

    fn flush_text(&mut self) {
        if !self.text_buf.is_empty() {
            let text = std::mem::take(&mut self.text_buf);
            self.pending.push(ParseEvent::Text(text));
        }
    }

    fn process_line(&mut self, line: String) {
        match &mut self.state {
            State::Text => {
                if let Some(meta) = line.strip_prefix(&self.config.start_prefix) {
                    self.flush_text();
                    let (name, invocation_id, dependencies) = parse_start_meta(meta);
                    self.state = State::Block {
                        name,
                        invocation_id,
                        dependencies,
                        raw: String::new(),
                    };
                } else {
                    self.text_buf.push_str(&line);
                    self.text_buf.push('\n');
                }
            }
            State::Block { .. } => {
                if line.starts_with(&self.config.end_prefix) {
                    let State::Block {
                        name,
                        invocation_id,
                        dependencies,
                        raw,
                    } = std::mem::replace(&mut self.state, State::Text)
                    else {
                        unreachable!()
                    };
                    self.pending.push(ParseEvent::ToolCall(finalize_block(
                        &name,
                        &invocation_id,
                        dependencies,
                        &raw,
                        &self.config.arg_prefix,
                        None,
                    )));
                } else if let Some(meta) = line.strip_prefix(&self.config.start_prefix) {
                    // Implicit termination: a new start marker closes the
                    // current block before the expected end marker (§4.5).
                    let State::Block {
                        name,
                        invocation_id,
                        dependencies,
                        raw,
                    } = std::mem::replace(&mut self.state, State::Text)
                    else {
                        unreachable!()
                    };
                    self.pending.push(ParseEvent::ToolCall(finalize_block(
                        &name,
                        &invocation_id,
                        dependencies,
                        &raw,
                        &self.config.arg_prefix,
                        Some("missing end marker before next gadget block".to_string()),
                    )));
                    let (name, invocation_id, dependencies) = parse_start_meta(meta);
                    self.state = State::Block {
                        name,
                        invocation_id,
                        dependencies,
                        raw: String::new(),
                    };
                } else {
                    let State::Block { raw, .. } = &mut self.state else {
                        unreachable!()
                    };
                    raw.push_str(&line);
                    raw.push('\n');
                }
            }
        }
    }
}

fn parse_start_meta(meta: &str) -> (String, String, Vec<String>) {
    let mut parts = meta.splitn(3, ':');
    let name = parts.next().unwrap_or("").trim().to_string();
    let invocation_id = match parts.next() {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => next_auto_id(),
    };
    let dependencies = match parts.next() {
        Some(deps) if !deps.trim().is_empty() => {
            deps.split(',').map(|d| d.trim().to_string()).collect()
        }
        _ => Vec::new(),
    };
    (name, invocation_id, dependencies)
}

fn finalize_block(
    name: &str,
    invocation_id: &str,
    dependencies: Vec<String>,
    raw: &str,
    arg_prefix: &str,
    forced_error: Option<String>,
) -> ToolCallRecord {
    let stripped = strip_code_fence(raw);
    match parse_block_params(&stripped, arg_prefix) {
        Ok(params) => ToolCallRecord {
            invocation_id: invocation_id.to_string(),
            gadget_name: name.to_string(),
            dependencies,
            parameters: params,
            parameters_raw: raw.to_string(),
            parse_error: forced_error,
        },
        Err(parse_err) => ToolCallRecord {
            invocation_id: invocation_id.to_string(),
            gadget_name: name.to_string(),
            dependencies,
            parameters: Value::Object(Default::default()),
            parameters_raw: raw.to_string(),
            parse_error: Some(forced_error.unwrap_or(parse_err)),
        },
    }
}

fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('\n');
    let mut lines: Vec<&str> = trimmed.split('\n').collect();
    if lines.len() >= 2 {
        let first_is_fence = lines
            .first()
            .map(|l| {
                let l = l.trim();
                l == "```" || l == "```toml" || l == "```yaml" || l == "```json"
            })
            .unwrap_or(false);
        let last_is_fence = lines.last().map(|l| l.trim() == "```").unwrap_or(false);
        if first_is_fence && last_is_fence {
            lines.remove(0);
            lines.pop();
            return lines.join("\n");
        }
    }
    raw.to_string()
}

/// Parses the `prefix:ArgName value` / heredoc grammar between markers into
/// a JSON object. Scalars coerce to string/number/bool/null; repeated names
/// accumulate into an array.
fn parse_block_params(body: &str, arg_prefix: &str) -> Result<Value, String> {
    let mut map = serde_json::Map::new();
    let lines: Vec<&str> = body.split('\n').collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.trim().is_empty() {
            i += 1;
            continue;
        }
        let Some(rest) = line.strip_prefix(arg_prefix) else {
            return Err(format!("unrecognized line in gadget block: {line:?}"));
        };
        let rest = rest.trim_start();
        let (name, inline_value) = match rest.split_once(' ') {
            Some((n, v)) => (n.to_string(), Some(v.to_string())),
            None => (rest.to_string(), None),
        };
        i += 1;
        let value = if let Some(v) = inline_value {
            coerce_scalar(&v)
        } else if i < lines.len() && lines[i].trim_start().starts_with("<<<") {
            let sentinel = lines[i].trim_start().trim_start_matches("<<<").trim().to_string();
            i += 1;
            let mut body_lines = Vec::new();
            let mut closed = false;
            while i < lines.len() {
                if lines[i].trim() == sentinel {
                    closed = true;
                    i += 1;
                    break;
                }
                body_lines.push(lines[i]);
                i += 1;
            }
            if !closed {
                return Err(format!("unterminated heredoc for argument {name:?}"));
            }
            Value::String(body_lines.join("\n"))
        } else {
            Value::Null
        };
        insert_arg(&mut map, &name, value);
    }
    Ok(Value::Object(map))
}

fn insert_arg(map: &mut serde_json::Map<String, Value>, name: &str, value: Value) {
    match map.get_mut(name) {
        None => {
            map.insert(name.to_string(), value);
        }
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let prior = existing.clone();
            map.insert(name.to_string(), Value::Array(vec![prior, value]));
        }
    }
}

fn coerce_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed == "null" {
        return Value::Null;
    }
    if trimmed == "true" {
        return Value::Bool(true);
    }
    if trimmed == "false" {
        return Value::Bool(false);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(trimmed.to_string())
}
