//! The message model (C4): role-tagged messages whose content is either a
//! plain string or an ordered list of typed parts, plus the tool schema
//! types exchanged with a provider's native function-calling surface.

use schemars::schema::{
    InstanceType, Metadata, ObjectValidation, Schema, SchemaObject, SingleOrVec,
};
use schemars::{gen::SchemaGenerator, JsonSchema};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::ToolCall;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// The supported MIME type of an image part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ImageMime {
    JPEG,
    PNG,
    GIF,
    WEBP,
}

impl ImageMime {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageMime::JPEG => "image/jpeg",
            ImageMime::PNG => "image/png",
            ImageMime::GIF => "image/gif",
            ImageMime::WEBP => "image/webp",
        }
    }
}

/// One part of a multimodal message's content list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
    ImageBase64 { media_type: ImageMime, data: String },
    Audio { media_type: String, data: String },
}

/// A message's content: either a plain string, or an ordered list of parts
/// for multimodal input. Mirrors the Message entity's `content` field
/// (`string | ordered list of {text}|{image}|{audio}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// Concatenates every text-bearing part; used for token estimation and
    /// for compaction's turn-partitioning heuristics.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            MessageContent::Text(_) => 0,
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::ImageUrl { .. } | ContentPart::ImageBase64 { .. }))
                .count(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// A single message in a chat conversation (C4's Message entity).
///
/// Invariant: `content` is never empty when `role != Assistant` — the loop
/// and conversation store uphold this at construction time rather than
/// validating it on every read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<MessageContent>) -> Self {
        ChatMessage {
            role: ChatRole::System,
            content: content.into(),
            name: None,
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        ChatMessage {
            role: ChatRole::Assistant,
            content: content.into(),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Represents a single parameter in a function tool's JSON-schema-shaped
/// parameter description (used for the provider's native function-calling
/// surface, distinct from the gadget parameter schema in `crate::schema`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParameterProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterProperty>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "enum")]
    pub enum_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParametersSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: HashMap<String, ParameterProperty>,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A tool definition as sent to a provider that speaks native function
/// calling, distinct from the gadget wire format in `runtime-agent`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionTool,
}

/// How the model is allowed to use the tools it was given.
#[derive(Debug, Clone, Default)]
pub enum ToolChoice {
    /// Model must use at least one tool.
    Any,
    /// Model may use any tool, or none. Default.
    #[default]
    Auto,
    /// Model must use exactly the named tool.
    Tool(String),
    /// Tools are disabled for this call.
    None,
}

impl Serialize for ToolChoice {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ToolChoice::Any => serializer.serialize_str("required"),
            ToolChoice::Auto => serializer.serialize_str("auto"),
            ToolChoice::None => serializer.serialize_str("none"),
            ToolChoice::Tool(name) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "function")?;
                let mut function_obj = HashMap::new();
                function_obj.insert("name", name.as_str());
                map.serialize_entry("function", &function_obj)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ToolChoice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ToolChoiceVisitor;

        impl<'de> Visitor<'de> for ToolChoiceVisitor {
            type Value = ToolChoice;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "a string (`required`, `auto`, `none`) or an object `{ type: \"function\", function: { name: ... } }`",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    "required" => Ok(ToolChoice::Any),
                    "auto" => Ok(ToolChoice::Auto),
                    "none" => Ok(ToolChoice::None),
                    other => Err(de::Error::unknown_variant(
                        other,
                        &["required", "auto", "none"],
                    )),
                }
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut seen_name: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "type" => {
                            let t: String = map.next_value()?;
                            if t != "function" {
                                return Err(de::Error::invalid_value(
                                    de::Unexpected::Str(&t),
                                    &"function",
                                ));
                            }
                        }
                        "function" => {
                            let func_map: serde_json::Map<String, Value> = map.next_value()?;
                            if let Some(Value::String(name)) = func_map.get("name") {
                                seen_name = Some(name.clone());
                            } else {
                                return Err(de::Error::missing_field("name"));
                            }
                        }
                        _ => {
                            let _ignored: Value = map.next_value()?;
                        }
                    }
                }
                let name = seen_name.ok_or_else(|| de::Error::missing_field("function"))?;
                Ok(ToolChoice::Tool(name))
            }
        }

        deserializer.deserialize_any(ToolChoiceVisitor)
    }
}

impl JsonSchema for ToolChoice {
    fn schema_name() -> String {
        "ToolChoice".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        let str_schema = SchemaObject {
            instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::String))),
            metadata: Some(Box::new(Metadata {
                description: Some(
                    "One of the string options: \"required\", \"auto\", \"none\"".to_string(),
                ),
                ..Default::default()
            })),
            enum_values: Some(vec![
                Value::String("required".to_string()),
                Value::String("auto".to_string()),
                Value::String("none".to_string()),
            ]),
            ..Default::default()
        };

        let mut func_obj = ObjectValidation::default();
        func_obj.required.insert("type".to_string());
        func_obj.required.insert("function".to_string());
        func_obj.properties.insert(
            "type".to_string(),
            Schema::Object(SchemaObject {
                instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::String))),
                enum_values: Some(vec![Value::String("function".to_string())]),
                ..Default::default()
            }),
        );

        let mut inner = ObjectValidation::default();
        inner.required.insert("name".to_string());
        inner.properties.insert(
            "name".to_string(),
            Schema::Object(SchemaObject {
                instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::String))),
                ..Default::default()
            }),
        );
        func_obj.properties.insert(
            "function".to_string(),
            Schema::Object(SchemaObject {
                instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::Object))),
                object: Some(Box::new(inner)),
                ..Default::default()
            }),
        );

        let mut schema = SchemaObject::default();
        schema.subschemas = Some(Box::new(schemars::schema::SubschemaValidation {
            any_of: Some(vec![
                Schema::Object(str_schema),
                Schema::Object(SchemaObject {
                    instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::Object))),
                    object: Some(Box::new(func_obj)),
                    ..Default::default()
                }),
            ]),
            ..Default::default()
        }));

        Schema::Object(schema)
    }
}

/// Why the model stopped generating.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
    Unknown,
}

/// One event in a provider's streamed response (C3's `Chunk`, exploded into
/// its constituent deltas so the stream parser in `runtime-agent` can
/// consume text incrementally while tool-use blocks assemble alongside it).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Plain-text delta, fed to the tool-call-block parser.
    Text(String),
    /// Reasoning/thinking delta. Reported through the event tree but never
    /// appended to the conversation (see `spec.md` §4.3).
    Thinking(String),
    /// Native provider tool-use block started.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },
    /// Native provider tool-use input JSON delta.
    ToolUseInputDelta { index: usize, partial_json: String },
    /// Native provider tool-use block complete.
    ToolUseComplete { index: usize, tool_call: ToolCall },
    /// Usage accounting, usually the final chunk.
    Usage(crate::Usage),
    /// Stream ended.
    Done { finish_reason: FinishReason },
}
