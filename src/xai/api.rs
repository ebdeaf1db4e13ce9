use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::openai::api::{Message, Usage};

/// Request in the upstream schema. Absent tunables stay absent on the wire.
#[derive(Clone, Debug, Serialize)]
pub struct Request<'a> {
    pub messages: Vec<Message<'a>>,
    pub model: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<Cow<'a, str>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
#[serde(from = "String")]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
    Error,
    ToolUse,
    Other(String),
}

impl From<String> for FinishReason {
    fn from(reason: String) -> Self {
        match reason.as_str() {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "cancelled" => Self::Cancelled,
            "error" => Self::Error,
            "tool_use" => Self::ToolUse,
            _ => Self::Other(reason),
        }
    }
}

#[derive(Clone, Default, Debug, Deserialize)]
pub struct ResponseMessage<'a> {
    #[serde(default)]
    pub content: Option<Cow<'a, str>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Choice<'a> {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub message: Option<ResponseMessage<'a>>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Non-stream response. Every field may be missing on the wire.
#[derive(Clone, Default, Debug, Deserialize)]
pub struct Response<'a> {
    #[serde(default)]
    pub id: Option<Cow<'a, str>>,
    #[serde(default)]
    pub created: Option<u64>,
    #[serde(default)]
    pub model: Option<Cow<'a, str>>,
    #[serde(default)]
    pub choices: Vec<Choice<'a>>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Clone, Default, Debug, Deserialize)]
pub struct Delta<'a> {
    #[serde(default)]
    pub content: Option<Cow<'a, str>>,
    #[serde(default)]
    pub role: Option<Cow<'a, str>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StreamChoice<'a> {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub delta: Option<Delta<'a>>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// One `data:` record of a streamed response.
#[derive(Clone, Default, Debug, Deserialize)]
pub struct ResponseStreamChunk<'a> {
    #[serde(default)]
    pub id: Option<Cow<'a, str>>,
    #[serde(default)]
    pub created: Option<u64>,
    #[serde(default)]
    pub model: Option<Cow<'a, str>>,
    #[serde(default)]
    pub choices: Vec<StreamChoice<'a>>,
    #[serde(default)]
    pub usage: Option<Usage>,
}
