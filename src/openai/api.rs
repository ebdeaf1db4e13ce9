use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::borrow::Cow;

use crate::error::ApiError;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message<'a> {
    pub role: Role,
    pub content: Cow<'a, str>,
}

/// Either a single stop string or a list of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stop<'a> {
    One(Cow<'a, str>),
    Many(Vec<Cow<'a, str>>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request<'a> {
    pub messages: Vec<Message<'a>>,
    #[serde(default)]
    pub model: Option<Cow<'a, str>>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<Stop<'a>>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
}

impl Request<'_> {
    /// Checks what deserialization alone can't: at least one message, none of them empty.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.messages.is_empty() {
            return Err(ApiError::invalid_request(
                "Request must contain a messages array with at least one message",
            ));
        }
        if let Some(i) = self.messages.iter().position(|m| m.content.is_empty()) {
            return Err(ApiError::invalid_request(format!(
                "Message {i} must have non-empty content"
            )));
        }
        Ok(())
    }

    pub fn is_stream(&self) -> bool {
        self.stream == Some(true)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(into = "String")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Other(String),
}

impl From<FinishReason> for String {
    fn from(reason: FinishReason) -> Self {
        match reason {
            FinishReason::Stop => "stop".into(),
            FinishReason::Length => "length".into(),
            FinishReason::ToolCalls => "tool_calls".into(),
            FinishReason::Other(reason) => reason,
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResponseMessage<'a> {
    pub role: Role,
    pub content: Cow<'a, str>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Choice<'a> {
    pub index: u32,
    pub message: ResponseMessage<'a>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Response<'a> {
    pub id: Cow<'a, str>,
    pub object: &'static str,
    pub created: u64,
    pub model: Cow<'a, str>,
    pub choices: SmallVec<[Choice<'a>; 1]>,
    pub usage: Usage,
}

#[derive(Clone, Default, Debug, Serialize)]
pub struct Delta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Cow<'a, str>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamChoice<'a> {
    pub index: u32,
    pub delta: Delta<'a>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResponseStreamChunk<'a> {
    pub id: Cow<'a, str>,
    pub object: &'static str,
    pub created: u64,
    pub model: Cow<'a, str>,
    pub choices: SmallVec<[StreamChoice<'a>; 1]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[test]
fn parse_request() {
    let req: Request = serde_json::from_str(
        r#"{"messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}],
            "model":"gpt-4","stop":["a","b"],"stream":true}"#,
    )
    .unwrap();
    assert_eq!(req.messages.len(), 2);
    assert_eq!(req.messages[0].role, Role::System);
    assert_eq!(req.model.as_deref(), Some("gpt-4"));
    assert_eq!(req.stop, Some(Stop::Many(vec!["a".into(), "b".into()])));
    assert!(req.is_stream());
    assert!(req.temperature.is_none());
    req.validate().unwrap();
}

#[test]
fn reject_structure() {
    for body in [
        r#"{}"#,
        r#"{"messages":[{"role":"tool","content":"x"}]}"#,
        r#"{"messages":[{"role":"user"}]}"#,
        r#"{"messages":[{"role":"user","content":"x"}],"stream":"yes"}"#,
    ] {
        assert!(serde_json::from_str::<Request>(body).is_err(), "{body}");
    }

    for body in [
        r#"{"messages":[]}"#,
        r#"{"messages":[{"role":"user","content":""}]}"#,
    ] {
        let req: Request = serde_json::from_str(body).unwrap();
        assert!(req.validate().is_err(), "{body}");
    }
}
