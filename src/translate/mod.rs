//! Mapping between the client-facing and the upstream chat completions schemas.
//!
//! Everything here is pure: values that depend on the clock come in through [`Synthesized`].

pub mod stream;

use std::{
    borrow::Cow,
    time::{SystemTime, UNIX_EPOCH},
};

use uuid::Uuid;

use crate::{
    openai::api::{self as openai, Role},
    xai::api as xai,
};

/// OpenAI model names the relay knows about.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OpenaiModel {
    Gpt4,
    Gpt4Turbo,
    Gpt4_32k,
    Gpt35Turbo,
    Gpt35Turbo16k,
}

impl OpenaiModel {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "gpt-4" => Self::Gpt4,
            "gpt-4-turbo" => Self::Gpt4Turbo,
            "gpt-4-32k" => Self::Gpt4_32k,
            "gpt-3.5-turbo" => Self::Gpt35Turbo,
            "gpt-3.5-turbo-16k" => Self::Gpt35Turbo16k,
            _ => return None,
        })
    }
}

/// Requested model name, classified.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ModelName<'a> {
    Missing,
    /// Already in the upstream namespace.
    Upstream(&'a str),
    Openai(OpenaiModel),
    Foreign(&'a str),
}

#[derive(Clone, Debug)]
pub struct ModelMap {
    default: String,
    prefix: String,
}

impl ModelMap {
    pub fn new(default: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            prefix: prefix.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default
    }

    pub fn classify<'a>(&self, model: Option<&'a str>) -> ModelName<'a> {
        match model {
            None | Some("") => ModelName::Missing,
            Some(name) if name.starts_with(&self.prefix) => ModelName::Upstream(name),
            Some(name) => match OpenaiModel::from_name(name) {
                Some(model) => ModelName::Openai(model),
                None => ModelName::Foreign(name),
            },
        }
    }

    /// Upstream names pass through, everything else becomes the default model.
    pub fn resolve<'a>(&'a self, model: Option<&'a str>) -> &'a str {
        match self.classify(model) {
            ModelName::Upstream(name) => name,
            ModelName::Foreign(name) => {
                log::debug!("Unknown model {name:?}, using {:?}", self.default);
                &self.default
            }
            ModelName::Missing | ModelName::Openai(_) => &self.default,
        }
    }
}

/// Values used when the upstream leaves `id` or `created` out.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Synthesized {
    pub id: String,
    pub created: u64,
}

impl Synthesized {
    pub fn now() -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::now_v7().simple()),
            created: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// `stop → stop`, `length → length`, `cancelled → stop`, `error → stop`,
/// `tool_use → tool_calls`; other reasons pass through and empty ones are dropped.
pub fn map_finish_reason(reason: Option<xai::FinishReason>) -> Option<openai::FinishReason> {
    Some(match reason? {
        xai::FinishReason::Stop | xai::FinishReason::Cancelled | xai::FinishReason::Error => {
            openai::FinishReason::Stop
        }
        xai::FinishReason::Length => openai::FinishReason::Length,
        xai::FinishReason::ToolUse => openai::FinishReason::ToolCalls,
        xai::FinishReason::Other(reason) if reason.is_empty() => return None,
        xai::FinishReason::Other(reason) => openai::FinishReason::Other(reason),
    })
}

#[derive(Clone, Debug)]
pub struct Mapper {
    models: ModelMap,
}

impl Mapper {
    pub fn new(models: ModelMap) -> Self {
        Self { models }
    }

    pub fn map_request<'a>(&self, req: openai::Request<'a>) -> xai::Request<'a> {
        let model = self.models.resolve(req.model.as_deref()).to_owned();
        let stop_sequences = match req.stop {
            None => None,
            Some(openai::Stop::One(stop)) if stop.is_empty() => None,
            Some(openai::Stop::One(stop)) => Some(vec![stop]),
            Some(openai::Stop::Many(stops)) => Some(stops),
        };
        xai::Request {
            messages: req.messages,
            model: Cow::Owned(model),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stream: req.stream,
            stop_sequences,
            frequency_penalty: req.frequency_penalty,
            presence_penalty: req.presence_penalty,
        }
    }

    pub fn map_response<'a>(
        &self,
        res: xai::Response<'a>,
        fallback: &Synthesized,
    ) -> openai::Response<'a> {
        openai::Response {
            id: res.id.unwrap_or_else(|| fallback.id.clone().into()),
            object: "chat.completion",
            created: res.created.unwrap_or(fallback.created),
            model: res.model.unwrap_or_else(|| self.default_model()),
            choices: res
                .choices
                .into_iter()
                .map(|choice| openai::Choice {
                    index: choice.index.unwrap_or(0),
                    message: openai::ResponseMessage {
                        role: Role::Assistant,
                        content: choice
                            .message
                            .and_then(|message| message.content)
                            .unwrap_or_default(),
                    },
                    finish_reason: map_finish_reason(choice.finish_reason),
                })
                .collect(),
            usage: res.usage.unwrap_or_default(),
        }
    }

    /// Maps one stream record. Any role signalled upstream becomes `assistant`; `content`
    /// keeps the difference between absent and empty.
    pub fn map_stream_chunk<'a>(
        &self,
        chunk: xai::ResponseStreamChunk<'a>,
        fallback: &Synthesized,
    ) -> openai::ResponseStreamChunk<'a> {
        openai::ResponseStreamChunk {
            id: chunk.id.unwrap_or_else(|| fallback.id.clone().into()),
            object: "chat.completion.chunk",
            created: chunk.created.unwrap_or(fallback.created),
            model: chunk.model.unwrap_or_else(|| self.default_model()),
            choices: chunk
                .choices
                .into_iter()
                .map(|choice| {
                    let delta = choice.delta.unwrap_or_default();
                    openai::StreamChoice {
                        index: choice.index.unwrap_or(0),
                        delta: openai::Delta {
                            role: delta
                                .role
                                .filter(|role| !role.is_empty())
                                .map(|_| Role::Assistant),
                            content: delta.content,
                        },
                        finish_reason: map_finish_reason(choice.finish_reason),
                    }
                })
                .collect(),
            usage: chunk.usage,
        }
    }

    fn default_model<'a>(&self) -> Cow<'a, str> {
        Cow::Owned(self.models.default_model().to_owned())
    }
}

#[cfg(test)]
fn mapper() -> Mapper {
    Mapper::new(ModelMap::new("grok-3-latest", "grok-"))
}

#[cfg(test)]
fn fallback() -> Synthesized {
    Synthesized {
        id: "chatcmpl-test".into(),
        created: 1_700_000_000,
    }
}

#[test]
fn model_names() {
    let models = ModelMap::new("grok-3-latest", "grok-");
    assert_eq!(models.classify(None), ModelName::Missing);
    assert_eq!(
        models.classify(Some("gpt-4")),
        ModelName::Openai(OpenaiModel::Gpt4)
    );
    assert_eq!(
        models.classify(Some("grok-2-mini")),
        ModelName::Upstream("grok-2-mini")
    );
    assert_eq!(
        models.classify(Some("claude-3")),
        ModelName::Foreign("claude-3")
    );

    assert_eq!(models.resolve(None), "grok-3-latest");
    assert_eq!(models.resolve(Some("gpt-3.5-turbo")), "grok-3-latest");
    assert_eq!(models.resolve(Some("claude-3")), "grok-3-latest");
    assert_eq!(models.resolve(Some("grok-2-mini")), "grok-2-mini");
}

#[test]
fn request_keeps_absent_fields_absent() {
    let req: openai::Request =
        serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
    let value = serde_json::to_value(mapper().map_request(req)).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}],
            "model": "grok-3-latest"
        })
    );
}

#[test]
fn request_keeps_explicit_zeros() {
    let req: openai::Request = serde_json::from_str(
        r#"{"messages":[{"role":"user","content":"hi"}],"model":"grok-beta",
            "max_tokens":0,"temperature":0,"top_p":0.5,"stream":false,
            "frequency_penalty":0,"presence_penalty":-1.5,"stop":"END"}"#,
    )
    .unwrap();
    let value = serde_json::to_value(mapper().map_request(req)).unwrap();
    assert_eq!(value["model"], "grok-beta");
    assert_eq!(value["max_tokens"], 0);
    assert_eq!(value["temperature"], 0.0);
    assert_eq!(value["top_p"], 0.5);
    assert_eq!(value["stream"], false);
    assert_eq!(value["frequency_penalty"], 0.0);
    assert_eq!(value["presence_penalty"], -1.5);
    assert_eq!(value["stop_sequences"], serde_json::json!(["END"]));
    assert!(value.get("stop").is_none());
}

#[test]
fn request_stop_forms() {
    let mapper = mapper();
    let map = |stop: &str| {
        let body = format!(r#"{{"messages":[{{"role":"user","content":"hi"}}],"stop":{stop}}}"#);
        let req: openai::Request = serde_json::from_str(&body).unwrap();
        serde_json::to_value(mapper.map_request(req)).unwrap()
    };
    assert_eq!(map(r#"["a","b"]"#)["stop_sequences"], serde_json::json!(["a", "b"]));
    assert!(map(r#""""#).get("stop_sequences").is_none());
    assert!(map("null").get("stop_sequences").is_none());
}

#[test]
fn finish_reasons() {
    use openai::FinishReason as Out;
    use xai::FinishReason as In;

    let map = |reason: &str| map_finish_reason(Some(In::from(reason.to_owned())));
    assert_eq!(map("stop"), Some(Out::Stop));
    assert_eq!(map("length"), Some(Out::Length));
    assert_eq!(map("cancelled"), Some(Out::Stop));
    assert_eq!(map("error"), Some(Out::Stop));
    assert_eq!(map("tool_use"), Some(Out::ToolCalls));
    assert_eq!(map("content_filter"), Some(Out::Other("content_filter".into())));
    assert_eq!(map(""), None);
    assert_eq!(map_finish_reason(None), None);
}

#[test]
fn response_synthesizes_missing_fields() {
    let res: xai::Response = serde_json::from_str(
        r#"{"choices":[{"message":{"content":"hello"},"finish_reason":"stop"},
                       {"index":1,"message":{},"finish_reason":"cancelled"}]}"#,
    )
    .unwrap();
    let value = serde_json::to_value(mapper().map_response(res, &fallback())).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "grok-3-latest",
            "choices": [
                {
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop"
                },
                {
                    "index": 1,
                    "message": {"role": "assistant", "content": ""},
                    "finish_reason": "stop"
                }
            ],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}
        })
    );
}

#[test]
fn response_keeps_upstream_fields() {
    let res: xai::Response = serde_json::from_str(
        r#"{"id":"abc","created":42,"model":"grok-2","choices":[{"index":0,
            "message":{"role":"assistant","content":"x"},"finish_reason":"tool_use"}],
            "usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
    )
    .unwrap();
    let value = serde_json::to_value(mapper().map_response(res, &fallback())).unwrap();
    assert_eq!(value["id"], "abc");
    assert_eq!(value["created"], 42);
    assert_eq!(value["model"], "grok-2");
    assert_eq!(value["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(value["usage"]["total_tokens"], 7);
}

#[test]
fn stream_chunk_delta() {
    let mapper = mapper();
    let map = |record: &str| {
        let chunk: xai::ResponseStreamChunk = serde_json::from_str(record).unwrap();
        serde_json::to_value(mapper.map_stream_chunk(chunk, &fallback())).unwrap()
    };

    let value = map(r#"{"choices":[{"delta":{"role":"model","content":"Hi"}}]}"#);
    assert_eq!(value["object"], "chat.completion.chunk");
    assert_eq!(value["id"], "chatcmpl-test");
    assert_eq!(
        value["choices"][0],
        serde_json::json!({
            "index": 0,
            "delta": {"role": "assistant", "content": "Hi"},
            "finish_reason": null
        })
    );

    let value = map(r#"{"choices":[{"delta":{"content":""}}]}"#);
    assert_eq!(value["choices"][0]["delta"], serde_json::json!({"content": ""}));

    let value = map(r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#);
    assert_eq!(value["choices"][0]["delta"], serde_json::json!({}));
    assert_eq!(value["choices"][0]["finish_reason"], "length");
}
