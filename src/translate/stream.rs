use std::sync::Arc;

use smallvec::SmallVec;

use super::{Mapper, Synthesized};
use crate::{openai::api as openai, sse::Line, xai::api as xai};

pub const DONE: &str = "[DONE]";

#[derive(Clone, Debug)]
pub enum Translated<'a> {
    Chunk(openai::ResponseStreamChunk<'a>),
    /// The upstream sent its terminal sentinel.
    Done,
}

/// Turns complete upstream event-stream lines into client-facing chunks.
///
/// Lives for one relayed stream. `role` reaches the client only on the first chunk of each
/// choice that carries one.
pub struct StreamTranslator {
    mapper: Arc<Mapper>,
    fallback: Synthesized,
    roles_sent: SmallVec<[u32; 1]>,
}

impl StreamTranslator {
    pub fn new(mapper: Arc<Mapper>, fallback: Synthesized) -> Self {
        Self {
            mapper,
            fallback,
            roles_sent: SmallVec::new(),
        }
    }

    /// Keep-alives, comments, non-`data` fields and malformed records yield `None`. A
    /// malformed record is logged and does not end the stream.
    pub fn translate<'a>(&mut self, line: &'a str) -> Option<Translated<'a>> {
        let Some(payload) = Line::from_str(line).data() else {
            if !line.is_empty() {
                log::debug!("Skipping non-data line: {line:?}");
            }
            return None;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == DONE {
            return Some(Translated::Done);
        }

        let chunk: xai::ResponseStreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Dropping malformed upstream stream record: {e}");
                log::debug!("Malformed record: {line}");
                return None;
            }
        };
        log::trace!("Upstream stream record: {chunk:?}");

        let mut chunk = self.mapper.map_stream_chunk(chunk, &self.fallback);
        for choice in &mut chunk.choices {
            if choice.delta.role.is_some() {
                if self.roles_sent.contains(&choice.index) {
                    choice.delta.role = None;
                } else {
                    self.roles_sent.push(choice.index);
                }
            }
        }
        Some(Translated::Chunk(chunk))
    }
}

#[cfg(test)]
fn translator() -> StreamTranslator {
    StreamTranslator::new(
        Arc::new(Mapper::new(super::ModelMap::new("grok-3-latest", "grok-"))),
        Synthesized {
            id: "chatcmpl-stream".into(),
            created: 1,
        },
    )
}

#[cfg(test)]
fn chunk_json(translated: Option<Translated>) -> serde_json::Value {
    match translated {
        Some(Translated::Chunk(chunk)) => serde_json::to_value(chunk).unwrap(),
        other => panic!("expected a chunk, got {other:?}"),
    }
}

#[test]
fn done_sentinel() {
    let mut translator = translator();
    assert!(matches!(
        translator.translate("data: [DONE]"),
        Some(Translated::Done)
    ));
    assert!(matches!(
        translator.translate("data:[DONE] "),
        Some(Translated::Done)
    ));
}

#[test]
fn skip_non_data_lines() {
    let mut translator = translator();
    for line in ["", ": keep-alive", "event: message", "id: 7", "data:", "data: "] {
        assert!(translator.translate(line).is_none(), "{line:?}");
    }
}

#[test]
fn malformed_record_is_dropped() {
    let mut translator = translator();
    assert!(translator.translate("data: {not json").is_none());
    assert!(translator.translate("data: 42").is_none());

    let value =
        chunk_json(translator.translate(r#"data: {"choices":[{"delta":{"content":"ok"}}]}"#));
    assert_eq!(value["choices"][0]["delta"]["content"], "ok");
    assert_eq!(value["id"], "chatcmpl-stream");
}

#[test]
fn role_only_on_first_chunk() {
    let mut translator = translator();
    let first = chunk_json(translator.translate(
        r#"data: {"id":"x","choices":[{"index":0,"delta":{"role":"assistant","content":"He"}}]}"#,
    ));
    let second = chunk_json(translator.translate(
        r#"data: {"id":"x","choices":[{"index":0,"delta":{"role":"assistant","content":"llo"}}]}"#,
    ));
    let other = chunk_json(translator.translate(
        r#"data: {"id":"x","choices":[{"index":1,"delta":{"role":"assistant","content":""}}]}"#,
    ));

    assert_eq!(
        first["choices"][0]["delta"],
        serde_json::json!({"role": "assistant", "content": "He"})
    );
    assert_eq!(
        second["choices"][0]["delta"],
        serde_json::json!({"content": "llo"})
    );
    assert_eq!(
        other["choices"][0]["delta"],
        serde_json::json!({"role": "assistant", "content": ""})
    );
}
