use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Error, anyhow, bail};
use http::{HeaderMap, StatusCode, header};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::{
    Request, Response,
    body::{Bytes, Frame},
};
use serde_json::{Value, json};

use chat_relay::{
    Outgoing,
    config::Config,
    error::ErrorKind,
    relay::ChatRelay,
    upstream::{Upstream, UpstreamBody},
};

struct Inner {
    status: StatusCode,
    frames: Vec<Result<&'static str, &'static str>>,
    unreachable: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<(HeaderMap, Value)>>,
}

#[derive(Clone)]
struct MockUpstream(Arc<Inner>);

impl MockUpstream {
    fn new(status: StatusCode, frames: Vec<Result<&'static str, &'static str>>) -> Self {
        Self(Arc::new(Inner {
            status,
            frames,
            unreachable: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }))
    }

    fn ok(frames: &[&'static str]) -> Self {
        Self::new(StatusCode::OK, frames.iter().copied().map(Ok).collect())
    }

    fn unreachable() -> Self {
        let mut this = Self::ok(&[]);
        Arc::get_mut(&mut this.0).unwrap().unreachable = true;
        this
    }

    fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    fn request(&self) -> (HeaderMap, Value) {
        self.0.requests.lock().unwrap().last().cloned().unwrap()
    }
}

impl Upstream for MockUpstream {
    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<UpstreamBody>, Error> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        if self.0.unreachable {
            bail!("connection refused");
        }

        let (parts, body) = req.into_parts();
        let data = body.collect().await?.to_bytes();
        let value = serde_json::from_slice(&data)?;
        self.0.requests.lock().unwrap().push((parts.headers, value));

        let frames = self
            .0
            .frames
            .iter()
            .map(|frame| match *frame {
                Ok(data) => Ok(Frame::data(Bytes::from_static(data.as_bytes()))),
                Err(message) => Err(anyhow!(message)),
            })
            .collect::<Vec<_>>();
        Ok(Response::builder()
            .status(self.0.status)
            .body(StreamBody::new(tokio_stream::iter(frames)).boxed())?)
    }
}

fn relay(upstream: &MockUpstream) -> ChatRelay<MockUpstream> {
    ChatRelay::new(upstream.clone(), &Config::default())
}

async fn body_bytes(res: Response<Outgoing>) -> Bytes {
    res.into_body().collect().await.unwrap().to_bytes()
}

fn events(data: &[u8]) -> Vec<String> {
    std::str::from_utf8(data)
        .unwrap()
        .split_terminator("\n\n")
        .map(|event| event.strip_prefix("data: ").unwrap().to_owned())
        .collect()
}

fn chunk(event: &str) -> Value {
    serde_json::from_str(event).unwrap()
}

const HELLO: &str = r#"{"messages":[{"role":"user","content":"hi"}],"model":"gpt-4"}"#;
const HELLO_STREAM: &str =
    r#"{"messages":[{"role":"user","content":"hi"}],"model":"gpt-4","stream":true}"#;

#[tokio::test]
async fn non_stream_response() {
    let upstream = MockUpstream::ok(&[
        r#"{"choices":[{"message":{"content":"hel"#,
        r#"lo"},"finish_reason":"stop"}]}"#,
    ]);
    let res = relay(&upstream)
        .relay("xai-secret", HELLO.as_bytes())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "application/json");

    assert_eq!(upstream.calls(), 1);
    let (headers, sent) = upstream.request();
    assert_eq!(headers["x-api-key"], "xai-secret");
    assert_eq!(
        sent,
        json!({
            "messages": [{"role": "user", "content": "hi"}],
            "model": "grok-3-latest"
        })
    );

    let body: Value = serde_json::from_slice(&body_bytes(res).await).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert!(body["created"].as_u64().unwrap() > 0);
    assert_eq!(body["model"], "grok-3-latest");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn stream_response() {
    let upstream = MockUpstream::ok(&[
        ": keep-alive\n\n",
        r#"data: {"id":"r1","created":7,"model":"grok-3","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
        "\n\ndata: {\"id\":\"r1\",\"created\":7,\"choices\":[{\"index\":0,\"delta\":{\"con",
        "tent\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n",
    ]);
    let res = relay(&upstream)
        .relay("xai-secret", HELLO_STREAM.as_bytes())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(res.headers()[header::CACHE_CONTROL], "no-cache");

    let (_, sent) = upstream.request();
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["model"], "grok-3-latest");

    let events = events(&body_bytes(res).await);
    assert_eq!(events.len(), 3);

    let first = chunk(&events[0]);
    assert_eq!(first["id"], "r1");
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["model"], "grok-3");
    assert_eq!(
        first["choices"][0]["delta"],
        json!({"role": "assistant", "content": "Hel"})
    );

    let second = chunk(&events[1]);
    assert_eq!(second["model"], "grok-3-latest");
    assert_eq!(second["choices"][0]["delta"], json!({"content": "lo"}));
    assert_eq!(second["choices"][0]["finish_reason"], "stop");

    assert_eq!(events[2], "[DONE]");
}

#[tokio::test]
async fn stream_skips_malformed_records() {
    let upstream = MockUpstream::ok(&[
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"a\"}}]}\n\n",
        "data: {not json\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"b\"},\"finish_reason\":\"cancelled\"}]}\n\n",
        "data: [DONE]\n\n",
    ]);
    let res = relay(&upstream)
        .relay("k", HELLO_STREAM.as_bytes())
        .await
        .unwrap();
    let events = events(&body_bytes(res).await);
    assert_eq!(events.len(), 3);

    let first = chunk(&events[0]);
    let second = chunk(&events[1]);
    assert_eq!(first["choices"][0]["delta"]["content"], "a");
    assert_eq!(second["choices"][0]["delta"]["content"], "b");
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
    assert_eq!(first["id"], second["id"]);
    assert_eq!(events[2], "[DONE]");
}

#[tokio::test]
async fn stream_flushes_tail_and_terminates() {
    let upstream = MockUpstream::ok(&[
        "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}",
    ]);
    let res = relay(&upstream)
        .relay("k", HELLO_STREAM.as_bytes())
        .await
        .unwrap();
    let events = events(&body_bytes(res).await);
    assert_eq!(events.len(), 3);
    assert_eq!(chunk(&events[0])["choices"][0]["delta"]["content"], "x");
    assert_eq!(chunk(&events[1])["choices"][0]["delta"]["content"], "y");
    assert_eq!(events[2], "[DONE]");
}

#[tokio::test]
async fn stream_stops_at_done() {
    let upstream = MockUpstream::ok(&[
        "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
    ]);
    let res = relay(&upstream)
        .relay("k", HELLO_STREAM.as_bytes())
        .await
        .unwrap();
    let events = events(&body_bytes(res).await);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], "[DONE]");
}

#[tokio::test]
async fn broken_stream_ends_with_error() {
    let upstream = MockUpstream::new(
        StatusCode::OK,
        vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n"),
            Err("connection reset"),
            Ok("data: [DONE]\n\n"),
        ],
    );
    let res = relay(&upstream)
        .relay("k", HELLO_STREAM.as_bytes())
        .await
        .unwrap();
    let mut body = res.into_body();

    let frame = body.frame().await.unwrap().unwrap();
    let data = frame.into_data().unwrap();
    assert_eq!(chunk(&events(&data)[0])["choices"][0]["delta"]["content"], "x");

    assert!(body.frame().await.unwrap().is_err());
    assert!(body.frame().await.is_none());
}

#[tokio::test]
async fn empty_messages_are_rejected_locally() {
    let upstream = MockUpstream::ok(&[]);
    let err = relay(&upstream)
        .relay("k", br#"{"messages":[]}"#)
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_eq!(err.kind, ErrorKind::InvalidRequestError);
    assert_eq!(upstream.calls(), 0);

    let body: Value = serde_json::from_slice(&err.to_json()).unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["status"], 400);
}

#[tokio::test]
async fn malformed_requests_are_rejected_locally() {
    let upstream = MockUpstream::ok(&[]);
    let relay = relay(&upstream);
    for body in [
        "not json",
        r#"{"messages":[{"role":"robot","content":"hi"}]}"#,
        r#"{"messages":[{"role":"user","content":""}]}"#,
        r#"{"messages":[{"role":"user","content":"hi"}],"stream":"true"}"#,
    ] {
        let err = relay.relay("k", body.as_bytes()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequestError, "{body}");
    }
    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn upstream_error_keeps_status() {
    let upstream = MockUpstream::new(
        StatusCode::TOO_MANY_REQUESTS,
        vec![Ok(
            r#"{"error":{"message":"Too many requests","type":"rate_limit_exceeded"}}"#,
        )],
    );
    let err = relay(&upstream)
        .relay("k", HELLO_STREAM.as_bytes())
        .await
        .unwrap_err();
    assert_eq!(upstream.calls(), 1);
    assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(err.kind, ErrorKind::RateLimitExceeded);
    assert_eq!(err.message, "Too many requests");

    let body: Value = serde_json::from_slice(&err.to_json()).unwrap();
    assert_eq!(body["error"]["code"], "429");
    assert_eq!(body["error"]["param"], Value::Null);
}

#[tokio::test]
async fn unreachable_upstream() {
    let upstream = MockUpstream::unreachable();
    let err = relay(&upstream)
        .relay("k", HELLO.as_bytes())
        .await
        .unwrap_err();
    assert_eq!(upstream.calls(), 1);
    assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    assert_eq!(err.kind, ErrorKind::ServerError);
}

#[tokio::test]
async fn invalid_upstream_body() {
    let upstream = MockUpstream::ok(&["<html>"]);
    let err = relay(&upstream)
        .relay("k", HELLO.as_bytes())
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    assert_eq!(err.kind, ErrorKind::ApiError);
}
