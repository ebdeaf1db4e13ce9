use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use anyhow::Error;
use http::{HeaderMap, Method, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::{
    Request, Response, Uri,
    body::{Body, Bytes, Frame, Incoming},
};
use pin_project::pin_project;

use crate::{
    Outgoing, Service,
    config::Config,
    error::{ApiError, ErrorKind},
    openai::api as openai,
    service::full,
    sse::{Event, LineDecoder},
    translate::{
        Mapper, Synthesized,
        stream::{DONE, StreamTranslator, Translated},
    },
    upstream::Upstream,
    xai::api as xai,
};

/// Serves `POST /v1/chat/completions` by relaying to the upstream API.
pub struct ChatRelay<U> {
    upstream: U,
    upstream_url: Uri,
    mapper: Arc<Mapper>,
    proxy_keys: Vec<String>,
}

impl<U: Upstream> ChatRelay<U> {
    pub fn new(upstream: U, config: &Config) -> Self {
        Self {
            upstream,
            upstream_url: config.upstream_url.clone(),
            mapper: Arc::new(config.mapper()),
            proxy_keys: config.proxy_keys.clone(),
        }
    }

    /// Relays one raw request body on behalf of `credential`.
    ///
    /// Structural errors are returned before the upstream is contacted. A non-success
    /// upstream status is re-expressed in the client error shape with the same status.
    pub async fn relay(
        &self,
        credential: &str,
        body: &[u8],
    ) -> Result<Response<Outgoing>, ApiError> {
        log::trace!("Incoming request data: {}", String::from_utf8_lossy(body));
        let msg: openai::Request = serde_json::from_slice(body)
            .map_err(|e| ApiError::invalid_request(format!("Invalid request body: {e}")))?;
        msg.validate()?;
        let stream = msg.is_stream();

        let msg = self.mapper.map_request(msg);
        log::info!(
            "Calling upstream: {} request, model {}",
            if stream { "stream" } else { "non-stream" },
            msg.model
        );
        let data = Bytes::from(serde_json::to_vec(&msg).map_err(ApiError::internal)?);
        log::trace!("Outgoing request data: {}", String::from_utf8_lossy(&data));

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.upstream_url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-api-key", credential)
            .body(Full::new(data))
            .map_err(ApiError::internal)?;

        let res = self.upstream.send(req).await.map_err(|e| {
            log::error!("Upstream request failed: {e:#}");
            ApiError::transport(&e)
        })?;

        let status = res.status();
        if !status.is_success() {
            let body = res
                .into_body()
                .collect()
                .await
                .map(|body| body.to_bytes())
                .unwrap_or_default();
            let err = ApiError::from_upstream(status, &body);
            log::error!(
                "Upstream error: {} - {}",
                status,
                String::from_utf8_lossy(&body)
            );
            return Err(err);
        }

        if stream {
            let body = SseRelay::new(
                res.into_body(),
                StreamTranslator::new(self.mapper.clone(), Synthesized::now()),
            );
            Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .body(body.boxed())
                .map_err(ApiError::internal)
        } else {
            let data = res
                .into_body()
                .collect()
                .await
                .map_err(|e| ApiError::transport(&e))?
                .to_bytes();
            log::trace!("Upstream response data: {}", String::from_utf8_lossy(&data));
            let msg: xai::Response = serde_json::from_slice(&data).map_err(|e| {
                ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    ErrorKind::ApiError,
                    format!("Invalid upstream response: {e}"),
                )
            })?;
            let msg = self.mapper.map_response(msg, &Synthesized::now());
            let data = serde_json::to_vec(&msg).map_err(ApiError::internal)?;
            Response::builder()
                .header(header::CONTENT_TYPE, "application/json")
                .body(full(data))
                .map_err(ApiError::internal)
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if self.proxy_keys.is_empty() {
            return Ok(());
        }
        let key = headers
            .get("x-proxy-key")
            .and_then(|value| value.to_str().ok());
        match key {
            Some(key) if self.proxy_keys.iter().any(|k| k == key) => Ok(()),
            _ => Err(ApiError::new(
                StatusCode::FORBIDDEN,
                ErrorKind::AccessForbidden,
                "Access denied: invalid proxy key",
            )),
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<Response<Outgoing>, ApiError> {
        if req.method() != Method::POST {
            return Err(ApiError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                ErrorKind::InvalidRequestError,
                format!("Method {} is not allowed", req.method()),
            ));
        }
        self.authorize(req.headers())?;
        let credential = extract_credential(req.headers())
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::UNAUTHORIZED,
                    ErrorKind::AuthenticationError,
                    "No valid API key provided",
                )
            })?
            .to_owned();

        let body = req
            .into_body()
            .collect()
            .await
            .map_err(ApiError::internal)?
            .to_bytes();
        self.relay(&credential, &body).await
    }
}

impl<U: Upstream> Service for ChatRelay<U> {
    async fn call(&self, req: Request<Incoming>) -> Result<Response<Outgoing>, Error> {
        log::trace!("Request: {req:?}");
        match self.handle(req).await {
            Ok(res) => Ok(res),
            Err(err) => {
                if err.status.is_server_error() {
                    log::error!("Request failed: {err}");
                } else {
                    log::warn!("Request rejected: {err}");
                }
                err.into_response()
            }
        }
    }
}

/// `Authorization: Bearer <key>` takes precedence over `x-api-key`.
pub fn extract_credential(headers: &HeaderMap) -> Option<&str> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let key = match header("authorization").and_then(|value| value.strip_prefix("Bearer ")) {
        Some(key) => key,
        None => header("x-api-key")?,
    };
    Some(key.trim()).filter(|key| !key.is_empty())
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RelayState {
    Streaming,
    Finished,
}

/// Response body of a streamed completion.
///
/// Pulls upstream frames only when the client asks for more, so a slow client applies
/// backpressure and a disconnected one drops the upstream body with this value.
#[pin_project]
pub struct SseRelay<B> {
    #[pin]
    upstream: B,
    decoder: LineDecoder,
    translator: StreamTranslator,
    queue: VecDeque<Bytes>,
    state: RelayState,
}

impl<B> SseRelay<B> {
    pub fn new(upstream: B, translator: StreamTranslator) -> Self {
        Self {
            upstream,
            decoder: LineDecoder::default(),
            translator,
            queue: VecDeque::new(),
            state: RelayState::Streaming,
        }
    }
}

/// Queues the event for `line`, returns `true` once the terminal marker is queued.
fn relay_line(translator: &mut StreamTranslator, queue: &mut VecDeque<Bytes>, line: &str) -> bool {
    match translator.translate(line) {
        None => false,
        Some(Translated::Done) => {
            queue.push_back(Bytes::from(Event::data(DONE).to_string()));
            true
        }
        Some(Translated::Chunk(chunk)) => {
            match serde_json::to_string(&chunk) {
                Ok(data) => {
                    log::trace!("Outgoing stream event: {data}");
                    queue.push_back(Bytes::from(Event::data(data).to_string()));
                }
                Err(e) => log::error!("Cannot serialize stream chunk: {e}"),
            }
            false
        }
    }
}

impl<B> Body for SseRelay<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Error>,
{
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        let mut this = self.project();
        loop {
            if let Some(event) = this.queue.pop_front() {
                return Poll::Ready(Some(Ok(Frame::data(event))));
            }
            if *this.state == RelayState::Finished {
                return Poll::Ready(None);
            }

            match ready!(this.upstream.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    for line in this.decoder.push(&data) {
                        if relay_line(this.translator, this.queue, &line) {
                            log::debug!("Upstream stream finished");
                            *this.state = RelayState::Finished;
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    let err: Error = err.into();
                    log::error!("Upstream stream broken: {err:#}");
                    *this.state = RelayState::Finished;
                    this.queue.clear();
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    log::debug!("Upstream stream ended without terminal marker");
                    let done = match this.decoder.finish() {
                        Some(line) => relay_line(this.translator, this.queue, &line),
                        None => false,
                    };
                    if !done {
                        this.queue
                            .push_back(Bytes::from(Event::data(DONE).to_string()));
                    }
                    *this.state = RelayState::Finished;
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.state == RelayState::Finished && self.queue.is_empty()
    }
}

#[test]
fn credential_sources() {
    use http::HeaderValue;

    let mut headers = HeaderMap::new();
    assert_eq!(extract_credential(&headers), None);

    headers.insert("x-api-key", HeaderValue::from_static(" xai-key "));
    assert_eq!(extract_credential(&headers), Some("xai-key"));

    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_static("Bearer sk-1"),
    );
    assert_eq!(extract_credential(&headers), Some("sk-1"));

    headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
    assert_eq!(extract_credential(&headers), Some("xai-key"));
}
