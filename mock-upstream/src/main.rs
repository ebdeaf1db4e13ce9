//! Stand-in for the upstream chat completions API, for running the relay locally.
//!
//! Echoes the last message back. Streamed replies are cut into frames that split records
//! mid-JSON, the way real network reads do.

use std::{convert::Infallible, net::SocketAddr, time::Duration};

use anyhow::Error;
use clap::Parser;
use http::{StatusCode, header};
use http_body_util::{BodyExt, Full, StreamBody, combinators::BoxBody};
use hyper::{
    Request, Response,
    body::{Bytes, Frame, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;

type Body = BoxBody<Bytes, Infallible>;

#[derive(Clone, Debug, Parser)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,
    /// Bytes per streamed frame
    #[arg(long, default_value_t = 24)]
    frame_size: usize,
    /// Delay between streamed frames in milliseconds
    #[arg(long, default_value_t = 50)]
    delay: u64,
}

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    let mut res = Response::new(Full::new(Bytes::from(value.to_string())).boxed());
    *res.status_mut() = status;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    res
}

fn reply_text(req: &Value) -> String {
    let last = req["messages"]
        .as_array()
        .and_then(|messages| messages.last())
        .and_then(|message| message["content"].as_str())
        .unwrap_or_default();
    format!("You said: {last}")
}

fn stream_records(model: &str, text: &str) -> String {
    let mut out = String::new();
    for (i, word) in text.split_inclusive(' ').enumerate() {
        let delta = if i == 0 {
            json!({"role": "assistant", "content": word})
        } else {
            json!({"content": word})
        };
        let record = json!({
            "id": "mock-1",
            "created": 1_700_000_000,
            "model": model,
            "choices": [{"index": 0, "delta": delta}]
        });
        out.push_str(&format!("data: {record}\n\n"));
    }
    let last = json!({
        "id": "mock-1",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
    });
    out.push_str(&format!("data: {last}\n\n"));
    out.push_str("data: [DONE]\n\n");
    out
}

async fn handle(args: Args, req: Request<Incoming>) -> Result<Response<Body>, Error> {
    log::info!("{} {}", req.method(), req.uri());

    if req.headers().get("x-api-key").is_none() {
        return Ok(json_response(
            StatusCode::UNAUTHORIZED,
            json!({"code": "unauthenticated", "error": "Missing x-api-key header"}),
        ));
    }

    let data = req.into_body().collect().await?.to_bytes();
    let body: Value = match serde_json::from_slice(&data) {
        Ok(body) => body,
        Err(e) => {
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": {"message": e.to_string(), "type": "invalid_request_error"}}),
            ));
        }
    };
    log::debug!("Request body: {body}");

    let model = body["model"].as_str().unwrap_or("grok-3-latest").to_owned();
    let text = reply_text(&body);

    if body["stream"].as_bool() == Some(true) {
        let payload = Bytes::from(stream_records(&model, &text));
        let size = args.frame_size.max(1);
        let frames = (0..payload.len())
            .step_by(size)
            .map(|start| payload.slice(start..(start + size).min(payload.len())))
            .collect::<Vec<_>>();
        let stream = tokio_stream::iter(frames)
            .throttle(Duration::from_millis(args.delay))
            .map(|data| Ok::<_, Infallible>(Frame::data(data)));
        let mut res = Response::new(StreamBody::new(stream).boxed());
        res.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/event-stream"),
        );
        Ok(res)
    } else {
        Ok(json_response(
            StatusCode::OK,
            json!({
                "id": "mock-1",
                "created": 1_700_000_000,
                "model": model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": text},
                    "finish_reason": "stop"
                }]
            }),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::builder().init();
    let args = Args::parse();

    // We create a TcpListener and bind it to addr
    let listener = TcpListener::bind(args.addr).await?;
    log::info!("Mock upstream listening at {}", listener.local_addr()?);

    // We start a loop to continuously accept incoming connections
    loop {
        let (stream, addr) = listener.accept().await?;

        // Use an adapter to access something implementing `tokio::io` traits as if they implement
        // `hyper::rt` IO traits.
        let io = TokioIo::new(stream);

        let args = args.clone();

        // Spawn a tokio task to serve multiple connections concurrently
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handle(args.clone(), req)))
                .await
            {
                log::error!("Error serving connection from {addr}: {err:?}");
            }
        });
    }
}
