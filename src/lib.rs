pub mod config;
pub mod error;
pub mod openai;
pub mod relay;
pub mod service;
pub mod sse;
pub mod translate;
pub mod upstream;
pub mod xai;

pub use self::service::{Outgoing, Router, Service};

use std::sync::Arc;

use anyhow::Error;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, ToSocketAddrs};

/// Serves `service` over HTTP/1 until accepting a connection fails.
///
/// One instance handles every connection, so state such as the upstream connection pool is
/// shared between them.
pub async fn serve<A, S>(addr: A, service: S) -> Result<(), Error>
where
    A: ToSocketAddrs,
    S: Service + 'static,
{
    // We create a TcpListener and bind it to addr
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, service).await
}

/// Same as [`serve`] on an already bound listener.
pub async fn serve_listener<S>(listener: TcpListener, service: S) -> Result<(), Error>
where
    S: Service + 'static,
{
    let service = Arc::new(service);

    log::info!(
        "Listening for incoming connections at {}",
        listener.local_addr()?
    );

    // We start a loop to continuously accept incoming connections
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("Incoming connection from {addr} established");

        // Use an adapter to access something implementing `tokio::io` traits as if they implement
        // `hyper::rt` IO traits.
        let io = TokioIo::new(stream);

        let service = service.clone();

        // Spawn a tokio task to serve multiple connections concurrently
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn({
                        let service = service.clone();
                        move |req| service.clone().call_arc(req)
                    }),
                )
                .await
            {
                if err.is_incomplete_message() {
                    log::warn!("Incoming connection from {addr} unexpected EOF");
                } else {
                    log::error!("Incoming connection from {addr} failed: {err:?}");
                }
            } else {
                log::debug!("Incoming connection closed: {addr}");
            }
        });
    }
}
