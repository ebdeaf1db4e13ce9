use std::{pin::Pin, time::Duration};

use anyhow::{Context, Error, bail};
use http::{HeaderValue, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{
    Request, Response, Uri,
    body::{Bytes, Incoming},
    client::conn::http1::{self, SendRequest},
    rt::{Read, Write},
};
use hyper_util::rt::TokioIo;
use openssl::ssl::{SslConnector, SslMethod};
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_openssl::SslStream;

pub type UpstreamBody = BoxBody<Bytes, Error>;

/// Sends an already mapped request to the upstream chat completions API.
///
/// The returned body is read lazily, so a streamed response can be relayed as it arrives.
pub trait Upstream: Send + Sync {
    fn send(
        &self,
        req: Request<Full<Bytes>>,
    ) -> impl Future<Output = Result<Response<UpstreamBody>, Error>> + Send + '_;
}

const MAX_IDLE: usize = 16;

struct Connection {
    sender: SendRequest<Full<Bytes>>,
    task: JoinHandle<()>,
}

impl Connection {
    async fn connect(url: &Uri, tls: &SslConnector) -> Result<Self, Error> {
        // Get the host and the port
        let host = url.host().context("Upstream URL has no host")?;
        let https = match url.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            scheme => bail!("Unsupported upstream scheme: {scheme:?}"),
        };
        let port = url.port_u16().unwrap_or(if https { 443 } else { 80 });

        let addr = format!("{}:{}", host, port);

        // Open a TCP connection to the remote host
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        if https {
            let ssl = tls.configure()?.into_ssl(host)?;
            let mut stream = SslStream::new(ssl, stream)?;
            Pin::new(&mut stream).connect().await?;
            log::debug!("TLS session with {addr} established");
            Self::handshake(TokioIo::new(stream), addr).await
        } else {
            Self::handshake(TokioIo::new(stream), addr).await
        }
    }

    async fn handshake<I>(io: I, addr: String) -> Result<Self, Error>
    where
        I: Read + Write + Unpin + Send + 'static,
    {
        // Create the Hyper client
        let (sender, conn) = http1::handshake(io).await?;
        log::debug!("Outgoing connection to {addr} established");

        // Spawn a task to poll the connection, driving the HTTP state
        let task = tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                log::error!("Outgoing connection to {addr} failed: {:?}", err);
            } else {
                log::debug!("Outgoing connection to {addr} closed");
            }
        });

        Ok(Self { sender, task })
    }

    fn is_closed(&self) -> bool {
        self.task.is_finished() || self.sender.is_closed()
    }
}

/// hyper client for one upstream endpoint over plain TCP or TLS.
///
/// Idle keep-alive connections are reused; a connection still streaming a previous response
/// is never handed out, so concurrent requests don't queue behind each other.
pub struct HttpUpstream {
    url: Uri,
    tls: SslConnector,
    idle: Mutex<Vec<Connection>>,
    timeout: Option<Duration>,
}

impl HttpUpstream {
    pub fn new(url: Uri) -> Result<Self, Error> {
        Ok(Self {
            url,
            tls: SslConnector::builder(SslMethod::tls())?.build(),
            idle: Mutex::new(Vec::new()),
            timeout: None,
        })
    }

    /// Limits connecting plus waiting for response headers. The body is not covered.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn checkout(&self) -> Option<Connection> {
        let mut idle = self.idle.lock().await;
        idle.retain(|conn| !conn.is_closed());
        let i = idle.iter().position(|conn| conn.sender.is_ready())?;
        Some(idle.swap_remove(i))
    }

    async fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }

    async fn send_inner(&self, mut req: Request<Full<Bytes>>) -> Result<Response<Incoming>, Error> {
        let host = self.url.authority().context("Upstream URL has no authority")?;
        req.headers_mut()
            .insert(header::HOST, HeaderValue::from_str(host.as_str())?);
        // Origin server expects origin-form, the authority goes to `Host` only
        let path = self.url.path_and_query().map_or("/", |path| path.as_str());
        *req.uri_mut() = path.parse()?;

        let mut conn = match self.checkout().await {
            Some(conn) => conn,
            None => Connection::connect(&self.url, &self.tls).await?,
        };
        let res = conn.sender.send_request(req).await?;
        self.checkin(conn).await;
        Ok(res)
    }
}

impl Upstream for HttpUpstream {
    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<UpstreamBody>, Error> {
        log::trace!("Upstream request: {req:?}");
        let res = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.send_inner(req)).await??,
            None => self.send_inner(req).await?,
        };
        log::trace!("Upstream response: {res:?}");
        Ok(res.map(|body| body.map_err(Error::from).boxed()))
    }
}
