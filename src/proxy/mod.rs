//! Plain HTTP forward proxy with request/response hooks.
//!
//! Requests are forwarded through a pooled upstream client; `CONNECT` is
//! relayed as an opaque tunnel. Every forwarded exchange gets an id that is
//! handed to both hooks so a consumer can pair requests with responses.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

mod parse;
mod service;
mod upstream;


pub(crate) use parse::{http_version_label, version_numbers};

use service::Shared;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// What the response hook gets to know about the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: String,
    pub host: String,
    pub path: String,
    pub url: String,
    pub version: Version,
}

/// Hooks run on every forwarded exchange. They may read and replace the
/// body but must leave an equivalent one in place. A hook that waits holds
/// up that exchange.
pub trait Interceptor: Send + Sync + 'static {
    fn on_request(
        &self,
        exchange: u64,
        req: &mut Request<ProxyBody>,
    ) -> impl Future<Output = ()> + Send;

    fn on_response(
        &self,
        exchange: u64,
        request: &RequestSummary,
        res: &mut Response<ProxyBody>,
    ) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("proxy accept loop failed: {0}")]
    Accept(#[source] io::Error),
}

/// A bound listener that is not yet accepting.
pub struct ProxyServer<I> {
    listener: TcpListener,
    hook: I,
}

impl<I: Interceptor> ProxyServer<I> {
    pub async fn bind(addr: SocketAddr, hook: I) -> Result<Self, ListenError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenError::Bind { addr, source })?;
        Ok(Self { listener, hook })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start accepting. `on_exit` runs once when the accept loop ends on its
    /// own with a fatal error; it does not run after [`RunningProxy::stop`].
    pub fn serve<F>(self, on_exit: F) -> io::Result<RunningProxy>
    where
        F: FnOnce(ListenError) + Send + 'static,
    {
        let addr = self.listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared::new(self.hook, stop_rx.clone()));
        #[cfg(test)]
        let accept_fault = shared.accept_fault.clone();
        let listener = self.listener;
        info!(%addr, "proxy listening");
        let task = tokio::spawn(async move {
            if let Err(e) = accept_loop(listener, shared, stop_rx).await {
                on_exit(ListenError::Accept(e));
            }
        });
        Ok(RunningProxy {
            stop: stop_tx,
            task,
            addr,
            #[cfg(test)]
            accept_fault,
        })
    }
}

pub struct RunningProxy {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    addr: SocketAddr,
    #[cfg(test)]
    accept_fault: Arc<std::sync::Mutex<Option<io::Error>>>,
}

impl RunningProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[cfg(test)]
    pub(crate) fn fail_next_accept(&self, err: io::Error) {
        *self.accept_fault.lock().unwrap() = Some(err);
    }

    /// Close the listener and abort every open connection and tunnel. Returns
    /// once the listener socket is released.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("proxy task ended abnormally: {e}");
        }
        info!(addr = %self.addr, "proxy stopped");
    }
}

/// Per-connection accept failures that leave the listener usable.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(23 | 24))
}

async fn accept_loop<I: Interceptor>(
    listener: TcpListener,
    shared: Arc<Shared<I>>,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            _ = stop.changed() => break Ok(()),
            accepted = accept(&listener, &shared) => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    connections.spawn(serve_connection(stream, peer, shared.clone()));
                }
                Err(e) if is_transient(&e) => {
                    warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(e) => break Err(e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };
    drop(listener);
    connections.shutdown().await;
    result
}

async fn accept<I>(listener: &TcpListener, _shared: &Shared<I>) -> io::Result<(TcpStream, SocketAddr)> {
    let accepted = listener.accept().await;
    #[cfg(test)]
    if let Some(err) = _shared.accept_fault.lock().unwrap().take() {
        return Err(err);
    }
    accepted
}

async fn serve_connection<I: Interceptor>(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared<I>>) {
    let svc = service_fn(move |req| service::handle(shared.clone(), req));
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), svc)
        .with_upgrades();
    if let Err(e) = conn.await {
        debug!(%peer, "connection ended: {e}");
    }
}
