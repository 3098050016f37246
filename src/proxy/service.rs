use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::parse::{ensure_absolute_form, parse_connect_target, request_host, strip_proxy_headers};
use super::upstream::{UpstreamClient, build_client, tunnel};
use super::{Interceptor, ProxyBody, RequestSummary, empty, full};

/// State shared by every connection of one server.
pub(crate) struct Shared<I> {
    pub(crate) hook: I,
    client: UpstreamClient,
    next_exchange: AtomicU64,
    shutdown: watch::Receiver<bool>,
    /// Error the next accept reports instead of its connection.
    #[cfg(test)]
    pub(crate) accept_fault: Arc<std::sync::Mutex<Option<std::io::Error>>>,
}

impl<I: Interceptor> Shared<I> {
    pub(crate) fn new(hook: I, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            hook,
            client: build_client(),
            next_exchange: AtomicU64::new(1),
            shutdown,
            #[cfg(test)]
            accept_fault: Arc::default(),
        }
    }
}

fn status_response(status: StatusCode, text: impl Into<String>) -> Response<ProxyBody> {
    let mut res = Response::new(full(text.into()));
    *res.status_mut() = status;
    res
}

pub(crate) async fn handle<I: Interceptor>(
    shared: Arc<Shared<I>>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    if req.method() == Method::CONNECT {
        return Ok(connect(&shared, req));
    }
    Ok(forward(&shared, req.map(BodyExt::boxed)).await)
}

fn connect<I: Interceptor>(shared: &Shared<I>, req: Request<Incoming>) -> Response<ProxyBody> {
    let authority = req.uri().authority().map(|a| a.as_str().to_string());
    let Some(target) = authority.as_deref().and_then(parse_connect_target) else {
        warn!(uri = %req.uri(), "CONNECT without a usable authority");
        return status_response(StatusCode::BAD_REQUEST, "CONNECT must target host:port");
    };
    let shutdown = shared.shutdown.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = tunnel(upgraded, target.clone(), shutdown).await {
                    debug!(dest = %target.addr(), "tunnel error: {e}");
                }
            }
            Err(e) => warn!("CONNECT upgrade failed: {e}"),
        }
    });
    Response::new(empty())
}

async fn forward<I: Interceptor>(shared: &Shared<I>, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
    if !ensure_absolute_form(&mut req) {
        return status_response(StatusCode::BAD_REQUEST, "request has no target host");
    }
    strip_proxy_headers(req.headers_mut());

    let exchange = shared.next_exchange.fetch_add(1, Ordering::Relaxed);
    shared.hook.on_request(exchange, &mut req).await;

    let summary = RequestSummary {
        method: req.method().to_string(),
        host: request_host(&req),
        path: req.uri().path().to_string(),
        url: req.uri().to_string(),
        version: req.version(),
    };
    debug!(exchange, method = %summary.method, url = %summary.url, "forwarding");

    let mut res = match shared.client.request(req).await {
        Ok(res) => res.map(BodyExt::boxed),
        Err(e) => {
            warn!(exchange, url = %summary.url, "upstream request failed: {e}");
            status_response(StatusCode::BAD_GATEWAY, format!("upstream error: {e}"))
        }
    };
    shared.hook.on_response(exchange, &summary, &mut res).await;
    res
}
