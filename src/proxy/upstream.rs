use hyper::upgrade::Upgraded;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use super::ProxyBody;
use super::parse::ConnectTarget;

pub(crate) type UpstreamClient = Client<HttpConnector, ProxyBody>;

pub(crate) fn build_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new())
        .http1_preserve_header_case(true)
        .http1_title_case_headers(true)
        .build(HttpConnector::new())
}

/// Relay bytes between the upgraded client connection and `target` until
/// either side closes or the proxy shuts down.
pub(crate) async fn tunnel(
    upgraded: Upgraded,
    target: ConnectTarget,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut server = TcpStream::connect(target.addr()).await?;
    let mut client = TokioIo::new(upgraded);
    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut client, &mut server) => {
            let (up, down) = res?;
            debug!(dest = %target.addr(), up, down, "tunnel closed");
        }
        _ = shutdown.changed() => {
            debug!(dest = %target.addr(), "tunnel cut by shutdown");
        }
    }
    Ok(())
}
