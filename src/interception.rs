//! Proxy hooks that turn every forwarded exchange into a pair of HTTP
//! records on the ingestion queue.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Request, Response, Version};
use http_body_util::BodyExt;
use tracing::debug;

use crate::content::{NO_DATA, binary_placeholder, decode_body, is_textual};
use crate::proxy::{Interceptor, ProxyBody, RequestSummary, empty, full, http_version_label, version_numbers};
use crate::queue::RecordSender;
use crate::record::{Direction, HttpRecord, PacketRecord};

/// Records each request and response it sees. Pushing waits while the queue
/// is full, which holds up the exchange being recorded.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    tx: RecordSender,
}

impl RequestLogger {
    pub fn new(tx: RecordSender) -> Self {
        Self { tx }
    }

    async fn push(&self, rec: HttpRecord) {
        if self.tx.push(PacketRecord::Http(rec)).await.is_err() {
            debug!("queue closed, http record dropped");
        }
    }
}

impl Interceptor for RequestLogger {
    async fn on_request(&self, exchange: u64, req: &mut Request<ProxyBody>) {
        let mut rec = HttpRecord::new(exchange, Direction::Request);
        set_version(&mut rec, req.version());
        rec.method = req.method().to_string();
        rec.host = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        rec.path = req.uri().path().to_string();
        rec.url = req.uri().to_string();
        rec.headers = header_map(req.headers());
        rec.content_length = content_length(req.headers());
        debug!(exchange, url = %rec.url, "request");

        rec.body = if rec.content_length == Some(0) {
            NO_DATA.to_string()
        } else {
            match take_body(req.body_mut()).await {
                Ok(bytes) if bytes.is_empty() => NO_DATA.to_string(),
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => e.to_string(),
            }
        };
        self.push(rec).await;
    }

    async fn on_response(&self, exchange: u64, request: &RequestSummary, res: &mut Response<ProxyBody>) {
        let mut rec = HttpRecord::new(exchange, Direction::Response);
        set_version(&mut rec, res.version());
        rec.method = request.method.clone();
        rec.host = request.host.clone();
        rec.path = request.path.clone();
        rec.url = request.url.clone();
        rec.headers = header_map(res.headers());
        let status = res.status();
        rec.status_code = status.as_u16();
        rec.status = match status.canonical_reason() {
            Some(reason) => format!("{} {reason}", status.as_u16()),
            None => status.as_u16().to_string(),
        };
        let content_type = header_str(res.headers(), CONTENT_TYPE);
        let content_encoding = header_str(res.headers(), CONTENT_ENCODING);
        rec.content_type = content_type.clone().unwrap_or_default();
        rec.content_length = content_length(res.headers());
        debug!(exchange, status = rec.status_code, ct = %rec.content_type, "response");

        rec.body = if rec.content_length == Some(0) {
            NO_DATA.to_string()
        } else if !is_textual(content_type.as_deref()) {
            binary_placeholder(content_type.as_deref())
        } else {
            match take_body(res.body_mut()).await {
                Ok(bytes) => decode_body(&bytes, content_encoding.as_deref()),
                Err(e) => e.to_string(),
            }
        };
        self.push(rec).await;
    }
}

/// Read the whole body and put an identical one back.
async fn take_body(body: &mut ProxyBody) -> Result<Bytes, hyper::Error> {
    let taken = std::mem::replace(body, empty());
    let bytes = taken.collect().await?.to_bytes();
    *body = full(bytes.clone());
    Ok(bytes)
}

fn set_version(rec: &mut HttpRecord, version: Version) {
    rec.proto = format!("HTTP/{}", http_version_label(version));
    (rec.proto_major, rec.proto_minor) = version_numbers(version);
}

fn header_str(headers: &HeaderMap, name: http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_LENGTH)?.trim().parse().ok()
}

/// `content-type` becomes `Content-Type`.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        out.push(if upper { c.to_ascii_uppercase() } else { c });
        upper = c == '-';
    }
    out
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(canonical_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}
