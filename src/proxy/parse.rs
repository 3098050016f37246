use http::header::{HOST, HeaderMap, HeaderName};
use http::uri::{Authority, Scheme, Uri};
use http::{Request, Version};

/// Hop headers a forward proxy must consume instead of passing upstream.
const PROXY_HOP_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectTarget {
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl ConnectTarget {
    pub(crate) fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Target of a `CONNECT host[:port]`; the port defaults to 443.
pub(crate) fn parse_connect_target(authority: &str) -> Option<ConnectTarget> {
    let authority: Authority = authority.trim().parse().ok()?;
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some(ConnectTarget {
        host: host.to_string(),
        port: authority.port_u16().unwrap_or(443),
    })
}

/// The host a request is addressed to: the absolute URI's authority, else
/// the Host header.
pub(crate) fn request_host<B>(req: &Request<B>) -> String {
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// Rewrite an origin-form request (`GET /path`) into absolute form using
/// its Host header so it can be forwarded. Returns false when there is no
/// usable host.
pub(crate) fn ensure_absolute_form<B>(req: &mut Request<B>) -> bool {
    if req.uri().authority().is_some() {
        return true;
    }
    let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Ok(authority) = host.parse::<Authority>() else {
        return false;
    };
    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    match Uri::from_parts(parts) {
        Ok(uri) => {
            *req.uri_mut() = uri;
            true
        }
        Err(_) => false,
    }
}

pub(crate) fn strip_proxy_headers(headers: &mut HeaderMap) {
    for name in PROXY_HOP_HEADERS {
        headers.remove(HeaderName::from_static(name));
    }
}

pub(crate) fn http_version_label(ver: Version) -> &'static str {
    match ver {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "",
    }
}

/// `(major, minor)` as carried by the records.
pub(crate) fn version_numbers(ver: Version) -> (u8, u8) {
    match ver {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}
