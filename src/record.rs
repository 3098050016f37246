use std::collections::BTreeMap;

use serde::Serialize;
use time::OffsetDateTime;

/// One unit travelling through the ingestion queue.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", content = "packet")]
pub enum PacketRecord {
    Http(HttpRecord),
    Ip(IpRecord),
}

impl PacketRecord {
    pub fn as_http(&self) -> Option<&HttpRecord> {
        match self {
            PacketRecord::Http(h) => Some(h),
            PacketRecord::Ip(_) => None,
        }
    }

    pub fn as_ip(&self) -> Option<&IpRecord> {
        match self {
            PacketRecord::Ip(ip) => Some(ip),
            PacketRecord::Http(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HttpRecord {
    /// Shared by a request and the response it produced.
    pub exchange_id: u64,
    pub direction: Direction,
    pub timestamp: String,
    pub proto: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    pub method: String,
    pub host: String,
    pub path: String,
    pub url: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub status_code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

impl HttpRecord {
    pub fn new(exchange_id: u64, direction: Direction) -> Self {
        Self {
            exchange_id,
            direction,
            timestamp: now_rfc3339(),
            proto: String::new(),
            proto_major: 0,
            proto_minor: 0,
            method: String::new(),
            host: String::new(),
            path: String::new(),
            url: String::new(),
            headers: BTreeMap::new(),
            body: String::new(),
            status: String::new(),
            status_code: 0,
            content_type: String::new(),
            content_length: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

/// Best-effort union of the layers found in one captured frame. Fields of
/// layers that were not present keep their zero value.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct IpRecord {
    pub timestamp: String,
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    #[serde(skip_serializing_if = "is_zero_u8")]
    pub ip_version: u8,
    // ethernet
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub ethernet_type: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src_mac: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dst_mac: String,
    #[serde(
        serialize_with = "base64_bytes::serialize",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ethernet_payload: Vec<u8>,
    // ipv4 / ipv6
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dst_ip: String,
    #[serde(skip_serializing_if = "is_zero_u8")]
    pub protocol: u8,
    #[serde(
        serialize_with = "base64_bytes::serialize",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ip_payload: Vec<u8>,
    // tcp / udp
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub seq: u32,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub src_port: u16,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub dst_port: u16,
    #[serde(
        serialize_with = "base64_bytes::serialize",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tcp_payload: Vec<u8>,
    #[serde(
        serialize_with = "base64_bytes::serialize",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub udp_payload: Vec<u8>,
    // application
    #[serde(skip_serializing_if = "String::is_empty")]
    pub application_layer: String,
    #[serde(
        serialize_with = "base64_bytes::serialize",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub application_payload: Vec<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

fn is_zero_u8(v: &u8) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose;
    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "".into())
}

pub(crate) fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
