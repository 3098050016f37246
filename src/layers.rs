//! Protocol layer decoding for captured frames.
//!
//! A frame is first split into an ordered list of [`FrameLayer`]s, then the
//! layers are folded into an [`IpRecord`]. Splitting stops at the first layer
//! that fails to decode; everything decoded before that point is kept and the
//! failure is recorded as a diagnostic on the record.
//!
//! IP packets are sliced laxly: a frame cut short by the capture snaplen
//! still yields its IP and transport headers, with a truncation note.

use std::net::{Ipv4Addr, Ipv6Addr};

use etherparse::{Ethernet2Header, Icmpv4Slice, IpNumber, LaxIpPayloadSlice, LaxIpv4Slice, LaxIpv6Slice, TcpSlice, UdpSlice};
use memchr::memchr;
use tracing::debug;

use crate::record::{IpRecord, Transport, format_mac, now_rfc3339};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Link-layer framing reported by the capture engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// BSD null/loopback: 4-byte address family header.
    Null,
    RawIp,
    Other(i32),
}

impl LinkType {
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            1 => LinkType::Ethernet,
            0 | 108 => LinkType::Null,
            12 | 14 | 101 => LinkType::RawIp,
            other => LinkType::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
    Other(u16),
}

/// One decoded protocol layer of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameLayer {
    Ethernet {
        src: [u8; 6],
        dst: [u8; 6],
        ether_type: u16,
        /// Everything after the ethernet (and VLAN) header.
        payload: Vec<u8>,
    },
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        payload: Vec<u8>,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        next_header: u8,
        payload: Vec<u8>,
    },
    Tcp {
        src_port: u16,
        dst_port: u16,
        seq: u32,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Arp {
        operation: ArpOperation,
        sender_hw: [u8; 6],
        sender_ip: Ipv4Addr,
        target_hw: [u8; 6],
        target_ip: Ipv4Addr,
    },
    Icmpv4 {
        icmp_type: u8,
        code: u8,
    },
    /// Bytes carried above the transport layer.
    Payload(Vec<u8>),
    /// A layer that is recognized as present but not decoded further.
    Other { name: String, len: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayeredFrame {
    pub layers: Vec<FrameLayer>,
    pub errors: Vec<String>,
}

/// Split `data` into layers according to `link`.
pub fn split_layers(link: LinkType, data: &[u8]) -> LayeredFrame {
    let mut out = LayeredFrame::default();
    match link {
        LinkType::Ethernet => split_ethernet(data, &mut out),
        LinkType::Null => {
            if data.len() < 4 {
                out.errors.push(format!("loopback: header needs 4 bytes, got {}", data.len()));
            } else {
                split_ip_by_version(&data[4..], &mut out);
            }
        }
        LinkType::RawIp => split_ip_by_version(data, &mut out),
        LinkType::Other(dlt) => out.layers.push(FrameLayer::Other {
            name: format!("linktype {dlt}"),
            len: data.len(),
        }),
    }
    out
}

fn split_ethernet(data: &[u8], out: &mut LayeredFrame) {
    let (eth, rest) = match Ethernet2Header::from_slice(data) {
        Ok(v) => v,
        Err(e) => {
            out.errors.push(format!("ethernet: {e}"));
            return;
        }
    };
    let mut ether_type = eth.ether_type.0;
    let mut rest = rest;
    // single 802.1Q tag: TCI (2 bytes) followed by the inner ethertype
    if ether_type == ETHERTYPE_VLAN && rest.len() >= 4 {
        ether_type = u16::from_be_bytes([rest[2], rest[3]]);
        rest = &rest[4..];
    }
    out.layers.push(FrameLayer::Ethernet {
        src: eth.source,
        dst: eth.destination,
        ether_type,
        payload: rest.to_vec(),
    });
    match ether_type {
        ETHERTYPE_IPV4 => split_ipv4(rest, out),
        ETHERTYPE_IPV6 => split_ipv6(rest, out),
        ETHERTYPE_ARP => split_arp(rest, out),
        other => out.layers.push(FrameLayer::Other {
            name: format!("ethertype 0x{other:04x}"),
            len: rest.len(),
        }),
    }
}

fn split_ip_by_version(data: &[u8], out: &mut LayeredFrame) {
    match data.first().map(|b| b >> 4) {
        Some(4) => split_ipv4(data, out),
        Some(6) => split_ipv6(data, out),
        Some(v) => out.errors.push(format!("ip: unknown version {v}")),
        None => out.errors.push("ip: empty packet".into()),
    }
}

fn split_ipv4(data: &[u8], out: &mut LayeredFrame) {
    let ip = match LaxIpv4Slice::from_slice(data) {
        Ok((ip, ext_err)) => {
            if let Some(e) = ext_err {
                out.errors.push(format!("ipv4 extension: {e}"));
            }
            ip
        }
        Err(e) => {
            out.errors.push(format!("ipv4: {e}"));
            return;
        }
    };
    let header = ip.header();
    let payload = ip.payload();
    out.layers.push(FrameLayer::Ipv4 {
        src: header.source_addr(),
        dst: header.destination_addr(),
        protocol: header.protocol().0,
        payload: payload.payload.to_vec(),
    });
    split_ip_payload("ipv4", payload, out);
}

fn split_ipv6(data: &[u8], out: &mut LayeredFrame) {
    let ip = match LaxIpv6Slice::from_slice(data) {
        Ok((ip, ext_err)) => {
            if let Some((e, _)) = ext_err {
                out.errors.push(format!("ipv6 extension: {e}"));
            }
            ip
        }
        Err(e) => {
            out.errors.push(format!("ipv6: {e}"));
            return;
        }
    };
    let header = ip.header();
    let payload = ip.payload();
    out.layers.push(FrameLayer::Ipv6 {
        src: header.source_addr(),
        dst: header.destination_addr(),
        next_header: header.next_header().0,
        payload: payload.payload.to_vec(),
    });
    split_ip_payload("ipv6", payload, out);
}

fn split_ip_payload(name: &str, payload: &LaxIpPayloadSlice<'_>, out: &mut LayeredFrame) {
    if payload.fragmented {
        out.errors.push(format!("{name}: fragmented datagram, transport not decoded"));
        return;
    }
    if payload.incomplete {
        out.errors.push(format!(
            "{name}: truncated, {} payload byte(s) captured ({:?})",
            payload.payload.len(),
            payload.len_source
        ));
    }
    split_transport(payload.ip_number, payload.payload, out);
}

fn split_transport(ip_number: IpNumber, data: &[u8], out: &mut LayeredFrame) {
    match ip_number.0 {
        6 => match TcpSlice::from_slice(data) {
            Ok(tcp) => {
                out.layers.push(FrameLayer::Tcp {
                    src_port: tcp.source_port(),
                    dst_port: tcp.destination_port(),
                    seq: tcp.sequence_number(),
                });
                push_payload(tcp.payload(), out);
            }
            Err(e) => out.errors.push(format!("tcp: {e}")),
        },
        17 => match UdpSlice::from_slice_lax(data) {
            Ok(udp) => {
                out.layers.push(FrameLayer::Udp {
                    src_port: udp.source_port(),
                    dst_port: udp.destination_port(),
                });
                push_payload(udp.payload(), out);
            }
            Err(e) => out.errors.push(format!("udp: {e}")),
        },
        1 => match Icmpv4Slice::from_slice(data) {
            Ok(icmp) => {
                let bytes = icmp.slice();
                out.layers.push(FrameLayer::Icmpv4 {
                    icmp_type: bytes.first().copied().unwrap_or(0),
                    code: bytes.get(1).copied().unwrap_or(0),
                });
            }
            Err(e) => out.errors.push(format!("icmpv4: {e}")),
        },
        other => out.layers.push(FrameLayer::Other {
            name: format!("ip protocol {other}"),
            len: data.len(),
        }),
    }
}

fn push_payload(payload: &[u8], out: &mut LayeredFrame) {
    if !payload.is_empty() {
        out.layers.push(FrameLayer::Payload(payload.to_vec()));
    }
}

// Ethernet/IPv4 ARP only: htype 1, ptype 0x0800, hlen 6, plen 4.
fn split_arp(data: &[u8], out: &mut LayeredFrame) {
    if data.len() < 28 {
        out.errors.push(format!("arp: packet needs 28 bytes, got {}", data.len()));
        return;
    }
    if data[4] != 6 || data[5] != 4 {
        out.layers.push(FrameLayer::Other {
            name: "arp (non ethernet/ipv4)".into(),
            len: data.len(),
        });
        return;
    }
    let operation = match u16::from_be_bytes([data[6], data[7]]) {
        1 => ArpOperation::Request,
        2 => ArpOperation::Reply,
        op => ArpOperation::Other(op),
    };
    let hw = |at: usize| -> [u8; 6] {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[at..at + 6]);
        mac
    };
    let ip = |at: usize| Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3]);
    out.layers.push(FrameLayer::Arp {
        operation,
        sender_hw: hw(8),
        sender_ip: ip(14),
        target_hw: hw(18),
        target_ip: ip(24),
    });
}

/// Fold decoded layers into a record. ARP and ICMPv4 are reported only as
/// diagnostics and never populate network or transport fields.
pub fn decode_layers(frame: &LayeredFrame, length: usize) -> IpRecord {
    let mut rec = IpRecord {
        timestamp: now_rfc3339(),
        length,
        ..Default::default()
    };
    for layer in &frame.layers {
        match layer {
            FrameLayer::Ethernet {
                src,
                dst,
                ether_type,
                payload,
            } => {
                rec.src_mac = format_mac(src);
                rec.dst_mac = format_mac(dst);
                rec.ethernet_type = *ether_type;
                rec.ethernet_payload = payload.clone();
            }
            FrameLayer::Ipv4 {
                src,
                dst,
                protocol,
                payload,
            } => {
                rec.ip_version = 4;
                rec.src_ip = src.to_string();
                rec.dst_ip = dst.to_string();
                rec.protocol = *protocol;
                rec.ip_payload = payload.clone();
            }
            FrameLayer::Ipv6 {
                src,
                dst,
                next_header,
                payload,
            } => {
                rec.ip_version = 6;
                rec.src_ip = src.to_string();
                rec.dst_ip = dst.to_string();
                rec.protocol = *next_header;
                rec.ip_payload = payload.clone();
            }
            FrameLayer::Tcp { src_port, dst_port, seq } => {
                rec.transport = Some(Transport::Tcp);
                rec.src_port = *src_port;
                rec.dst_port = *dst_port;
                rec.seq = *seq;
            }
            FrameLayer::Udp { src_port, dst_port } => {
                rec.transport = Some(Transport::Udp);
                rec.src_port = *src_port;
                rec.dst_port = *dst_port;
            }
            FrameLayer::Arp {
                operation,
                sender_hw,
                sender_ip,
                target_hw,
                target_ip,
            } => {
                let note = match operation {
                    ArpOperation::Request => format!(
                        "arp request {} --> {} | {} --> {}",
                        format_mac(sender_hw),
                        format_mac(target_hw),
                        sender_ip,
                        target_ip
                    ),
                    ArpOperation::Reply => format!(
                        "arp reply {} <-- {} | {} <-- {}",
                        format_mac(target_hw),
                        format_mac(sender_hw),
                        target_ip,
                        sender_ip
                    ),
                    ArpOperation::Other(op) => format!("arp operation {op}"),
                };
                debug!("{note}");
                rec.diagnostics.push(note);
            }
            FrameLayer::Icmpv4 { icmp_type, code } => {
                let note = format!("icmpv4 type {icmp_type} code {code}");
                debug!("{note}");
                rec.diagnostics.push(note);
            }
            FrameLayer::Payload(bytes) => {
                rec.application_layer = classify_payload(rec.transport, rec.src_port, rec.dst_port, bytes).into();
                rec.application_payload = bytes.clone();
                match rec.transport {
                    Some(Transport::Tcp) => rec.tcp_payload = bytes.clone(),
                    Some(Transport::Udp) => rec.udp_payload = bytes.clone(),
                    None => {}
                }
            }
            FrameLayer::Other { name, len } => {
                debug!("undecoded layer {name} ({len} bytes)");
            }
        }
    }
    for err in &frame.errors {
        debug!("error decoding some part of the frame: {err}");
        rec.diagnostics.push(err.clone());
    }
    rec
}

/// Split and decode in one step.
pub fn decode_frame(link: LinkType, data: &[u8]) -> IpRecord {
    decode_layers(&split_layers(link, data), data.len())
}

fn classify_payload(transport: Option<Transport>, src_port: u16, dst_port: u16, payload: &[u8]) -> &'static str {
    if looks_like_http(payload) {
        return "HTTP";
    }
    if payload.len() >= 3 && (0x14..=0x17).contains(&payload[0]) && payload[1] == 0x03 {
        return "TLS";
    }
    if transport == Some(Transport::Udp) && (src_port == 53 || dst_port == 53) {
        return "DNS";
    }
    "Payload"
}

fn looks_like_http(payload: &[u8]) -> bool {
    let max = payload.len().min(64);
    let line_end = memchr(b'\n', &payload[..max]).unwrap_or(max);
    let Ok(head) = std::str::from_utf8(&payload[..line_end]) else {
        return false;
    };
    let head = head.trim_start();
    if head.starts_with("HTTP/") {
        return true;
    }
    const METHODS: [&str; 9] = [
        "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
    ];
    METHODS.iter().any(|m| head.starts_with(m))
}
