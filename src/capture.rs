//! Link-layer capture: the engine boundary, the pcap engine and the
//! producer loop that feeds decoded frames into the ingestion queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pcap::{Active, Address, Capture, Device};
use pcap::Error as PcapError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CaptureConfig;
use crate::layers::{LinkType, decode_frame};
use crate::queue::RecordSender;
use crate::record::PacketRecord;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pcap error: {0}")]
    Pcap(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("cannot open {device}: {message}")]
    Open { device: String, message: String },
    #[error("invalid capture filter {filter:?}: {message}")]
    Filter { filter: String, message: String },
    #[error("capture read failed: {0}")]
    Read(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub desc: Option<String>,
    pub addresses: Vec<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAddress {
    pub addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
}

/// One captured link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub link: LinkType,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(link: LinkType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            link,
            data: data.into(),
        }
    }
}

/// Asks a blocked [`FrameSource`] to report end of stream. Closing is
/// observed at the latest when the current read times out.
#[derive(Debug, Clone, Default)]
pub struct CloseSignal(Arc<AtomicBool>);

impl CloseSignal {
    pub fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait FrameSource: Send {
    /// Blocks for the next frame. `Ok(None)` is terminal.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    fn close_signal(&self) -> CloseSignal;
}

pub trait CaptureEngine: Send + Sync + 'static {
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// Live capture through libpcap.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcapEngine;

impl CaptureEngine for PcapEngine {
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
        let device = find_device(&config.device)?;
        let name = device.name.clone();
        let open_err = |e: PcapError| CaptureError::Open {
            device: name.clone(),
            message: e.to_string(),
        };

        let mut cap = Capture::from_device(device)
            .map_err(open_err)?
            .promisc(config.promisc)
            .snaplen(config.snaplen)
            .timeout(config.timeout_ms.max(1))
            .immediate_mode(true)
            .open()
            .map_err(open_err)?;

        if !config.filter.is_empty() {
            cap.filter(&config.filter, true)
                .map_err(|e| CaptureError::Filter {
                    filter: config.filter.clone(),
                    message: e.to_string(),
                })?;
        }

        let link = LinkType::from_dlt(cap.get_datalink().0);
        info!(device = %name, ?link, filter = %config.filter, "capture opened");
        Ok(Box::new(PcapSource {
            cap,
            link,
            closed: CloseSignal::default(),
        }))
    }
}

fn find_device(name: &str) -> Result<Device, CaptureError> {
    if name.is_empty() {
        return Device::lookup()
            .map_err(|e| CaptureError::Pcap(e.to_string()))?
            .ok_or_else(|| CaptureError::DeviceNotFound("<default>".into()));
    }
    Device::list()
        .map_err(|e| CaptureError::Pcap(e.to_string()))?
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()))
}

struct PcapSource {
    cap: Capture<Active>,
    link: LinkType,
    closed: CloseSignal,
}

impl FrameSource for PcapSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        loop {
            if self.closed.is_closed() {
                return Ok(None);
            }
            match self.cap.next_packet() {
                Ok(packet) => return Ok(Some(Frame::new(self.link, packet.data))),
                Err(PcapError::TimeoutExpired) => continue,
                Err(PcapError::NoMorePackets) => return Ok(None),
                Err(e) => return Err(CaptureError::Read(e.to_string())),
            }
        }
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }
}

/// Devices known to libpcap together with their addresses.
pub fn list_devices() -> Result<Vec<DeviceInfo>, CaptureError> {
    let devices = Device::list().map_err(|e| CaptureError::Pcap(e.to_string()))?;
    Ok(devices
        .into_iter()
        .map(|d| DeviceInfo {
            addresses: device_addresses(&d.addresses),
            name: d.name,
            desc: d.desc,
        })
        .collect())
}

// IPv4 first, the way interface pickers usually show them
fn device_addresses(addresses: &[Address]) -> Vec<DeviceAddress> {
    let mut sorted: Vec<&Address> = addresses.iter().collect();
    sorted.sort_by_key(|a| a.addr.is_ipv6());
    sorted
        .into_iter()
        .map(|a| DeviceAddress {
            addr: a.addr.to_string(),
            netmask: a.netmask.map(|m| m.to_string()),
        })
        .collect()
}

/// Decode frames from `source` into the queue until the source reports end
/// of stream, the queue closes or the source fails. Returns the number of
/// records pushed.
pub fn run_capture_loop(
    mut source: Box<dyn FrameSource>,
    tx: RecordSender,
) -> Result<u64, CaptureError> {
    let mut pushed = 0u64;
    while let Some(frame) = source.next_frame()? {
        let record = decode_frame(frame.link, &frame.data);
        debug!(len = record.length, app = %record.application_layer, "frame");
        if tx.blocking_push(PacketRecord::Ip(record)).is_err() {
            debug!("queue closed, capture loop exiting");
            break;
        }
        pushed += 1;
    }
    Ok(pushed)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::time::Duration;

    use etherparse::PacketBuilder;

    use super::*;

    pub(crate) type Feed = Sender<Result<Frame, CaptureError>>;

    /// A frame source driven by a channel. Dropping the feed ends the stream.
    pub(crate) struct ScriptedSource {
        rx: Receiver<Result<Frame, CaptureError>>,
        closed: CloseSignal,
        live: Option<Live>,
    }

    /// Counts a source as live from `open` until it is dropped.
    struct Live(Arc<AtomicUsize>);

    impl Drop for Live {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            loop {
                if self.closed.is_closed() {
                    return Ok(None);
                }
                match self.rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(Ok(frame)) => return Ok(Some(frame)),
                    Ok(Err(e)) => return Err(e),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Ok(None),
                }
            }
        }

        fn close_signal(&self) -> CloseSignal {
            self.closed.clone()
        }
    }

    /// Hands out prepared sources in order; `open` fails once they run out.
    #[derive(Default)]
    pub(crate) struct ScriptedEngine {
        sources: Mutex<VecDeque<ScriptedSource>>,
        pub(crate) opened: Mutex<Vec<CaptureConfig>>,
        live: Arc<AtomicUsize>,
        peak_live: AtomicUsize,
    }

    impl ScriptedEngine {
        pub(crate) fn feed(&self) -> Feed {
            let (tx, rx) = mpsc::channel();
            self.sources.lock().unwrap().push_back(ScriptedSource {
                rx,
                closed: CloseSignal::default(),
                live: None,
            });
            tx
        }

        /// Sources opened and not yet dropped.
        pub(crate) fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }

        pub(crate) fn peak_live(&self) -> usize {
            self.peak_live.load(Ordering::SeqCst)
        }
    }

    impl CaptureEngine for ScriptedEngine {
        fn open(&self, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
            self.opened.lock().unwrap().push(config.clone());
            match self.sources.lock().unwrap().pop_front() {
                Some(mut src) => {
                    let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak_live.fetch_max(now, Ordering::SeqCst);
                    src.live = Some(Live(self.live.clone()));
                    Ok(Box::new(src))
                }
                None => Err(CaptureError::DeviceNotFound(config.device.clone())),
            }
        }
    }

    pub(crate) fn http_frame(payload: &[u8]) -> Frame {
        let builder = PacketBuilder::ethernet2([0x02, 0, 0, 0, 0, 1], [0x02, 0, 0, 0, 0, 2])
            .ipv4([127, 0, 0, 1], [127, 0, 0, 1], 64)
            .tcp(51000, 80, 7, 65535);
        let mut buf = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut buf, payload).unwrap();
        Frame::new(LinkType::Ethernet, buf)
    }
}
