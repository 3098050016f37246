//! The single consumer of the ingestion queue.
//!
//! The dispatcher runs on its own thread so that a slow sink or a slow log
//! write stalls only the queue, never the async runtime. A permanently
//! stalled dispatcher fills the queue and then blocks every producer,
//! including the proxy's request path.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::events::{EventSink, HTTP_PACKET, IP_PACKET};
use crate::queue::RecordReceiver;
use crate::record::{HttpRecord, PacketRecord};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("log serialization: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    Filtered,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub forwarded: u64,
    pub filtered: u64,
    pub logged: u64,
}

pub fn event_name(record: &PacketRecord) -> &'static str {
    match record {
        PacketRecord::Http(_) => HTTP_PACKET,
        PacketRecord::Ip(_) => IP_PACKET,
    }
}

/// Case-sensitive substring match; an empty filter passes everything.
pub fn host_matches(filter: &str, host: &str) -> bool {
    filter.is_empty() || host.contains(filter)
}

pub fn log_file_name(date: Date) -> String {
    format!(
        "log{:04}-{:02}-{:02}.txt",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Append-only JSON log, one file per UTC day.
#[derive(Debug, Default)]
struct DailyLog {
    current: Option<(PathBuf, File)>,
}

impl DailyLog {
    fn append(&mut self, dir: &Path, date: Date, record: &HttpRecord) -> Result<(), LogError> {
        let path = dir.join(log_file_name(date));
        if !matches!(&self.current, Some((open, _)) if *open == path) {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            debug!("opened log file {}", path.display());
            self.current = Some((path, file));
        }
        let mut line = serde_json::to_vec(record)?;
        line.extend_from_slice(b"\n\n");
        if let Some((_, file)) = &mut self.current {
            file.write_all(&line)?;
        }
        Ok(())
    }
}

pub struct Dispatcher {
    sink: Arc<dyn EventSink>,
    config: SharedConfig,
    log: DailyLog,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn EventSink>, config: SharedConfig) -> Self {
        Self {
            sink,
            config,
            log: DailyLog::default(),
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Filter, forward and optionally log one record.
    pub fn dispatch(&mut self, record: PacketRecord) -> Outcome {
        let (filter, save, log_dir) = {
            let cfg = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (
                cfg.http.filter_host.clone(),
                cfg.http.save_log_file,
                cfg.log_dir.clone(),
            )
        };
        if let PacketRecord::Http(http) = &record {
            if !host_matches(&filter, &http.host) {
                debug!(host = %http.host, "filtered http record");
                self.stats.filtered += 1;
                return Outcome::Filtered;
            }
        }

        let name = event_name(&record);
        let payload = match &record {
            PacketRecord::Http(h) => serde_json::to_value(h),
            PacketRecord::Ip(ip) => serde_json::to_value(ip),
        };
        match payload {
            Ok(value) => self.sink.emit(name, value),
            Err(e) => warn!("cannot serialize {name}: {e}"),
        }
        self.stats.forwarded += 1;

        if let (true, PacketRecord::Http(http)) = (save, &record) {
            let today = OffsetDateTime::now_utc().date();
            match self.log.append(&log_dir, today, http) {
                Ok(()) => self.stats.logged += 1,
                Err(e) => warn!("{e}"),
            }
        }
        Outcome::Forwarded
    }

    /// Drain `rx` until every producer has dropped its sender.
    pub fn run(mut self, mut rx: RecordReceiver) -> DispatchStats {
        while let Some(record) = rx.blocking_pop() {
            self.dispatch(record);
        }
        info!(
            forwarded = self.stats.forwarded,
            filtered = self.stats.filtered,
            logged = self.stats.logged,
            "dispatcher drained"
        );
        self.stats
    }

    pub fn spawn(self, rx: RecordReceiver) -> std::io::Result<JoinHandle<DispatchStats>> {
        thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || self.run(rx))
    }
}
