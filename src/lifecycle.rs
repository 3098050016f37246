//! Start/stop state for the two producers and ownership of the pipeline.
//!
//! The controller owns the capture session, the running proxy and the
//! dispatcher thread. Each subsystem has its own lock, so capture and proxy
//! transitions never wait on each other. Producers that end on their own
//! report back with the session number they were started under; a report
//! from an outdated session is ignored.
//!
//! Capture start and stop are serialized by a transition lock that stop holds
//! until the old producer thread has been joined, so two capture sources are
//! never live at once. Dropping the controller without [`Controller::shutdown`]
//! still closes the capture source; the threads then wind down detached.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::capture::{CaptureEngine, CaptureError, CloseSignal, run_capture_loop};
use crate::config::{Config, SharedConfig};
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::events::{CODE_CAPTURE, CODE_PROXY, EventSink, emit_error, emit_response};
use crate::interception::RequestLogger;
use crate::proxy::{ListenError, ProxyServer, RunningProxy};
use crate::queue::{self, RecordSender};

/// Name the local certificate authority is installed under.
pub const AUTHORITY_NAME: &str = "Local Proxy Authority";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Stopped,
    /// Only while the listener or capture handle is being acquired.
    Starting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Proxy,
    Capture,
}

impl Subsystem {
    /// Code carried by this subsystem's error events.
    pub fn code(self) -> i32 {
        match self {
            Subsystem::Proxy => CODE_PROXY,
            Subsystem::Capture => CODE_CAPTURE,
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subsystem::Proxy => "proxy",
            Subsystem::Capture => "capture",
        })
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} is already running")]
    AlreadyRunning(Subsystem),
    #[error("{0} is already stopped")]
    AlreadyStopped(Subsystem),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Listen(#[from] ListenError),
    #[error("system integration failed: {0}")]
    System(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// OS hooks around the proxy: system proxy settings and the trust store.
pub trait SystemIntegration: Send + Sync + 'static {
    fn enable_proxy(&self, port: u16) -> Result<(), String>;
    fn disable_proxy(&self) -> Result<(), String>;
    fn install_cert(&self, authority: &str) -> Result<(), String>;
    fn uninstall_cert(&self, authority: &str) -> Result<(), String>;
}

/// Leaves the OS untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSystem;

impl SystemIntegration for NoopSystem {
    fn enable_proxy(&self, port: u16) -> Result<(), String> {
        info!(port, "system proxy integration disabled; not changing OS settings");
        Ok(())
    }

    fn disable_proxy(&self) -> Result<(), String> {
        Ok(())
    }

    fn install_cert(&self, authority: &str) -> Result<(), String> {
        Err(format!("cannot install {authority:?}: no trust store integration"))
    }

    fn uninstall_cert(&self, authority: &str) -> Result<(), String> {
        Err(format!("cannot uninstall {authority:?}: no trust store integration"))
    }
}

#[derive(Default)]
struct CaptureSlot {
    session: u64,
    close: Option<CloseSignal>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ProxySlot {
    session: u64,
    running: Option<RunningProxy>,
    system_enabled: bool,
}

struct Inner {
    config: SharedConfig,
    engine: Arc<dyn CaptureEngine>,
    sink: Arc<dyn EventSink>,
    system: Arc<dyn SystemIntegration>,
    capture_ops: Mutex<()>,
    capture: Mutex<CaptureSlot>,
    proxy: tokio::sync::Mutex<ProxySlot>,
    capture_status: watch::Sender<Status>,
    proxy_status: watch::Sender<Status>,
}

impl Inner {
    fn status_tx(&self, which: Subsystem) -> &watch::Sender<Status> {
        match which {
            Subsystem::Proxy => &self.proxy_status,
            Subsystem::Capture => &self.capture_status,
        }
    }

    fn set_status(&self, which: Subsystem, status: Status) {
        self.status_tx(which).send_replace(status);
    }

    fn capture_slot(&self) -> MutexGuard<'_, CaptureSlot> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Taken before the slot lock and never by the capture thread itself.
    fn capture_transition(&self) -> MutexGuard<'_, ()> {
        self.capture_ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leave `which` stopped and tell the user why it did not start.
    fn start_failed(&self, which: Subsystem, err: LifecycleError) -> LifecycleError {
        self.set_status(which, Status::Stopped);
        emit_error(&*self.sink, which.code(), format!("{which} failed to start: {err}"));
        err
    }

    fn stop_capture(&self) -> Result<(), LifecycleError> {
        let _transition = self.capture_transition();
        let (close, thread) = {
            let mut slot = self.capture_slot();
            let Some(close) = slot.close.take() else {
                return Err(LifecycleError::AlreadyStopped(Subsystem::Capture));
            };
            slot.session += 1;
            self.set_status(Subsystem::Capture, Status::Stopped);
            (close, slot.thread.take())
        };
        // joined outside the lock: the exiting thread reports in under it
        close.close();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("capture thread panicked");
            }
        }
        info!("capture stopped");
        Ok(())
    }

    fn capture_ended(&self, session: u64, result: Result<u64, CaptureError>) {
        let mut slot = self.capture_slot();
        if slot.session != session || slot.close.is_none() {
            return;
        }
        slot.close = None;
        self.set_status(Subsystem::Capture, Status::Stopped);
        match result {
            Ok(frames) => info!(frames, "capture ended"),
            Err(e) => emit_error(&*self.sink, CODE_CAPTURE, format!("capture stopped: {e}")),
        }
    }

    async fn proxy_ended(&self, session: u64, err: ListenError) {
        let mut slot = self.proxy.lock().await;
        if slot.session != session {
            return;
        }
        let Some(running) = slot.running.take() else {
            return;
        };
        drop(running);
        self.disable_system_proxy(&mut slot);
        self.set_status(Subsystem::Proxy, Status::Stopped);
        emit_error(&*self.sink, CODE_PROXY, format!("proxy stopped: {err}"));
    }

    fn disable_system_proxy(&self, slot: &mut ProxySlot) {
        if !std::mem::take(&mut slot.system_enabled) {
            return;
        }
        if let Err(e) = self.system.disable_proxy() {
            warn!("cannot reset system proxy: {e}");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.capture.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(close) = slot.close.take() {
            close.close();
        }
    }
}

/// Owns both producers and the dispatcher.
pub struct Controller {
    inner: Arc<Inner>,
    tx: RecordSender,
    dispatcher: JoinHandle<DispatchStats>,
}

impl Controller {
    pub fn new(
        config: Config,
        engine: Arc<dyn CaptureEngine>,
        sink: Arc<dyn EventSink>,
        system: Arc<dyn SystemIntegration>,
    ) -> Result<Self, LifecycleError> {
        let (tx, rx) = queue::bounded(config.queue_capacity);
        let config = Arc::new(RwLock::new(config));
        let dispatcher = Dispatcher::new(sink.clone(), config.clone()).spawn(rx)?;
        let inner = Arc::new(Inner {
            config,
            engine,
            sink,
            system,
            capture_ops: Mutex::new(()),
            capture: Mutex::new(CaptureSlot::default()),
            proxy: tokio::sync::Mutex::new(ProxySlot::default()),
            capture_status: watch::Sender::new(Status::Stopped),
            proxy_status: watch::Sender::new(Status::Stopped),
        });
        Ok(Self {
            inner,
            tx,
            dispatcher,
        })
    }

    pub fn status(&self, which: Subsystem) -> Status {
        *self.inner.status_tx(which).borrow()
    }

    pub fn subscribe(&self, which: Subsystem) -> watch::Receiver<Status> {
        self.inner.status_tx(which).subscribe()
    }

    pub fn config(&self) -> Config {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open the capture device (`device` overrides the configured one) and
    /// start feeding frames into the queue.
    pub fn start_capture(&self, device: Option<&str>) -> Result<(), LifecycleError> {
        let _transition = self.inner.capture_transition();
        let mut slot = self.inner.capture_slot();
        if slot.close.is_some() {
            return Err(LifecycleError::AlreadyRunning(Subsystem::Capture));
        }
        // a session that ended on its own leaves a finished thread behind
        if let Some(old) = slot.thread.take() {
            let _ = old.join();
        }
        self.inner.set_status(Subsystem::Capture, Status::Starting);

        let cfg = {
            let mut cfg = self.inner.config.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(device) = device {
                cfg.ip.device = device.to_string();
            }
            cfg.ip.clone()
        };
        let source = match self.inner.engine.open(&cfg) {
            Ok(source) => source,
            Err(e) => return Err(self.inner.start_failed(Subsystem::Capture, e.into())),
        };
        let close = source.close_signal();

        slot.session += 1;
        let session = slot.session;
        let inner = Arc::downgrade(&self.inner);
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let result = run_capture_loop(source, tx);
                if let Some(inner) = inner.upgrade() {
                    inner.capture_ended(session, result);
                }
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => return Err(self.inner.start_failed(Subsystem::Capture, e.into())),
        };

        slot.close = Some(close);
        slot.thread = Some(thread);
        self.inner.set_status(Subsystem::Capture, Status::Running);
        info!(device = %cfg.device, filter = %cfg.filter, "capture started");
        emit_response(&*self.inner.sink, CODE_CAPTURE, format!("capture started on {}", cfg.device));
        Ok(())
    }

    /// Close the capture handle and wait for the producer thread to exit.
    pub fn stop_capture(&self) -> Result<(), LifecycleError> {
        self.inner.stop_capture()
    }

    /// Bind the proxy listener and start serving. Returns the bound address.
    pub async fn start_proxy(&self) -> Result<SocketAddr, LifecycleError> {
        let mut slot = self.inner.proxy.lock().await;
        if slot.running.is_some() {
            return Err(LifecycleError::AlreadyRunning(Subsystem::Proxy));
        }
        self.inner.set_status(Subsystem::Proxy, Status::Starting);

        let (port, auto_proxy) = {
            let cfg = self.inner.config.read().unwrap_or_else(PoisonError::into_inner);
            (cfg.http.port, cfg.http.auto_proxy)
        };
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let server = match ProxyServer::bind(addr, RequestLogger::new(self.tx.clone())).await {
            Ok(server) => server,
            Err(e) => return Err(self.inner.start_failed(Subsystem::Proxy, e.into())),
        };
        let local = match server.local_addr() {
            Ok(local) => local,
            Err(e) => return Err(self.inner.start_failed(Subsystem::Proxy, e.into())),
        };

        if auto_proxy {
            if let Err(e) = self.inner.system.enable_proxy(local.port()) {
                drop(server);
                return Err(self.inner.start_failed(Subsystem::Proxy, LifecycleError::System(e)));
            }
            slot.system_enabled = true;
        }

        slot.session += 1;
        let session = slot.session;
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let running = server.serve(move |err| {
            if let Some(inner) = inner.upgrade() {
                tokio::spawn(async move { inner.proxy_ended(session, err).await });
            }
        });
        let running = match running {
            Ok(running) => running,
            Err(e) => {
                self.inner.disable_system_proxy(&mut slot);
                return Err(self.inner.start_failed(Subsystem::Proxy, e.into()));
            }
        };

        slot.running = Some(running);
        self.inner.set_status(Subsystem::Proxy, Status::Running);
        info!(%local, auto_proxy, "proxy started");
        emit_response(&*self.inner.sink, CODE_PROXY, format!("proxy listening on {local}"));
        Ok(local)
    }

    /// Close the listener and every proxied connection.
    pub async fn stop_proxy(&self) -> Result<(), LifecycleError> {
        let mut slot = self.inner.proxy.lock().await;
        let Some(running) = slot.running.take() else {
            return Err(LifecycleError::AlreadyStopped(Subsystem::Proxy));
        };
        slot.session += 1;
        self.inner.disable_system_proxy(&mut slot);
        running.stop().await;
        self.inner.set_status(Subsystem::Proxy, Status::Stopped);
        Ok(())
    }

    /// Replace the configuration. Host filter and log flag apply to the next
    /// dispatched record; capture and listener settings apply on next start.
    /// Flipping `auto_proxy` while the proxy runs toggles the OS setting.
    pub async fn set_config(&self, config: Config) -> Result<(), LifecycleError> {
        let mut slot = self.inner.proxy.lock().await;
        let auto_proxy = config.http.auto_proxy;
        *self.inner.config.write().unwrap_or_else(PoisonError::into_inner) = config;

        let Some(running) = &slot.running else {
            return Ok(());
        };
        if auto_proxy && !slot.system_enabled {
            let port = running.local_addr().port();
            if let Err(e) = self.inner.system.enable_proxy(port) {
                emit_error(&*self.inner.sink, CODE_PROXY, format!("cannot set system proxy: {e}"));
                return Err(LifecycleError::System(e));
            }
            slot.system_enabled = true;
        } else if !auto_proxy && slot.system_enabled {
            slot.system_enabled = false;
            if let Err(e) = self.inner.system.disable_proxy() {
                emit_error(&*self.inner.sink, CODE_PROXY, format!("cannot reset system proxy: {e}"));
                return Err(LifecycleError::System(e));
            }
        }
        Ok(())
    }

    pub fn install_cert(&self) -> Result<(), LifecycleError> {
        self.cert_op("install", |s| s.install_cert(AUTHORITY_NAME))
    }

    pub fn uninstall_cert(&self) -> Result<(), LifecycleError> {
        self.cert_op("uninstall", |s| s.uninstall_cert(AUTHORITY_NAME))
    }

    fn cert_op(
        &self,
        what: &str,
        op: impl FnOnce(&dyn SystemIntegration) -> Result<(), String>,
    ) -> Result<(), LifecycleError> {
        match op(&*self.inner.system) {
            Ok(()) => {
                info!(authority = AUTHORITY_NAME, "certificate {what} done");
                Ok(())
            }
            Err(e) => {
                emit_error(&*self.inner.sink, CODE_PROXY, format!("certificate {what} failed: {e}"));
                Err(LifecycleError::System(e))
            }
        }
    }

    /// Stop both producers, close the queue and wait for the dispatcher to
    /// drain it.
    pub async fn shutdown(self) -> DispatchStats {
        let Controller {
            inner,
            tx,
            dispatcher,
        } = self;

        {
            let mut slot = inner.proxy.lock().await;
            if let Some(running) = slot.running.take() {
                slot.session += 1;
                inner.disable_system_proxy(&mut slot);
                running.stop().await;
                inner.set_status(Subsystem::Proxy, Status::Stopped);
            }
        }

        let capture = inner.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _ = capture.stop_capture();
            let leftover = capture.capture_slot().thread.take();
            if let Some(thread) = leftover {
                let _ = thread.join();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("capture shutdown task failed: {e}");
        }

        // last sender: the dispatcher sees end of stream once it drains
        drop(tx);
        match tokio::task::spawn_blocking(move || dispatcher.join()).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(_)) => {
                warn!("dispatcher thread panicked");
                DispatchStats::default()
            }
            Err(e) => {
                warn!("dispatcher join failed: {e}");
                DispatchStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::capture::testing::{ScriptedEngine, http_frame};
    use crate::events::testing::RecordingSink;
    use crate::events::{ERROR, HTTP_PACKET, IP_PACKET};

    #[derive(Default)]
    struct RecordingSystem {
        calls: Mutex<Vec<String>>,
        fail_enable: bool,
    }

    impl RecordingSystem {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SystemIntegration for RecordingSystem {
        fn enable_proxy(&self, port: u16) -> Result<(), String> {
            self.calls.lock().unwrap().push(format!("enable {port}"));
            if self.fail_enable {
                return Err("access denied".into());
            }
            Ok(())
        }

        fn disable_proxy(&self) -> Result<(), String> {
            self.calls.lock().unwrap().push("disable".into());
            Ok(())
        }

        fn install_cert(&self, authority: &str) -> Result<(), String> {
            self.calls.lock().unwrap().push(format!("install {authority}"));
            Ok(())
        }

        fn uninstall_cert(&self, authority: &str) -> Result<(), String> {
            self.calls.lock().unwrap().push(format!("uninstall {authority}"));
            Err("not installed".into())
        }
    }

    struct Harness {
        ctl: Controller,
        engine: Arc<ScriptedEngine>,
        sink: Arc<RecordingSink>,
        system: Arc<RecordingSystem>,
    }

    fn harness_with(config: Config, system: RecordingSystem) -> Harness {
        let engine = Arc::new(ScriptedEngine::default());
        let sink = Arc::new(RecordingSink::default());
        let system = Arc::new(system);
        let ctl = Controller::new(config, engine.clone(), sink.clone(), system.clone()).unwrap();
        Harness {
            ctl,
            engine,
            sink,
            system,
        }
    }

    fn proxy_config(auto_proxy: bool) -> Config {
        let mut cfg = Config::default();
        cfg.http.port = 0;
        cfg.http.auto_proxy = auto_proxy;
        cfg
    }

    fn harness() -> Harness {
        harness_with(proxy_config(false), RecordingSystem::default())
    }

    async fn wait_for_events(sink: &RecordingSink, name: &str, n: usize) -> Vec<Value> {
        for _ in 0..200 {
            let events = sink.named(name);
            if events.len() >= n {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} {name} events, got {:?}", sink.events());
    }

    async fn wait_for_status(rx: &mut watch::Receiver<Status>, want: Status) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("status change")
            .unwrap();
    }

    #[tokio::test]
    async fn capture_double_start_and_stop_are_rejected() {
        let h = harness();
        let _feed = h.engine.feed();

        h.ctl.start_capture(Some("lo")).unwrap();
        assert_eq!(h.ctl.status(Subsystem::Capture), Status::Running);
        assert!(matches!(
            h.ctl.start_capture(None),
            Err(LifecycleError::AlreadyRunning(Subsystem::Capture))
        ));
        assert_eq!(h.ctl.status(Subsystem::Capture), Status::Running);
        assert_eq!(h.engine.opened.lock().unwrap().len(), 1);

        h.ctl.stop_capture().unwrap();
        assert_eq!(h.ctl.status(Subsystem::Capture), Status::Stopped);
        assert!(matches!(
            h.ctl.stop_capture(),
            Err(LifecycleError::AlreadyStopped(Subsystem::Capture))
        ));
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn capture_open_failure_stays_stopped_and_reports() {
        let h = harness();
        let err = h.ctl.start_capture(Some("eth9")).unwrap_err();
        assert!(matches!(err, LifecycleError::Capture(CaptureError::DeviceNotFound(_))));
        assert_eq!(h.ctl.status(Subsystem::Capture), Status::Stopped);

        let errors = h.sink.named(ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["code"], CODE_CAPTURE);
        assert!(errors[0]["message"].as_str().unwrap().contains("eth9"));
        assert_eq!(h.ctl.config().ip.device, "eth9");
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn mid_stream_failure_flips_capture_to_stopped() {
        let h = harness();
        let feed = h.engine.feed();
        let mut status = h.ctl.subscribe(Subsystem::Capture);
        h.ctl.start_capture(None).unwrap();

        feed.send(Err(CaptureError::Read("interface went down".into()))).unwrap();
        wait_for_status(&mut status, Status::Stopped).await;
        let errors = wait_for_events(&h.sink, ERROR, 1).await;
        assert!(errors[0]["message"].as_str().unwrap().contains("interface went down"));
        assert!(matches!(h.ctl.stop_capture(), Err(LifecycleError::AlreadyStopped(_))));

        // a fresh session can start after the failed one
        let _next = h.engine.feed();
        h.ctl.start_capture(None).unwrap();
        assert_eq!(h.ctl.status(Subsystem::Capture), Status::Running);
        h.ctl.stop_capture().unwrap();
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn stale_session_cannot_stop_a_new_one() {
        let h = harness();
        let first = h.engine.feed();
        h.ctl.start_capture(None).unwrap();
        h.ctl.stop_capture().unwrap();
        let _second = h.engine.feed();
        h.ctl.start_capture(None).unwrap();
        // the first source is gone; its feed can no longer affect anything
        assert!(first.send(Err(CaptureError::Read("late".into()))).is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.ctl.status(Subsystem::Capture), Status::Running);
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn racing_stop_and_start_never_overlap_sources() {
        let h = harness();
        let feeds: Vec<_> = (0..48).map(|_| h.engine.feed()).collect();
        h.ctl.start_capture(None).unwrap();
        for _ in 0..20 {
            let barrier = std::sync::Barrier::new(2);
            thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    let _ = h.ctl.stop_capture();
                });
                s.spawn(|| {
                    barrier.wait();
                    let _ = h.ctl.start_capture(None);
                });
            });
            if h.ctl.status(Subsystem::Capture) == Status::Stopped {
                h.ctl.start_capture(None).unwrap();
            }
            assert_eq!(h.engine.live(), 1);
        }
        assert_eq!(h.engine.peak_live(), 1);
        h.ctl.stop_capture().unwrap();
        assert_eq!(h.engine.live(), 0);
        drop(feeds);
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_the_controller_closes_capture() {
        let h = harness();
        let _feed = h.engine.feed();
        h.ctl.start_capture(None).unwrap();
        assert_eq!(h.engine.live(), 1);

        let Harness { ctl, engine, .. } = h;
        drop(ctl);
        for _ in 0..100 {
            if engine.live() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.live(), 0);
    }

    #[tokio::test]
    async fn captured_frame_reaches_the_sink() {
        let mut cfg = Config::default();
        cfg.ip.device = "lo".into();
        cfg.ip.snaplen = 65535;
        cfg.ip.promisc = false;
        cfg.ip.timeout_ms = 100;
        cfg.ip.filter = "tcp port 80".into();
        let h = harness_with(cfg.clone(), RecordingSystem::default());
        let feed = h.engine.feed();

        h.ctl.start_capture(None).unwrap();
        assert_eq!(h.engine.opened.lock().unwrap()[0], cfg.ip);
        feed.send(Ok(http_frame(b"GET / HTTP/1.1"))).unwrap();

        let packets = wait_for_events(&h.sink, IP_PACKET, 1).await;
        let ip = &packets[0];
        assert_eq!(ip["ip_version"], 4);
        assert_eq!(ip["src_mac"], "02:00:00:00:00:01");
        assert_eq!(ip["dst_mac"], "02:00:00:00:00:02");
        assert_eq!(ip["src_ip"], "127.0.0.1");
        assert_eq!(ip["dst_ip"], "127.0.0.1");
        assert_eq!(ip["src_port"], 51000);
        assert_eq!(ip["dst_port"], 80);
        assert_eq!(ip["application_layer"], "HTTP");

        let stats = h.ctl.shutdown().await;
        assert_eq!(stats.forwarded, 1);
    }

    #[tokio::test]
    async fn proxy_double_start_and_stop_are_rejected() {
        let h = harness();
        let addr = h.ctl.start_proxy().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(h.ctl.status(Subsystem::Proxy), Status::Running);
        assert!(matches!(
            h.ctl.start_proxy().await,
            Err(LifecycleError::AlreadyRunning(Subsystem::Proxy))
        ));

        h.ctl.stop_proxy().await.unwrap();
        assert_eq!(h.ctl.status(Subsystem::Proxy), Status::Stopped);
        assert!(matches!(
            h.ctl.stop_proxy().await,
            Err(LifecycleError::AlreadyStopped(Subsystem::Proxy))
        ));
        TcpListener::bind(addr).await.unwrap();
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn proxy_bind_failure_reports_code_one() {
        let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let mut cfg = proxy_config(false);
        cfg.http.port = taken.local_addr().unwrap().port();
        let h = harness_with(cfg, RecordingSystem::default());

        let err = h.ctl.start_proxy().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Listen(ListenError::Bind { .. })));
        assert_eq!(h.ctl.status(Subsystem::Proxy), Status::Stopped);
        assert_eq!(h.sink.named(ERROR)[0]["code"], CODE_PROXY);
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn broken_listener_flips_proxy_to_stopped() {
        let h = harness_with(proxy_config(true), RecordingSystem::default());
        let addr = h.ctl.start_proxy().await.unwrap();
        let mut status = h.ctl.subscribe(Subsystem::Proxy);
        h.ctl
            .inner
            .proxy
            .lock()
            .await
            .running
            .as_ref()
            .unwrap()
            .fail_next_accept(std::io::Error::other("listener broke"));
        let _client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();

        wait_for_status(&mut status, Status::Stopped).await;
        let errors = wait_for_events(&h.sink, ERROR, 1).await;
        assert_eq!(errors[0]["code"], CODE_PROXY);
        assert!(errors[0]["message"].as_str().unwrap().contains("listener broke"));
        assert_eq!(h.system.calls(), vec![format!("enable {}", addr.port()), "disable".to_string()]);
        assert!(matches!(
            h.ctl.stop_proxy().await,
            Err(LifecycleError::AlreadyStopped(Subsystem::Proxy))
        ));

        h.ctl.start_proxy().await.unwrap();
        assert_eq!(h.ctl.status(Subsystem::Proxy), Status::Running);
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn auto_proxy_wraps_the_listener() {
        let h = harness_with(proxy_config(true), RecordingSystem::default());
        let addr = h.ctl.start_proxy().await.unwrap();
        h.ctl.stop_proxy().await.unwrap();
        assert_eq!(h.system.calls(), vec![format!("enable {}", addr.port()), "disable".to_string()]);
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn failed_system_proxy_releases_listener() {
        let system = RecordingSystem {
            fail_enable: true,
            ..Default::default()
        };
        let h = harness_with(proxy_config(true), system);
        let err = h.ctl.start_proxy().await.unwrap_err();
        assert!(matches!(err, LifecycleError::System(_)));
        assert_eq!(h.ctl.status(Subsystem::Proxy), Status::Stopped);

        let port: u16 = h.system.calls()[0]
            .strip_prefix("enable ")
            .unwrap()
            .parse()
            .unwrap();
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await.unwrap();
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn toggling_auto_proxy_while_running() {
        let h = harness();
        let addr = h.ctl.start_proxy().await.unwrap();
        h.ctl.set_config(proxy_config(true)).await.unwrap();
        h.ctl.set_config(proxy_config(false)).await.unwrap();
        assert_eq!(h.system.calls(), vec![format!("enable {}", addr.port()), "disable".to_string()]);
        h.ctl.shutdown().await;
        assert_eq!(h.system.calls().len(), 2);
    }

    #[tokio::test]
    async fn certificate_operations_pass_the_authority() {
        let h = harness();
        h.ctl.install_cert().unwrap();
        assert!(matches!(h.ctl.uninstall_cert(), Err(LifecycleError::System(_))));
        assert_eq!(
            h.system.calls(),
            vec![format!("install {AUTHORITY_NAME}"), format!("uninstall {AUTHORITY_NAME}")]
        );
        assert_eq!(h.sink.named(ERROR).len(), 1);
        h.ctl.shutdown().await;
    }

    #[tokio::test]
    async fn proxied_exchange_becomes_paired_records() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = s.read(&mut buf).await.unwrap();
            s.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi")
                .await
                .unwrap();
        });

        let h = harness();
        let proxy = h.ctl.start_proxy().await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
        client
            .write_all(
                format!("GET http://{origin_addr}/hello HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.ends_with(b"hi"));

        let records = wait_for_events(&h.sink, HTTP_PACKET, 2).await;
        assert_eq!(records[0]["direction"], "REQUEST");
        assert_eq!(records[0]["body"], "[no data]");
        assert_eq!(records[1]["direction"], "RESPONSE");
        assert_eq!(records[1]["body"], "hi");
        assert_eq!(records[1]["status"], "200 OK");
        assert_eq!(records[0]["exchange_id"], records[1]["exchange_id"]);
        assert_eq!(records[1]["path"], "/hello");

        let stats = h.ctl.shutdown().await;
        assert_eq!(stats.forwarded, 2);
    }
}
