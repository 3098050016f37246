use serde::Serialize;
use serde_json::Value;
use tracing::info;

pub const HTTP_PACKET: &str = "HTTPPacket";
pub const IP_PACKET: &str = "IPPacket";
pub const RESPONSE: &str = "Response";
pub const ERROR: &str = "Error";

/// Status codes carried by out-of-band events.
pub const CODE_PROXY: i32 = 1;
pub const CODE_CAPTURE: i32 = 2;

/// Receiver of UI events. Implementations must be cheap and must not block
/// for long: the dispatcher calls `emit` for every delivered record.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &str, payload: Value);
}

/// Out-of-band response or error notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub code: i32,
    pub message: String,
}

impl Event {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub(crate) fn emit_error(sink: &dyn EventSink, code: i32, message: impl Into<String>) {
    let event = Event::new(code, message);
    tracing::warn!(code = event.code, "{}", event.message);
    sink.emit(ERROR, serde_json::to_value(&event).unwrap_or(Value::Null));
}

pub(crate) fn emit_response(sink: &dyn EventSink, code: i32, message: impl Into<String>) {
    sink.emit(
        RESPONSE,
        serde_json::to_value(Event::new(code, message)).unwrap_or(Value::Null),
    );
}

/// Writes every event to the log; used by the headless binary.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &str, payload: Value) {
        info!(target: "netsniffer::events", event, "{payload}");
    }
}
