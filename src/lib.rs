pub mod capture;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod events;
pub mod interception;
pub mod layers;
pub mod lifecycle;
pub mod proxy;
pub mod queue;
pub mod record;

pub use capture::{CaptureEngine, CaptureError, PcapEngine, list_devices};
pub use config::{Config, ConfigError};
pub use events::{EventSink, TracingSink};
pub use lifecycle::{Controller, LifecycleError, NoopSystem, Status, Subsystem, SystemIntegration};
pub use record::{HttpRecord, IpRecord, PacketRecord};
