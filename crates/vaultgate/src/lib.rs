pub mod audit;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod store;
pub mod token;

pub use audit::{
    AuditEvent, AuditSink, ChannelAuditSink, Outcome, SecurityEventType, TracingAuditSink,
};
pub use config::GateConfig;
pub use error::{ConfigError, TokenError};
pub use gate::{AdmissionGate, Decision};
pub use identity::{ANONYMOUS, ClientIdentifier, RequestInfo};
