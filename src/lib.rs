//!
//! G-code host communication core.
//!
//! Maintains a reliable, asynchronous, bidirectional link between this process and a
//! G-code-speaking device over serial, RFC2217, or TCP transports: streams commands,
//! tracks the device's free buffer, retransmits on request, and dispatches parsed
//! responses as events.
//!

pub mod host;

pub use host::command::Command;
pub use host::connection::Connection;
pub use host::error::{CommandError, ConnectionError, HostError, ParserError, QuotaError, TrackerError};
pub use host::gcode_host::{GCodeHost, HostOptions, StreamingMode};
pub use host::protocol::{Category, DeviceEvent, DeviceEventKind, EventDispatcher, Handler, HostEvent, HostExceptionEvent, SubscriptionId};
pub use host::quota::QuotaTracker;
pub use host::scheduler::TaskPriority;
pub use host::tracker::CommandTracker;
