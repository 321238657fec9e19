//!
//! Device response parsing and event dispatch.
//!

pub mod event_dispatcher;
pub mod event_parser;
pub mod events;

pub use event_dispatcher::{Category, EventDispatcher, Handler, SubscriptionId};
pub use event_parser::EventParser;
pub use events::{DeviceEvent, DeviceEventKind, HostEvent, HostExceptionEvent};
