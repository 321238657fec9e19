//!
//! Typed device responses and host-internal events dispatched to subscribers.
//!

use std::collections::BTreeMap;

use once_cell::sync::OnceCell;

use super::event_parser::EventParser;

///
/// Discriminant for a `DeviceEvent`, used by `Category::Specific` subscriptions.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    /// Device has just booted and is starting up.
    Online,
    /// Device is ready to receive the next command.
    Ready,
    /// Device has emptied its buffer and is waiting for commands.
    Wait,
    /// Device is temporarily busy and cannot process commands.
    Busy,
    /// Debugging message received from the device.
    Debug,
    /// Status or feedback information received from the device.
    Feedback,
    /// Device requests a resend of a specific command.
    Resend,
    /// Indicates a non-fatal error occurred.
    Error,
    /// Indicates a fatal error or hardware failure.
    Fault,
    /// Unrecognized response; none of the prefix table entries matched.
    Generic,
}

///
/// A parsed response from the device.
///
/// Carries the raw message unconditionally; `line_number` and `fields` are derived
/// lazily from the message on first access and cached thereafter, mirroring the
/// `cached_property` behavior of the source this crate's protocol layer replaces.
///
pub struct DeviceEvent {
    kind: DeviceEventKind,
    message: String,
    line_number: OnceCell<i64>,
    fields: OnceCell<BTreeMap<String, f64>>,
}

impl DeviceEvent {
    pub(crate) fn new(kind: DeviceEventKind, message: impl Into<String>) -> Self {
        DeviceEvent {
            kind,
            message: message.into(),
            line_number: OnceCell::new(),
            fields: OnceCell::new(),
        }
    }

    /// The event's discriminant.
    pub fn kind(&self) -> DeviceEventKind {
        self.kind
    }

    /// The raw, unparsed message received from the device.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Requested line number to resend; meaningful for `DeviceEventKind::Resend`.
    /// Returns `-1` if no line number could be extracted.
    pub fn line_number(&self) -> i64 {
        *self.line_number.get_or_init(|| EventParser::extract_line_number(&self.message))
    }

    /// Parsed parameters from the device message; meaningful for
    /// `DeviceEventKind::Feedback`. Empty if the message was malformed.
    pub fn fields(&self) -> &BTreeMap<String, f64> {
        self.fields.get_or_init(|| EventParser::extract_fields(&self.message).unwrap_or_default())
    }
}

impl Clone for DeviceEvent {
    fn clone(&self) -> Self {
        DeviceEvent {
            kind: self.kind,
            message: self.message.clone(),
            line_number: self.line_number.clone(),
            fields: self.fields.clone(),
        }
    }
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEvent").field("kind", &self.kind).field("message", &self.message).finish()
    }
}

impl PartialEq for DeviceEvent {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

///
/// An unhandled error surfaced from a worker task, carried as an event so
/// subscribers can react without the host propagating a `Result` across a task
/// boundary.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostExceptionEvent {
    message: String,
}

impl HostExceptionEvent {
    pub(crate) fn new(error: impl std::fmt::Display) -> Self {
        HostExceptionEvent { message: error.to_string() }
    }

    /// The rendered error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

///
/// Every event a `Host` may dispatch to subscribers.
///
#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    /// A parsed device response.
    Device(DeviceEvent),
    /// An unhandled error from a worker task.
    HostException(HostExceptionEvent),
}

impl HostEvent {
    /// The device event kind, if this is a `Device` event.
    pub fn device_kind(&self) -> Option<DeviceEventKind> {
        match self {
            HostEvent::Device(event) => Some(event.kind()),
            HostEvent::HostException(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_number_is_cached() {
        let event = DeviceEvent::new(DeviceEventKind::Resend, "Resend: 5");
        assert_eq!(event.line_number(), 5);
        assert_eq!(event.line_number(), 5);
    }

    #[test]
    fn fields_is_cached_and_empty_on_malformed_input() {
        let event = DeviceEvent::new(DeviceEventKind::Feedback, "<Idle|FS:1,2,3>");
        assert!(event.fields().is_empty());
        assert!(event.fields().is_empty());
    }

    #[test]
    fn equal_messages_produce_equal_events() {
        let a = DeviceEvent::new(DeviceEventKind::Ready, "ok");
        let b = DeviceEvent::new(DeviceEventKind::Ready, "ok");
        assert_eq!(a, b);
    }
}
