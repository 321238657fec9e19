use thiserror::Error;

///
/// All errors emitted while opening, reading from, or writing to a `Connection`.
/// The error messages can be displayed to users on the frontend. Format nicely please.
///
/// - `AlreadyOpen`: `open()` was called on a connection that is already open.
/// - `NotOpen`: An operation was attempted before `open()` succeeded, or after `close()`.
/// - `Connect`: The transport failed to open.
/// - `Read`: A transport-level failure occurred while reading.
/// - `Write`: A transport-level failure occurred while writing.
/// - `PartialWrite`: Fewer bytes were written than requested.
/// - `Encode`: The line to transmit contained non-ASCII characters.
///
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection is already open.")]
    AlreadyOpen,

    #[error("Connection is not open.")]
    NotOpen,

    #[error("Cannot connect to '{}': {}", .url, .reason)]
    Connect { url: String, reason: String },

    #[error("Read failed: {}", .reason)]
    Read { reason: String },

    #[error("Write failed: {}", .reason)]
    Write { reason: String },

    #[error("Partial write detected: wrote {} of {} bytes", .written, .expected)]
    PartialWrite { written: usize, expected: usize },

    #[error("Line contains non-ASCII characters and cannot be encoded: {}", .reason)]
    Encode { reason: String },
}

///
/// All errors emitted while constructing a `Command`.
///
/// - `EmptyCommand`: The G-code is empty, or only contains comments.
/// - `MultipleCommands`: The G-code spans more than a single line.
///
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("G-code cannot be empty or only comments.")]
    EmptyCommand,

    #[error("G-code must be a single line, but multiple commands were given.")]
    MultipleCommands,
}

///
/// All errors emitted by the `CommandTracker` history.
///
/// - `NotFound`: A resend was requested for a line number that was never sent, or that
///   was evicted from the bounded history window.
///
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("No command recorded for line number {}.", .0)]
    NotFound(u32),
}

///
/// All errors emitted by the `QuotaTracker` buffer accounting.
///
/// - `InvalidSize`: A reservation was requested for zero bytes, or more than the
///   device's assumed total buffer capacity.
/// - `InvalidTimeout`: A non-positive timeout was given.
/// - `ConsumeTimeout`: The deadline elapsed before enough buffer space was reclaimed.
///   This is control flow, not a hard failure — the sender retries the task.
///
#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Reservation size {} is invalid for a buffer of {} bytes.", .size, .max_bytes)]
    InvalidSize { size: usize, max_bytes: usize },

    #[error("Timeout must be positive.")]
    InvalidTimeout,

    #[error("Timed out waiting for send quota.")]
    ConsumeTimeout,
}

///
/// All errors emitted by `EventParser` field extraction.
///
/// - `MalformedFeedback`: A feedback message's numeric payload could not be parsed,
///   or an `FS` field did not carry exactly two components.
///
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Malformed feedback message: {}", .reason)]
    MalformedFeedback { reason: String },
}

///
/// All errors emitted from the `GCodeHost` orchestrator's public API.
///
/// - `AlreadyStarted`: `start()` was called more than once.
/// - `NotStarted`: `stop()` was called before `start()`.
/// - `ShuttingDown`: `enqueue()` was called after shutdown began.
/// - `MultipleCommands`: `enqueue()` was given a string spanning more than one line.
/// - `InvalidTimeout`: A timeout setter was given a non-positive value.
///
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Host can only be started once.")]
    AlreadyStarted,

    #[error("Host is not running.")]
    NotStarted,

    #[error("Cannot enqueue commands during shutdown.")]
    ShuttingDown,

    #[error("Cannot enqueue multiple commands in a single string.")]
    MultipleCommands(#[source] CommandError),

    #[error("{} must be positive.", .name)]
    InvalidTimeout { name: &'static str },
}
