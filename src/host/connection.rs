//!
//! Line-oriented byte transport over serial, RFC2217, or TCP URLs.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::error::ConnectionError;

const BOOT_SETTLE_DELAY: Duration = Duration::from_millis(100);
const READ_CHUNK_SIZE: usize = 256;

trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

type BoxedStream = Box<dyn DuplexStream>;

struct ReaderState {
    half: ReadHalf<BoxedStream>,
    buffer: Vec<u8>,
}

struct WriterState {
    half: WriteHalf<BoxedStream>,
}

///
/// A line-oriented transport to a G-code-speaking device.
///
/// Construction takes a URL (`/dev/*`, `COMn`, `socket://host:port`, or
/// `rfc2217://host:port`) and a baud rate, the latter ignored for non-serial
/// transports. The connection is not opened until `open()` is called.
///
/// RFC2217 is treated purely as a capability flag: this crate negotiates a plain TCP
/// stream to the given host/port and does not implement the RFC2217 option
/// negotiation state machine, since no reachable invariant depends on it.
///
pub struct Connection {
    url: String,
    baud_rate: u32,
    is_network_transport: bool,
    has_flow_control: bool,
    is_open: AtomicBool,
    reader: Mutex<Option<ReaderState>>,
    writer: Mutex<Option<WriterState>>,
}

impl Connection {
    ///
    /// Constructs a new, unopened connection.
    ///
    /// # Parameters:
    /// - `url`: Transport URL. Ignored for its scheme beyond recognizing
    ///   `socket://`/`rfc2217://` as network transports; anything else is treated as
    ///   a serial device path.
    /// - `baud_rate`: Serial baud rate; ignored for network transports.
    /// - `has_flow_control`: Whether RTS/CTS (or DSR/DTR) hardware flow control
    ///   should be enabled on a serial transport.
    ///
    pub fn new(url: impl Into<String>, baud_rate: u32, has_flow_control: bool) -> Self {
        let url = url.into();
        let is_network_transport = url.starts_with("socket://") || url.starts_with("rfc2217://");

        Connection {
            url,
            baud_rate,
            is_network_transport,
            has_flow_control,
            is_open: AtomicBool::new(false),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Whether the transport is currently open.
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    /// Whether this URL addresses a network transport (`socket://` or `rfc2217://`).
    pub fn is_network_transport(&self) -> bool {
        self.is_network_transport
    }

    /// Whether hardware flow control was requested for a serial transport.
    pub fn has_flow_control(&self) -> bool {
        self.has_flow_control
    }

    /// Whether the device is expected to tolerate streamed (non-lock-step) sends.
    pub fn can_stream_commands(&self) -> bool {
        self.is_network_transport || self.has_flow_control
    }

    ///
    /// Opens the transport.
    ///
    /// Fails with `AlreadyOpen` if already open. On success, resets the internal
    /// receive buffer, applies 8-N-1 framing plus configured flow control for serial
    /// transports, then sleeps briefly to allow MCU bootloaders to stabilize.
    ///
    /// # Warnings
    /// Toggling DSR/DTR on real hardware may reset the device; flow control
    /// settings only take effect on physical or RFC2217 streams.
    ///
    pub async fn open(&self) -> Result<(), ConnectionError> {
        if self.is_open.load(Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyOpen);
        }

        let stream: BoxedStream = if self.is_network_transport {
            self.open_network_stream().await?
        } else {
            self.open_serial_stream()?
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(ReaderState { half: read_half, buffer: Vec::new() });
        *self.writer.lock().await = Some(WriterState { half: write_half });
        self.is_open.store(true, Ordering::SeqCst);

        tokio::time::sleep(BOOT_SETTLE_DELAY).await;
        Ok(())
    }

    async fn open_network_stream(&self) -> Result<BoxedStream, ConnectionError> {
        let host_port = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| ConnectionError::Connect { url: self.url.clone(), reason: "missing scheme".to_string() })?;

        let stream = TcpStream::connect(host_port)
            .await
            .map_err(|err| ConnectionError::Connect { url: self.url.clone(), reason: err.to_string() })?;

        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn open_serial_stream(&self) -> Result<BoxedStream, ConnectionError> {
        let flow_control =
            if self.has_flow_control { tokio_serial::FlowControl::Hardware } else { tokio_serial::FlowControl::None };

        let builder = tokio_serial::new(&self.url, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(flow_control);

        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|err| ConnectionError::Connect { url: self.url.clone(), reason: err.to_string() })?;

        Ok(Box::new(stream))
    }

    /// Closes the transport. Idempotent; always releases the backend.
    pub async fn close(&self) {
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
        self.is_open.store(false, Ordering::SeqCst);
    }

    ///
    /// Reads a single line from the device.
    ///
    /// Maintains an internal byte buffer across calls: a partial line is retained
    /// and completed by a later call. Returns the line with surrounding whitespace
    /// stripped and non-ASCII bytes replaced with `U+FFFD`. On timeout before a full
    /// line arrives, returns an empty string rather than failing.
    ///
    pub async fn read_line(&self, timeout: Duration) -> Result<String, ConnectionError> {
        let mut guard = self.reader.lock().await;
        let state = guard.as_mut().ok_or(ConnectionError::NotOpen)?;

        loop {
            if let Some(pos) = state.buffer.iter().position(|&byte| byte == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                return Ok(decode_line(&line));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];

            match tokio::time::timeout(timeout, state.half.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ConnectionError::Read { reason: "connection closed by peer".to_string() }),
                Ok(Ok(n)) => state.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => return Err(ConnectionError::Read { reason: err.to_string() }),
                Err(_) => return Ok(String::new()),
            }
        }
    }

    ///
    /// Writes a single line to the device.
    ///
    /// Appends `\n`, encodes as ASCII, writes all bytes, and flushes before
    /// returning. Fails `EncodeError` on non-ASCII input, and `PartialWrite` if
    /// fewer bytes were written than requested.
    ///
    pub async fn write_line(&self, line: &str, timeout: Duration) -> Result<(), ConnectionError> {
        if !line.is_ascii() {
            return Err(ConnectionError::Encode { reason: format!("line contains non-ASCII characters: {line:?}") });
        }

        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');

        let mut guard = self.writer.lock().await;
        let state = guard.as_mut().ok_or(ConnectionError::NotOpen)?;

        let written = match tokio::time::timeout(timeout, state.half.write(&payload)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(ConnectionError::Write { reason: err.to_string() }),
            Err(_) => return Err(ConnectionError::Write { reason: "write timed out".to_string() }),
        };

        if written != payload.len() {
            return Err(ConnectionError::PartialWrite { written, expected: payload.len() });
        }

        state
            .half
            .flush()
            .await
            .map_err(|err| ConnectionError::Write { reason: err.to_string() })
    }
}

/// Strips the trailing delimiter, trims surrounding ASCII whitespace, and replaces
/// non-ASCII bytes with the Unicode replacement character.
fn decode_line(line_with_delimiter: &[u8]) -> String {
    let without_delimiter = line_with_delimiter.strip_suffix(b"\n").unwrap_or(line_with_delimiter);
    let trimmed = trim_ascii_whitespace(without_delimiter);

    trimmed.iter().map(|&byte| if byte.is_ascii() { byte as char } else { '\u{FFFD}' }).collect()
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map(|pos| pos + 1).unwrap_or(start);
    &bytes[start..end]
}
