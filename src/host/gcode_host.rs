//!
//! Orchestrates the connection, command history, quota, parser, and dispatcher:
//! owns the two worker tasks and the public host API.
//!

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::command::Command;
use super::connection::Connection;
use super::error::{CommandError, HostError, QuotaError};
use super::protocol::event_dispatcher::{Category, EventDispatcher, Handler, SubscriptionId};
use super::protocol::event_parser::EventParser;
use super::protocol::events::{DeviceEvent, DeviceEventKind, HostEvent, HostExceptionEvent};
use super::scheduler::{SendQueue, TaskPriority};
use super::tracker::CommandTracker;
use super::quota::QuotaTracker;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ONLINE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);

///
/// How the sender reacts to a device that may or may not tolerate streamed
/// (non-lock-step) commands.
///
/// | Mode | `can_stream_commands = true` | `can_stream_commands = false` |
/// |------|-------------------------------|--------------------------------|
/// | `Asynchronous` | stream (never wait) | stream (never wait) |
/// | `Synchronous`  | wait for ack after each send | wait for ack after each send |
/// | `Automatic`    | stream | wait |
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StreamingMode {
    Automatic,
    Asynchronous,
    Synchronous,
}

///
/// The host's configurable options. Serializable so a downstream application can
/// load them from its own config file format without this crate depending on one.
///
#[derive(Clone, Copy, Debug, getset::CopyGetters, serde::Serialize, serde::Deserialize)]
pub struct HostOptions {
    #[getset(get_copy = "pub")]
    sign_commands: bool,
    #[getset(get_copy = "pub")]
    streaming_mode: StreamingMode,
    #[getset(get_copy = "pub")]
    write_timeout: Duration,
    #[getset(get_copy = "pub")]
    online_timeout: Duration,
    #[getset(get_copy = "pub")]
    poll_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        HostOptions {
            sign_commands: false,
            streaming_mode: StreamingMode::Automatic,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            online_timeout: DEFAULT_ONLINE_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

fn validate_timeout(timeout: Duration, name: &'static str) -> Result<(), HostError> {
    if timeout.is_zero() { Err(HostError::InvalidTimeout { name }) } else { Ok(()) }
}

enum AckWaitOutcome {
    Ready,
    ShuttingDown,
}

/// State shared between the public `GCodeHost` handle and its two worker tasks.
struct Shared {
    connection: Connection,
    parser: EventParser,
    queue: SendQueue,
    history: Mutex<CommandTracker>,
    quota: QuotaTracker,
    dispatcher: EventDispatcher,

    clear_tx: watch::Sender<bool>,
    clear_rx: watch::Receiver<bool>,
    online_tx: watch::Sender<bool>,
    online_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    line_counter: AtomicU32,
    options: Mutex<HostOptions>,
}

impl Shared {
    fn options(&self) -> HostOptions {
        *self.options.lock().unwrap()
    }

    fn next_line_number(&self) -> u32 {
        self.line_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn build_command(&self, raw_gcode: &str) -> Result<Command, CommandError> {
        let signed = self.options().sign_commands;
        Command::new(self.next_line_number(), raw_gcode, signed)
    }

    fn enqueue_handshake(&self) {
        if self.options().sign_commands {
            let reset = Command::new(0, "M110 N0", false).expect("'M110 N0' is always a valid command");
            self.queue.push(TaskPriority::System, reset);
        }

        if let Ok(sync) = self.build_command("G4 P0") {
            self.queue.push(TaskPriority::System, sync);
        }
    }

    async fn force_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.online_tx.send(false);
        let _ = self.clear_tx.send(true);
        self.queue.purge();
        self.quota.flush().await;
    }

    async fn handle_host_exception(&self, error: impl std::fmt::Display) {
        self.force_shutdown().await;
        self.dispatcher.dispatch(&HostEvent::HostException(HostExceptionEvent::new(error)));
    }

    async fn handle_device_ready(&self) {
        self.quota.reclaim().await;
        let _ = self.online_tx.send(true);
        let _ = self.clear_tx.send(true);
    }

    async fn handle_device_error(&self) {
        self.quota.reclaim().await;
        let _ = self.clear_tx.send(true);
    }

    async fn handle_device_resend(&self, event: &DeviceEvent) {
        let line_number = event.line_number();

        let fetched = u32::try_from(line_number).ok().and_then(|n| {
            let history = self.history.lock().unwrap();
            history.fetch(n).ok().cloned()
        });

        match fetched {
            Some(command) => {
                self.queue.push(TaskPriority::System, command);
                self.quota.reclaim().await;
                let _ = self.clear_tx.send(true);
            }
            None => {
                tracing::warn!(line_number, "resend requested for unknown line number");
                self.handle_host_exception(format!("no command recorded for line number {line_number}")).await;
            }
        }
    }

    async fn handle_incoming_message(&self, line: &str) {
        let event = self.parser.parse(line);

        match event.kind() {
            DeviceEventKind::Online | DeviceEventKind::Ready => self.handle_device_ready().await,
            DeviceEventKind::Error => self.handle_device_error().await,
            DeviceEventKind::Resend => self.handle_device_resend(&event).await,
            DeviceEventKind::Fault => {
                tracing::error!(message = event.message(), "device fault event observed");
                self.force_shutdown().await;
            }
            _ => {}
        }

        self.dispatcher.dispatch(&HostEvent::Device(event));
    }

    async fn run_receiver(self: Arc<Self>) {
        tracing::info!("receiver task starting");

        while !self.is_shutting_down() {
            let poll_timeout = self.options().poll_timeout;

            match self.connection.read_line(poll_timeout).await {
                Ok(line) if !line.is_empty() => self.handle_incoming_message(&line).await,
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "receiver task error");
                    self.handle_host_exception(err).await;
                }
            }
        }

        tracing::info!("receiver task exiting");
    }

    async fn wait_for_acknowledgment(&self) -> AckWaitOutcome {
        if *self.clear_rx.borrow() {
            return AckWaitOutcome::Ready;
        }

        let mut clear_rx = self.clear_rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::select! {
            _ = clear_rx.wait_for(|ready| *ready) => AckWaitOutcome::Ready,
            _ = shutdown_rx.wait_for(|down| *down) => AckWaitOutcome::ShuttingDown,
        }
    }

    fn should_wait_for_ack(&self) -> bool {
        match self.options().streaming_mode {
            StreamingMode::Asynchronous => false,
            StreamingMode::Synchronous => true,
            StreamingMode::Automatic => !self.connection.can_stream_commands(),
        }
    }

    fn prepare_for_acknowledgment(&self) {
        if self.should_wait_for_ack() {
            let _ = self.clear_tx.send(false);
        }
    }

    async fn run_sender(self: Arc<Self>) {
        tracing::info!("sender task starting");

        let online_timeout = self.options().online_timeout;
        let mut online_rx = self.online_rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::select! {
            _ = online_rx.wait_for(|online| *online) => {}
            _ = shutdown_rx.wait_for(|down| *down) => {}
            _ = tokio::time::sleep(online_timeout) => {}
        }

        if !self.is_shutting_down() {
            self.enqueue_handshake();
        }

        while !self.is_shutting_down() {
            let poll_timeout = self.options().poll_timeout;
            let write_timeout = self.options().write_timeout;

            match self.wait_for_acknowledgment().await {
                AckWaitOutcome::ShuttingDown => break,
                AckWaitOutcome::Ready => {}
            }

            let task = match self.queue.pop(poll_timeout).await {
                Some(task) => task,
                None => continue,
            };

            let payload = task.command().format_line();
            let size = 1 + payload.len();

            if let Err(err) = self.quota.consume(size, poll_timeout).await {
                match err {
                    QuotaError::ConsumeTimeout => {
                        self.queue.requeue(task);
                        self.queue.mark_done();
                    }
                    other => {
                        self.queue.mark_done();
                        if self.is_shutting_down() {
                            break;
                        }
                        tracing::error!(error = %other, "sender task error");
                        self.handle_host_exception(other).await;
                    }
                }
                continue;
            }

            self.prepare_for_acknowledgment();

            if let Err(err) = self.connection.write_line(&payload, write_timeout).await {
                self.queue.mark_done();
                if self.is_shutting_down() {
                    break;
                }
                tracing::error!(error = %err, "sender task error");
                self.handle_host_exception(err).await;
                continue;
            }

            self.history.lock().unwrap().record(task.into_command());
            self.queue.mark_done();
        }

        tracing::info!("sender task exiting");
    }
}

///
/// Manages asynchronous communication with a G-code device.
///
/// Owns the connection, the two worker tasks (sender, receiver), the priority send
/// queue, the command history, the buffer quota, and the event dispatcher. Spawn
/// the workers with `start()`; stop them with `stop()`. All other methods are
/// callable concurrently from any task.
///
pub struct GCodeHost {
    shared: Arc<Shared>,
    started: AtomicBool,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl GCodeHost {
    /// Initializes a host around the given, not-yet-open connection.
    pub fn new(connection: Connection) -> Self {
        let (clear_tx, clear_rx) = watch::channel(false);
        let (online_tx, online_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Shared {
            connection,
            parser: EventParser::new(),
            queue: SendQueue::new(),
            history: Mutex::new(CommandTracker::new()),
            quota: QuotaTracker::new(),
            dispatcher: EventDispatcher::new(),
            clear_tx,
            clear_rx,
            online_tx,
            online_rx,
            shutdown_tx,
            shutdown_rx,
            line_counter: AtomicU32::new(1),
            options: Mutex::new(HostOptions::default()),
        };

        GCodeHost { shared: Arc::new(shared), started: AtomicBool::new(false), tasks: Mutex::new(None) }
    }

    /// The connection this host was constructed with.
    pub fn connection(&self) -> &Connection {
        &self.shared.connection
    }

    /// A snapshot of the currently configured options.
    pub fn options(&self) -> HostOptions {
        self.shared.options()
    }

    /// Enables or disables checksum/line-number signing of outgoing commands.
    pub fn set_sign_commands(&self, enabled: bool) {
        self.shared.options.lock().unwrap().sign_commands = enabled;
    }

    /// Sets the streaming mode (see `StreamingMode`).
    pub fn set_streaming_mode(&self, mode: StreamingMode) {
        self.shared.options.lock().unwrap().streaming_mode = mode;
    }

    /// Sets the maximum time to wait for a single write. Must be positive.
    pub fn set_write_timeout(&self, timeout: Duration) -> Result<(), HostError> {
        validate_timeout(timeout, "write_timeout")?;
        self.shared.options.lock().unwrap().write_timeout = timeout;
        Ok(())
    }

    /// Sets the maximum time to wait for the initial device handshake before
    /// sending. Must be positive.
    pub fn set_online_timeout(&self, timeout: Duration) -> Result<(), HostError> {
        validate_timeout(timeout, "online_timeout")?;
        self.shared.options.lock().unwrap().online_timeout = timeout;
        Ok(())
    }

    /// Sets the tick size for internal waits (queue pop, quota consume, connection
    /// read). Must be positive.
    pub fn set_poll_timeout(&self, timeout: Duration) -> Result<(), HostError> {
        validate_timeout(timeout, "poll_timeout")?;
        self.shared.options.lock().unwrap().poll_timeout = timeout;
        Ok(())
    }

    /// Whether the send queue is non-empty or the quota tracker has reservations
    /// in flight, and the host has not been shut down.
    pub async fn is_busy(&self) -> bool {
        if self.shared.is_shutting_down() {
            return false;
        }

        if !self.shared.queue.is_empty() {
            return true;
        }

        self.shared.quota.pending().await
    }

    /// Whether any `DeviceOnline` or `DeviceReady` event has been observed since
    /// the last `start()`.
    pub fn is_online(&self) -> bool {
        *self.shared.online_rx.borrow()
    }

    /// Registers a handler for the given event category.
    pub fn subscribe(&self, category: Category, handler: Handler) -> SubscriptionId {
        self.shared.dispatcher.subscribe(category, handler)
    }

    /// Unregisters a previously registered handler.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.dispatcher.unsubscribe(id)
    }

    ///
    /// Queues a raw G-code instruction for sending.
    ///
    /// # Returns
    /// - `Ok(true)` if the instruction was queued.
    /// - `Ok(false)` if the instruction was empty or comments-only (silently
    ///   ignored).
    /// - `Err(HostError::ShuttingDown)` if the host is shutting down.
    /// - `Err(HostError::MultipleCommands)` if `raw_gcode` spans more than one
    ///   line.
    ///
    pub fn enqueue(&self, raw_gcode: &str) -> Result<bool, HostError> {
        if self.shared.is_shutting_down() {
            return Err(HostError::ShuttingDown);
        }

        match self.shared.build_command(raw_gcode) {
            Ok(command) => {
                self.shared.queue.push(TaskPriority::Normal, command);
                Ok(true)
            }
            Err(CommandError::EmptyCommand) => Ok(false),
            Err(err @ CommandError::MultipleCommands) => Err(HostError::MultipleCommands(err)),
        }
    }

    ///
    /// Starts the background sender and receiver tasks.
    ///
    /// # Errors
    /// `HostError::AlreadyStarted` if called more than once.
    ///
    pub fn start(&self) -> Result<(), HostError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HostError::AlreadyStarted);
        }

        let _ = self.shared.clear_tx.send(true);

        let receiver_shared = self.shared.clone();
        let sender_shared = self.shared.clone();

        let receiver_handle = tokio::spawn(async move { receiver_shared.run_receiver().await });
        let sender_handle = tokio::spawn(async move { sender_shared.run_sender().await });

        *self.tasks.lock().unwrap() = Some((receiver_handle, sender_handle));
        Ok(())
    }

    ///
    /// Signals the worker tasks to stop and waits for them to terminate.
    ///
    /// Idempotent: a second call after shutdown has begun returns `Ok(())`
    /// immediately. Any pending commands are dropped; call `join_queue()` first if
    /// they must be flushed to the device.
    ///
    /// # Errors
    /// `HostError::NotStarted` if `start()` was never called.
    ///
    pub async fn stop(&self, timeout: Duration) -> Result<(), HostError> {
        if self.shared.is_shutting_down() {
            return Ok(());
        }

        if !self.started.load(Ordering::SeqCst) {
            return Err(HostError::NotStarted);
        }

        self.shared.force_shutdown().await;

        let handles = self.tasks.lock().unwrap().take();

        if let Some((receiver_handle, sender_handle)) = handles {
            let _ = tokio::time::timeout(timeout, receiver_handle).await;
            let _ = tokio::time::timeout(timeout, sender_handle).await;
        }

        Ok(())
    }

    ///
    /// Blocks until the send queue is drained and the quota tracker has no
    /// in-flight reservations. May block indefinitely if the device is
    /// unresponsive; call `stop()` to force termination.
    ///
    pub async fn join_queue(&self) {
        self.shared.queue.join().await;
        self.shared.quota.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn loopback_host() -> (GCodeHost, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connection = Connection::new(format!("socket://127.0.0.1:{port}"), 0, false);
        connection.open().await.unwrap();
        (GCodeHost::new(connection), listener)
    }

    #[tokio::test]
    async fn comment_only_enqueue_is_ignored() {
        let (host, _listener) = loopback_host().await;
        assert_eq!(host.enqueue("; hello").unwrap(), false);
        assert!(host.shared.queue.is_empty());
    }

    #[tokio::test]
    async fn multiline_enqueue_is_rejected() {
        let (host, _listener) = loopback_host().await;
        assert!(matches!(host.enqueue("G1 X10\nG1 Y10"), Err(HostError::MultipleCommands(_))));
    }

    #[tokio::test]
    async fn unsigned_streaming_send_over_socket() {
        let (host, listener) = loopback_host().await;
        host.set_streaming_mode(StreamingMode::Asynchronous);
        host.set_online_timeout(Duration::from_millis(50)).unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];

            while buf.len() < b"G4 P0\nG1 X10\n".len() {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }

            buf
        });

        host.start().unwrap();
        assert_eq!(host.enqueue("g1 x10").unwrap(), true);

        let received = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert_eq!(received, b"G4 P0\nG1 X10\n".to_vec());

        host.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn fault_event_triggers_forced_shutdown() {
        let (host, listener) = loopback_host().await;

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"ALARM: hard limit\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        host.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!host.is_online());
        assert!(matches!(host.enqueue("G1 X10"), Err(HostError::ShuttingDown)));

        host.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn device_fault_dispatches_host_exception_free_fault_event() {
        let (host, listener) = loopback_host().await;
        let fault_seen = Arc::new(AtomicUsize::new(0));
        let counter = fault_seen.clone();

        host.subscribe(
            Category::Specific(DeviceEventKind::Fault),
            Arc::new(move |_| { counter.fetch_add(1, Ordering::SeqCst); }),
        );

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"ALARM: hard limit\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        host.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fault_seen.load(Ordering::SeqCst), 1);
        host.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (host, _listener) = loopback_host().await;
        host.start().unwrap();
        assert!(matches!(host.start(), Err(HostError::AlreadyStarted)));
        host.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_fails() {
        let (host, _listener) = loopback_host().await;
        assert!(matches!(host.stop(Duration::from_secs(1)).await, Err(HostError::NotStarted)));
    }

    #[tokio::test]
    async fn invalid_timeouts_are_rejected() {
        let (host, _listener) = loopback_host().await;
        assert!(matches!(host.set_write_timeout(Duration::ZERO), Err(HostError::InvalidTimeout { .. })));
        assert!(matches!(host.set_online_timeout(Duration::ZERO), Err(HostError::InvalidTimeout { .. })));
        assert!(matches!(host.set_poll_timeout(Duration::ZERO), Err(HostError::InvalidTimeout { .. })));
    }
}
