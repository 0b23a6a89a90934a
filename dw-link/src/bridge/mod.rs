//! TCP-to-serial bridge.
//!
//! The bridge makes the adapter reachable as a GDB remote target over TCP. It
//! accepts one client at a time and shuttles bytes both ways: the main thread
//! copies client data to the serial port, a [`SerialReader`] thread copies
//! serial data to whichever client is bound in the [`ClientSlot`].
//!
//! When a client goes away, the adapter is sent a detach packet so the target
//! is left running rather than halted in debugWIRE mode.

mod diagnostics;
mod relay;
mod startup;

pub use diagnostics::{DiagnosticFrame, DiagnosticScanner, Severity};
pub use relay::{ClientSlot, DataReceiver, SerialReader, SerialToNet};
pub use startup::{emulation_port, Companion, CompanionCommand, StartupMode};

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use crate::discovery::DiscoveryResult;
use crate::serial::{is_timeout, Lister, SerialEndpoint, SerialError, SerialSettings};

/// Default TCP port of the bridge.
pub const DEFAULT_LISTEN_PORT: u16 = 2000;

/// Packet sent to the adapter when a client disconnects.
pub const DETACH_PACKET: &[u8] = b"$D#44";

const LISTEN_BACKLOG: i32 = 1;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CLIENT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLIENT_BUFFER_SIZE: usize = 1024;
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

const KEEPALIVE_IDLE: Duration = Duration::from_secs(1);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const KEEPALIVE_PROBES: u32 = 3;

/// Errors of the bridge.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum BridgeError {
    /// Serial communication failed.
    Serial(#[from] SerialError),
    /// Could not listen on {address}.
    Listen {
        /// The address the bridge tried to bind.
        address: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// Accepting a client connection failed.
    Accept(#[source] io::Error),
    /// Could not start the serial reader thread.
    Reader(#[source] io::Error),
    /// Could not start companion program {program}.
    Companion {
        /// The program that failed to start.
        program: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// Invalid companion command line: {0:?}
    InvalidCompanion(String),
}

/// Whether the bridge serves one client or keeps accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Exit after the first client disconnects.
    #[default]
    SingleShot,
    /// Accept the next client after a disconnect.
    Persistent,
}

/// Settings of a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Address to listen on.
    pub bind_address: IpAddr,
    /// TCP port to listen on; `0` picks a free port.
    pub port: u16,
    /// Show every adapter console message instead of only the fatal ones.
    pub verbose: bool,
    /// What happens after a client disconnects.
    pub session_mode: SessionMode,
    /// Startup protocol.
    pub startup: StartupMode,
    /// Program started once the bridge listens.
    pub companion: Option<CompanionCommand>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_LISTEN_PORT,
            verbose: false,
            session_mode: SessionMode::default(),
            startup: StartupMode::default(),
            companion: None,
        }
    }
}

/// Why a client session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the connection.
    ClientClosed,
    /// Reading from the client failed.
    ClientError,
    /// Writing to the serial port failed.
    SerialError,
    /// The companion program terminated.
    CompanionExited,
    /// The bridge was interrupted.
    Interrupted,
}

/// Things the bridge reports while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The listening socket is bound.
    Listening(SocketAddr),
    /// A line of the startup protocol, see [`StartupMode::banners`].
    Banner(String),
    /// The bridge waits for the next client.
    Waiting(SocketAddr),
    /// A client connected.
    Connected(SocketAddr),
    /// The client session ended.
    Disconnected(DisconnectReason),
    /// The adapter sent a console message worth showing.
    Diagnostic(DiagnosticFrame),
    /// The companion program was started.
    CompanionStarted {
        /// The program.
        program: String,
        /// Its process id.
        pid: u32,
    },
}

/// Receives [`BridgeEvent`]s, from the main thread and the serial reader.
pub struct BridgeEvents {
    handler: Box<dyn Fn(BridgeEvent) + Send + Sync>,
}

impl BridgeEvents {
    /// Create a new `BridgeEvents` with a given `handler` to be called on events.
    pub fn new(handler: impl Fn(BridgeEvent) + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Emit a bridge event.
    pub fn emit(&self, event: BridgeEvent) {
        (self.handler)(event);
    }
}

impl Default for BridgeEvents {
    fn default() -> Self {
        Self::new(|_| {})
    }
}

impl std::fmt::Debug for BridgeEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BridgeEvents")
    }
}

/// A bridge between a TCP port and the adapter's serial port.
#[derive(Debug)]
pub struct BridgeServer {
    endpoint: SerialEndpoint,
    config: BridgeConfig,
    events: Arc<BridgeEvents>,
}

impl BridgeServer {
    /// Creates a bridge for an already open serial endpoint.
    pub fn new(endpoint: SerialEndpoint, config: BridgeConfig) -> Self {
        Self {
            endpoint,
            config,
            events: Arc::default(),
        }
    }

    /// Opens the serial port of a discovered adapter.
    pub fn open(
        lister: &Lister,
        adapter: &DiscoveryResult,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let settings = SerialSettings::new(adapter.baud, SERIAL_READ_TIMEOUT);
        let endpoint = SerialEndpoint::open(lister, &adapter.device, settings)?;

        Ok(Self::new(endpoint, config))
    }

    /// Reports events to the given handler.
    pub fn with_events(mut self, events: BridgeEvents) -> Self {
        self.events = Arc::new(events);
        self
    }

    /// Runs the bridge until the client disconnects, or until `interrupt` is set
    /// in persistent mode.
    pub fn run(self, interrupt: &AtomicBool) -> Result<(), BridgeError> {
        let BridgeServer {
            mut endpoint,
            config,
            events,
        } = self;

        let slot = ClientSlot::default();
        let reader = SerialReader::spawn(
            endpoint.try_clone_link()?,
            SerialToNet::new(slot.clone(), config.verbose, events.clone()),
        )
        .map_err(BridgeError::Reader)?;

        let result = serve(&mut endpoint, &config, &events, &slot, interrupt);

        if !reader.stop() {
            tracing::error!("Serial reader thread panicked");
        }
        endpoint.close();

        result
    }
}

fn serve(
    endpoint: &mut SerialEndpoint,
    config: &BridgeConfig,
    events: &BridgeEvents,
    slot: &ClientSlot,
    interrupt: &AtomicBool,
) -> Result<(), BridgeError> {
    let address = SocketAddr::new(config.bind_address, config.port);
    let listener =
        bind_listener(address).map_err(|source| BridgeError::Listen { address, source })?;
    let local = listener.local_addr().unwrap_or(address);

    tracing::info!("Listening on {local}");
    events.emit(BridgeEvent::Listening(local));
    for line in config.startup.banners(local.port()) {
        events.emit(BridgeEvent::Banner(line));
    }

    let mut companion = match (&config.companion, config.startup) {
        (Some(command), StartupMode::Plain) => {
            let companion = command.spawn()?;
            events.emit(BridgeEvent::CompanionStarted {
                program: command.program().to_string(),
                pid: companion.id(),
            });
            Some(companion)
        }
        (Some(_), StartupMode::Emulation) => {
            tracing::warn!("Ignoring companion program in OpenOCD emulation mode");
            None
        }
        (None, _) => None,
    };

    loop {
        events.emit(BridgeEvent::Waiting(local));

        let Some((client, peer)) = accept(&listener, interrupt)? else {
            return Ok(());
        };

        if let Err(e) = configure_client(&client) {
            tracing::warn!("Could not configure client socket: {e}");
        }

        let reason = relay(endpoint, slot, client, interrupt, companion.as_mut(), || {
            tracing::info!("Connected by {peer}");
            events.emit(BridgeEvent::Connected(peer));
        });

        tracing::info!("Disconnected: {reason:?}");
        events.emit(BridgeEvent::Disconnected(reason));

        if config.session_mode == SessionMode::SingleShot
            || matches!(
                reason,
                DisconnectReason::Interrupted | DisconnectReason::CompanionExited
            )
        {
            return Ok(());
        }
    }
}

/// Binds with `SO_REUSEADDR`, so a restarted bridge gets its port back at once.
fn bind_listener(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept(
    listener: &TcpListener,
    interrupt: &AtomicBool,
) -> Result<Option<(TcpStream, SocketAddr)>, BridgeError> {
    loop {
        if interrupt.load(Ordering::Relaxed) {
            return Ok(None);
        }

        match listener.accept() {
            Ok(connection) => return Ok(Some(connection)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(BridgeError::Accept(e)),
        }
    }
}

/// Low latency and fast dead-peer detection for the client socket.
fn configure_client(client: &TcpStream) -> io::Result<()> {
    client.set_nonblocking(false)?;
    client.set_read_timeout(Some(CLIENT_POLL_INTERVAL))?;
    client.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let keepalive = keepalive.with_interval(KEEPALIVE_INTERVAL);
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(KEEPALIVE_PROBES);

    SockRef::from(client).set_tcp_keepalive(&keepalive)
}

/// Binds the client, then copies its data to the serial port until the session ends.
fn relay(
    endpoint: &mut SerialEndpoint,
    slot: &ClientSlot,
    mut client: TcpStream,
    interrupt: &AtomicBool,
    mut companion: Option<&mut Companion>,
    on_bound: impl FnOnce(),
) -> DisconnectReason {
    match client.try_clone() {
        Ok(writer) => {
            if slot.bind(writer).is_some() {
                tracing::warn!("Replaced a client that was still bound");
            }
            on_bound();
        }
        Err(e) => {
            tracing::error!("Could not share the client socket: {e}");
            return end_session(endpoint, slot, client, DisconnectReason::ClientError);
        }
    }

    let mut buffer = [0u8; CLIENT_BUFFER_SIZE];
    let reason = loop {
        if interrupt.load(Ordering::Relaxed) {
            break DisconnectReason::Interrupted;
        }
        if companion.as_mut().is_some_and(|c| c.has_exited()) {
            break DisconnectReason::CompanionExited;
        }

        match client.read(&mut buffer) {
            Ok(0) => break DisconnectReason::ClientClosed,
            Ok(n) => {
                tracing::trace!("net -> serial: {:?}", String::from_utf8_lossy(&buffer[..n]));
                if let Err(e) = endpoint.write_all(&buffer[..n]) {
                    tracing::error!("Writing to {} failed: {e}", endpoint.device());
                    break DisconnectReason::SerialError;
                }
            }
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!("Client read failed: {e}");
                break DisconnectReason::ClientError;
            }
        }
    };

    end_session(endpoint, slot, client, reason)
}

/// Detaches the adapter, unbinds the client and closes its socket, in that order.
fn end_session(
    endpoint: &mut SerialEndpoint,
    slot: &ClientSlot,
    client: TcpStream,
    reason: DisconnectReason,
) -> DisconnectReason {
    if let Err(e) = endpoint.write_all(DETACH_PACKET).and_then(|()| endpoint.flush()) {
        tracing::warn!("Could not send detach to the adapter: {e}");
    }

    slot.clear();
    relay::close_client(client);

    reason
}
