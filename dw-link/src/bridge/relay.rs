use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::serial::{is_timeout, SerialLink};

use super::diagnostics::DiagnosticScanner;
use super::{BridgeEvent, BridgeEvents};

/// How long a serial read blocks before the reader checks its stop flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

const READ_CHUNK_SIZE: usize = 1024;

/// Receives the bytes read from the serial port.
pub trait DataReceiver: Send {
    /// Called with every chunk read from the port.
    fn data_received(&mut self, data: &[u8]);

    /// Called once when reading fails for a reason other than a timeout.
    fn connection_lost(&mut self, _error: &io::Error) {}
}

/// The client currently bound to the serial reader.
///
/// At most one client is bound at a time. The reader only writes to the client
/// while holding the lock, so once [`clear`](Self::clear) returns the socket can
/// be closed without racing a forward.
#[derive(Debug, Clone, Default)]
pub struct ClientSlot {
    client: Arc<Mutex<Option<TcpStream>>>,
}

impl ClientSlot {
    /// Binds a client, returning the one it replaced.
    pub fn bind(&self, client: TcpStream) -> Option<TcpStream> {
        self.client.lock().replace(client)
    }

    /// Unbinds the client.
    pub fn clear(&self) -> Option<TcpStream> {
        self.client.lock().take()
    }

    /// Returns `true` if a client is bound.
    pub fn is_bound(&self) -> bool {
        self.client.lock().is_some()
    }

    /// Writes `data` to the bound client; returns `false` if none is bound.
    pub fn forward(&self, data: &[u8]) -> io::Result<bool> {
        match self.client.lock().as_mut() {
            Some(client) => client.write_all(data).map(|()| true),
            None => Ok(false),
        }
    }
}

/// Forwards serial output to the bound client and surfaces adapter messages.
pub struct SerialToNet {
    slot: ClientSlot,
    scanner: DiagnosticScanner,
    verbose: bool,
    events: Arc<BridgeEvents>,
}

impl SerialToNet {
    /// Creates a receiver forwarding to `slot`.
    pub fn new(slot: ClientSlot, verbose: bool, events: Arc<BridgeEvents>) -> Self {
        Self {
            slot,
            scanner: DiagnosticScanner::new(),
            verbose,
            events,
        }
    }
}

impl DataReceiver for SerialToNet {
    fn data_received(&mut self, data: &[u8]) {
        match self.slot.forward(data) {
            Ok(true) => tracing::trace!("serial -> net: {:?}", String::from_utf8_lossy(data)),
            Ok(false) => tracing::trace!("Dropping {} bytes, no client", data.len()),
            Err(e) => tracing::debug!("Forwarding to client failed: {e}"),
        }

        for frame in self.scanner.feed(data) {
            if frame.should_display(self.verbose) {
                self.events.emit(BridgeEvent::Diagnostic(frame));
            }
        }
    }

    fn connection_lost(&mut self, error: &io::Error) {
        tracing::error!("Serial port read failed: {error}");
    }
}

/// Background thread reading the serial port into a [`DataReceiver`].
///
/// The thread is stopped cooperatively: [`stop`](Self::stop) sets a flag that
/// the thread checks after every read timeout, then joins it.
#[derive(Debug)]
pub struct SerialReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SerialReader {
    /// Starts reading `link` on a new thread.
    pub fn spawn(
        mut link: Box<dyn SerialLink>,
        mut receiver: impl DataReceiver + 'static,
    ) -> io::Result<Self> {
        link.set_timeout(READ_POLL_INTERVAL)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_requested = stop.clone();

        let handle = thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || {
                let mut buffer = [0u8; READ_CHUNK_SIZE];

                while !stop_requested.load(Ordering::Acquire) {
                    match link.read(&mut buffer) {
                        Ok(0) => {}
                        Ok(n) => receiver.data_received(&buffer[..n]),
                        Err(e) if is_timeout(&e) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            receiver.connection_lost(&e);
                            break;
                        }
                    }
                }

                tracing::debug!("Serial reader stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Returns `true` while the thread is running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the thread to stop and waits for it.
    ///
    /// Returns `false` if the thread panicked.
    pub fn stop(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        self.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Closes a client connection, ignoring a peer that is already gone.
pub(super) fn close_client(client: TcpStream) {
    if let Err(e) = client.shutdown(Shutdown::Both) {
        tracing::trace!("Client shutdown: {e}");
    }
}
