//! In-memory serial ports for tests.
//!
//! A [`FakeSerialPort`] is a pair of byte queues shared between all of its clones:
//! the test pushes what the device "sends" and inspects what the host wrote. A
//! [`Responder`] can be attached to script a device that answers every write.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{PortInfo, PortLister, SerialError, SerialLink, SerialSettings};

/// Produces the device's reply to every chunk written to a [`FakeSerialPort`].
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct State {
    input: VecDeque<u8>,
    output: Vec<u8>,
    write_attempts: Vec<Vec<u8>>,
    responder: Option<Responder>,
    fail_writes: bool,
    input_clears: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    input_ready: Condvar,
    open_handles: AtomicUsize,
}

/// A scripted serial device.
#[derive(Clone)]
pub struct FakeSerialPort {
    name: String,
    shared: Arc<Shared>,
    timeout: Duration,
}

impl fmt::Debug for FakeSerialPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeSerialPort")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FakeSerialPort {
    /// Creates a silent device.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::default(),
            timeout: Duration::ZERO,
        }
    }

    /// Creates a device which answers every write with the responder's output.
    pub fn with_responder(
        name: impl Into<String>,
        responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    ) -> Self {
        let port = Self::new(name);
        port.shared.state.lock().responder = Some(Box::new(responder));
        port
    }

    /// The device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues bytes as if the device had sent them.
    pub fn push_input(&self, data: &[u8]) {
        self.shared.state.lock().input.extend(data);
        self.shared.input_ready.notify_all();
    }

    /// Everything written successfully so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.shared.state.lock().output.clone()
    }

    /// Every write call made so far, including failed ones.
    pub fn write_attempts(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().write_attempts.clone()
    }

    /// Makes all following writes fail with a broken pipe.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.state.lock().fail_writes = fail;
    }

    /// How often pending input was discarded.
    pub fn input_clears(&self) -> usize {
        self.shared.state.lock().input_clears
    }

    /// Number of links handed out by a [`FakeLister`] that are still open.
    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }

    fn handle(&self, timeout: Duration) -> FakeLink {
        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);
        let mut port = self.clone();
        port.timeout = timeout;
        FakeLink { port }
    }
}

impl Read for FakeSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.state.lock();

        while state.input.is_empty() {
            if self
                .shared
                .input_ready
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.input.is_empty()
            {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
        }

        let count = buf.len().min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..count)) {
            *slot = byte;
        }

        Ok(count)
    }
}

impl Write for FakeSerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        state.write_attempts.push(buf.to_vec());
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }

        state.output.extend_from_slice(buf);
        if let Some(responder) = state.responder.as_mut() {
            let reply = responder(buf);
            state.input.extend(reply);
        }
        drop(guard);

        self.shared.input_ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for FakeSerialPort {
    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        state.input.clear();
        state.input_clears += 1;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(self.handle(self.timeout)))
    }
}

/// A counted handle on a [`FakeSerialPort`], as returned by [`FakeLister::open`].
struct FakeLink {
    port: FakeSerialPort,
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        self.port.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Read for FakeLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for FakeLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for FakeLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear_input()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout)
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        self.port.try_clone_link()
    }
}

type Opener = Box<dyn Fn(u32) -> io::Result<FakeSerialPort> + Send + Sync>;

/// Record of the open calls made on a [`FakeLister`], readable after the lister was moved.
#[derive(Debug, Clone, Default)]
pub struct OpenLog(Arc<Mutex<Vec<(String, u32)>>>);

impl OpenLog {
    /// Every successful or failed open attempt, as `(port, baud)`.
    pub fn attempts(&self) -> Vec<(String, u32)> {
        self.0.lock().clone()
    }
}

/// A port backend serving [`FakeSerialPort`]s.
///
/// Every port is registered with an opener that receives the requested baud rate,
/// so tests can simulate busy ports or devices that only answer at one speed.
#[derive(Default)]
pub struct FakeLister {
    ports: Vec<(String, Opener)>,
    opened: OpenLog,
}

impl fmt::Debug for FakeLister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeLister")
            .field(
                "ports",
                &self.ports.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FakeLister {
    /// Creates a backend without any ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a port.
    pub fn with_port(
        mut self,
        name: impl Into<String>,
        opener: impl Fn(u32) -> io::Result<FakeSerialPort> + Send + Sync + 'static,
    ) -> Self {
        self.ports.push((name.into(), Box::new(opener)));
        self
    }

    /// A handle on the log of open attempts.
    pub fn open_log(&self) -> OpenLog {
        self.opened.clone()
    }
}

impl PortLister for FakeLister {
    fn list(&self) -> Result<Vec<PortInfo>, SerialError> {
        Ok(self
            .ports
            .iter()
            .map(|(name, _)| PortInfo::new(name.clone()))
            .collect())
    }

    fn open(
        &self,
        port: &str,
        settings: SerialSettings,
    ) -> Result<Box<dyn SerialLink>, SerialError> {
        self.opened.0.lock().push((port.to_string(), settings.baud));

        let open_error = |source| SerialError::Open {
            port: port.to_string(),
            source,
        };

        let (_, opener) = self
            .ports
            .iter()
            .find(|(name, _)| name == port)
            .ok_or_else(|| open_error(io::Error::from(io::ErrorKind::NotFound)))?;

        let device = opener(settings.baud).map_err(open_error)?;

        Ok(Box::new(device.handle(settings.timeout)))
    }
}
