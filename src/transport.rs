//! Byte sources the demultiplexer reads from.
//!
//! [`SerialSource`] drives the real bench. [`ScriptedSource`] is an in-memory stand-in
//! used by the tests and by capture replay: bytes can be delivered at once, or queued
//! as chunks that only show up at the next tick boundary or while a read is waiting.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use log::debug;
use serialport::SerialPort;

use crate::config::LinkConfig;
use crate::errors::Result;

/// Minimal view of an open link.
///
/// Reads never block longer than the source's short read timeout. A broken link is
/// reported as an I/O or serial error, never as an endless stream of empty reads.
pub trait ByteSource {
    /// Bytes already received and waiting to be read. `Ok(0)` when idle.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Fill `buf` as far as possible, waiting at most the read timeout for missing
    /// bytes. Returns how many bytes were written to `buf`.
    fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write and flush `bytes`.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
}

// ============================================================================
// Serial port
// ============================================================================

pub struct SerialSource {
    port: Box<dyn SerialPort>,
}

impl SerialSource {
    /// Open a serial port (e.g. `/dev/ttyACM0`, `COM4`) with the configured baud rate
    /// and read timeout.
    pub fn open(path: &str, config: &LinkConfig) -> Result<Self> {
        let port = serialport::new(path, config.baud_rate)
            .timeout(config.read_timeout())
            .open()?;
        debug!(
            "Opened {} at {} baud (read timeout {} ms)",
            path, config.baud_rate, config.read_timeout_ms
        );
        Ok(Self { port })
    }

    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Names of the serial ports currently present on the host.
    pub fn list_ports() -> Result<Vec<String>> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect())
    }
}

impl ByteSource for SerialSource {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    break
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }
}

// ============================================================================
// Scripted source
// ============================================================================

#[derive(Debug, Default)]
struct Script {
    arrived: VecDeque<u8>,
    scheduled: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    failure: Option<io::ErrorKind>,
}

impl Script {
    fn check(&self) -> Result<()> {
        match self.failure {
            Some(kind) => Err(io::Error::new(kind, "scripted link failure").into()),
            None => Ok(()),
        }
    }
}

/// Shared handle to an in-memory byte stream.
///
/// Clones share the same stream, so a test can keep one handle while the session
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    inner: Rc<RefCell<Script>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bytes` available immediately.
    pub fn deliver(&self, bytes: &[u8]) {
        self.inner.borrow_mut().arrived.extend(bytes.iter().copied());
    }

    /// Queue a chunk arriving later: at the next [`advance`](Self::advance), or
    /// earlier if a read is waiting for more bytes.
    pub fn schedule(&self, chunk: impl Into<Vec<u8>>) {
        self.inner.borrow_mut().scheduled.push_back(chunk.into());
    }

    /// Let the next scheduled chunk arrive. Returns `false` once nothing is queued.
    pub fn advance(&self) -> bool {
        let mut script = self.inner.borrow_mut();
        match script.scheduled.pop_front() {
            Some(chunk) => {
                script.arrived.extend(chunk);
                true
            }
            None => false,
        }
    }

    /// Bytes not yet consumed, arrived or still scheduled.
    pub fn remaining(&self) -> usize {
        let script = self.inner.borrow();
        script.arrived.len() + script.scheduled.iter().map(Vec::len).sum::<usize>()
    }

    /// Make every following call fail as if the device had been unplugged.
    pub fn fail(&self, kind: io::ErrorKind) {
        self.inner.borrow_mut().failure = Some(kind);
    }

    /// Everything written to the source so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.borrow().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.borrow_mut().written)
    }
}

impl ByteSource for ScriptedSource {
    fn bytes_available(&mut self) -> Result<usize> {
        let script = self.inner.borrow();
        script.check()?;
        Ok(script.arrived.len())
    }

    fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut script = self.inner.borrow_mut();
        script.check()?;
        let mut filled = 0;
        while filled < buf.len() {
            match script.arrived.pop_front() {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                // waiting: a scheduled chunk may land within the timeout
                None => match script.scheduled.pop_front() {
                    Some(chunk) => script.arrived.extend(chunk),
                    None => break,
                },
            }
        }
        Ok(filled)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut script = self.inner.borrow_mut();
        script.check()?;
        script.written.extend_from_slice(bytes);
        Ok(())
    }
}
