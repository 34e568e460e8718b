// Serial transport for the stage controller
//
// Owns the single serial connection. Every command (write) and every query
// (write + read) runs under one mutex so that bytes from two callers never
// interleave on the wire; the protocol carries no message ids.

use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::error::{Result, StageError};
use crate::config::TERMINATOR;

/// Byte-level access to the device, implemented by the real serial port and by test doubles
pub trait SerialLink: Send {
    /// Write all bytes; fails if the write timeout expires first
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read until `terminator` (inclusive) or until the read timeout expires,
    /// returning whatever arrived
    fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>>;

    /// Drop any unsolicited input still sitting in the receive buffer
    fn clear_input(&mut self) -> io::Result<()>;
}

/// [`SerialLink`] over a `serialport` handle
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialPortLink {
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> serialport::Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(timeout)
            .open()?;

        Ok(Self { port, timeout })
    }
}

impl SerialLink for SerialPortLink {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>> {
        // The port timeout applies per read call, so bound the whole line too
        let deadline = Instant::now() + self.timeout;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        while Instant::now() < deadline {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == terminator {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }

        Ok(line)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Windows device names are case-insensitive and conventionally upper-case;
/// filesystem paths are left alone
pub fn normalize_port_name(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        port.to_uppercase()
    }
}

/// Shared, lock-protected connection to the stage controller
pub struct Transport {
    link: Mutex<Option<Box<dyn SerialLink>>>,
    terminator: char,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// A closed transport
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            terminator: TERMINATOR,
        }
    }

    /// A transport already connected through `link`
    pub fn with_link(link: Box<dyn SerialLink>) -> Self {
        let transport = Self::new();
        transport.attach(link);
        transport
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn SerialLink>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the serial port, replacing any existing connection
    pub fn try_open(&self, port: &str, baudrate: u32, timeout: Duration) -> Result<()> {
        let port = normalize_port_name(port);
        info!("Opening stage serial port {} at {} baud", port, baudrate);
        let link = SerialPortLink::open(&port, baudrate, timeout)?;
        self.attach(Box::new(link));
        Ok(())
    }

    /// Open the serial port; on failure the transport stays closed and `false` is returned
    pub fn open(&self, port: &str, baudrate: u32, timeout: Duration) -> bool {
        match self.try_open(port, baudrate, timeout) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to make a serial connection to {}: {}", port, e);
                self.close();
                false
            }
        }
    }

    /// Install an already-open link
    pub fn attach(&self, link: Box<dyn SerialLink>) {
        *self.lock() = Some(link);
    }

    /// Close the connection. Safe to call when already closed.
    pub fn close(&self) {
        if self.lock().take().is_some() {
            info!("Closed stage serial port");
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn frame(&self, text: &str) -> Result<String> {
        if !text.is_ascii() {
            return Err(StageError::Communication(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("command {text:?} is not ASCII"),
            )));
        }
        let mut framed = text.to_string();
        if !framed.ends_with(self.terminator) {
            framed.push(self.terminator);
        }
        Ok(framed)
    }

    /// Write a command without waiting for a response
    pub fn send_command(&self, command: &str) -> Result<()> {
        let framed = self.frame(command)?;

        let mut guard = self.lock();
        let link = guard.as_mut().ok_or(StageError::NotConnected)?;
        link.write_bytes(framed.as_bytes())?;
        drop(guard);

        debug!("Command: {:?}", framed.trim_end());
        Ok(())
    }

    /// Write a query and read one terminated response line
    ///
    /// Stale input is discarded first. The write and the read happen under the
    /// same lock. A read timeout yields the partial (possibly empty) line.
    pub fn send_query(&self, query: &str) -> Result<String> {
        let framed = self.frame(query)?;

        let raw = {
            let mut guard = self.lock();
            let link = guard.as_mut().ok_or(StageError::NotConnected)?;
            link.clear_input()?;
            link.write_bytes(framed.as_bytes())?;
            link.read_until(self.terminator as u8)?
        };

        let response = String::from_utf8(raw)
            .ok()
            .filter(|s| s.is_ascii())
            .ok_or_else(|| {
                StageError::Communication(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non-ASCII response to {:?}", framed.trim_end()),
                ))
            })?;

        let response = response.trim().to_string();
        debug!("Query: {:?} -> {:?}", framed.trim_end(), response);
        Ok(response)
    }
}
