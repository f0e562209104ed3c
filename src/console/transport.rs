//! Byte transports carrying a board console.

use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace};
use serialport::SerialPort;

use crate::utils::open_and_setup_port;

/// Maximum amount of data read from a transport in one go.
const CHUNK_SIZE: usize = 4096;

/// What a transport produced while waiting for incoming data.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Incoming {
    Data(Vec<u8>),
    /// Nothing arrived before the timeout expired.
    Idle,
    /// The other end is gone. Nothing will arrive anymore.
    Closed,
}

/// A bidirectional byte stream to a board console.
pub trait Transport: Send {
    /// Wait at most `timeout` for incoming data.
    fn receive(&mut self, timeout: Duration) -> io::Result<Incoming>;

    /// Write all of `data` to the console.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

// SpawnedTransport ============================================================

/// A console reached through a spawned connection command such as `telnet
/// localhost 7001` or `conmux-console panda01`.
///
/// The command output is read on a dedicated thread and handed over through a
/// channel, so that waiting for data can be bounded by a timeout.
pub struct SpawnedTransport {
    command: String,
    child: Child,
    stdin: ChildStdin,
    incoming: Receiver<Vec<u8>>,
}

impl SpawnedTransport {
    pub fn spawn(command: &str) -> io::Result<Self> {
        info!("Spawning console connection `{}`", command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdout"))?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut chunk = vec![0; CHUNK_SIZE];
            loop {
                match stdout.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) => {
                        debug!("console reader stopped: {}", e);
                        break;
                    }
                }
            }
            // Dropping the sender tells the session the connection is closed.
        });

        Ok(SpawnedTransport {
            command: command.to_owned(),
            child,
            stdin,
            incoming: rx,
        })
    }
}

impl Transport for SpawnedTransport {
    fn receive(&mut self, timeout: Duration) -> io::Result<Incoming> {
        match self.incoming.recv_timeout(timeout) {
            Ok(data) => Ok(Incoming::Data(data)),
            Err(RecvTimeoutError::Timeout) => Ok(Incoming::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(Incoming::Closed),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stdin.write_all(data)?;
        self.stdin.flush()
    }
}

impl Drop for SpawnedTransport {
    fn drop(&mut self) {
        debug!("Closing console connection `{}`", self.command);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl fmt::Debug for SpawnedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SpawnedTransport")
            .field(&self.command)
            .finish()
    }
}

// SerialTransport =============================================================

/// A console reached directly over a serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let port = open_and_setup_port(path, baud_rate)
            .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e.to_string()))?;
        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn receive(&mut self, timeout: Duration) -> io::Result<Incoming> {
        let deadline = Instant::now() + timeout;
        loop {
            // Reads over the serial port are not reliably blocking or
            // non-blocking. Only read what is already in the input buffer so
            // that `read` always returns immediately.
            let available = self
                .port
                .bytes_to_read()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
                as usize;
            trace!("Bytes available to read: {}", available);
            if available > 0 {
                let mut chunk = vec![0; std::cmp::min(available, CHUNK_SIZE)];
                let n = self.port.read(chunk.as_mut_slice())?;
                chunk.truncate(n);
                return Ok(Incoming::Data(chunk));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Incoming::Idle);
            }
            thread::sleep(std::cmp::min(deadline - now, Duration::from_millis(50)));
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = &self.port;
        debug_fmt_serialport!(port, f).finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn spawned_transport_reads_command_output() {
    let mut transport = SpawnedTransport::spawn("echo ready; cat").unwrap();
    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !String::from_utf8_lossy(&received).contains("ready") && Instant::now() < deadline {
        if let Incoming::Data(data) = transport.receive(Duration::from_millis(200)).unwrap() {
            received.extend(data);
        }
    }
    assert!(String::from_utf8_lossy(&received).contains("ready"));

    transport.send(b"ping\n").unwrap();
    let mut echoed = Vec::new();
    while !String::from_utf8_lossy(&echoed).contains("ping") && Instant::now() < deadline {
        if let Incoming::Data(data) = transport.receive(Duration::from_millis(200)).unwrap() {
            echoed.extend(data);
        }
    }
    assert!(String::from_utf8_lossy(&echoed).contains("ping"));
}

#[test]
fn spawned_transport_reports_closed() {
    let mut transport = SpawnedTransport::spawn("true").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match transport.receive(Duration::from_millis(100)).unwrap() {
            Incoming::Closed => break,
            _ => assert!(Instant::now() < deadline, "connection never closed"),
        }
    }
}
