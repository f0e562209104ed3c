//! The live console session of a board and its `send`/`expect` primitives.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use hexplay::HexViewBuilder;
use log::{debug, log_enabled, trace, warn, Level::Trace};
use regex::Regex;

use super::transport::{Incoming, SerialTransport, SpawnedTransport, Transport};
use crate::board::{Board, ConsoleDescriptor};
use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// The text captured by a successful `expect`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Captures {
    /// Index of the pattern that matched, in the order given to `expect`.
    pub index: usize,
    /// Capture groups of the match. Group `0` is the whole match.
    pub groups: Vec<Option<String>>,
    /// Console output received before the match.
    pub before: String,
}
impl Captures {
    pub fn group(&self, i: usize) -> Option<&str> {
        self.groups.get(i).and_then(|g| g.as_deref())
    }
}

/// The result of waiting for a list of patterns on the console.
///
/// Timeouts and end of stream are ordinary outcomes rather than errors, the
/// caller decides what they mean.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    Matched(Captures),
    Timeout,
    Eof,
}
impl Outcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, Outcome::Matched(_))
    }

    pub fn captures(&self) -> Option<&Captures> {
        match self {
            Outcome::Matched(captures) => Some(captures),
            _ => None,
        }
    }
}
impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Matched(c) => write!(f, "matched pattern #{}", c.index),
            Outcome::Timeout => f.write_str("timeout"),
            Outcome::Eof => f.write_str("end of stream"),
        }
    }
}

/// The console session of one board.
///
/// Only one session can exist per board hostname in the process. The session
/// is released when dropped.
pub struct ConsoleSession {
    hostname: String,
    transport: Box<dyn Transport>,
    /// Received text not consumed by a match yet.
    buffer: String,
    /// Everything received and sent so far.
    transcript: String,
    /// Tail of a multibyte character split across two reads.
    undecoded: Vec<u8>,
}

impl ConsoleSession {
    /// Open a session for `hostname` over an already connected transport.
    pub fn open(hostname: &str, transport: Box<dyn Transport>) -> Result<Self> {
        let mut active = active_sessions().lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(hostname.to_owned()) {
            return Err(Error::critical(format!(
                "a console session for {} is already active",
                hostname
            )));
        }
        debug!("Console session opened for {}", hostname);
        Ok(ConsoleSession {
            hostname: hostname.to_owned(),
            transport,
            buffer: String::new(),
            transcript: String::new(),
            undecoded: Vec::new(),
        })
    }

    /// Connect to the console of `board` as described in its configuration.
    pub fn connect(board: &Board) -> Result<Self> {
        let transport: Box<dyn Transport> = match &board.console {
            ConsoleDescriptor::Command { command } => Box::new(
                SpawnedTransport::spawn(command)
                    .map_err(|e| Error::critical(format!("cannot spawn `{}`: {}", command, e)))?,
            ),
            ConsoleDescriptor::Serial { path, baud_rate } => Box::new(
                SerialTransport::open(path, *baud_rate)
                    .map_err(|e| Error::critical(format!("cannot open {}: {}", path, e)))?,
            ),
        };
        Self::open(&board.hostname, transport)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Send `text` followed by a newline.
    pub fn send_line(&mut self, text: &str) -> Result<()> {
        debug!("[{}] > {}", self.hostname, text);
        self.transcript.push_str(text);
        self.transcript.push('\n');
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.transport
            .send(&line)
            .map_err(|e| Error::critical(format!("console write failed: {}", e)))
    }

    /// Send a control character, e.g. `send_control('c')` for `Ctrl+C`.
    pub fn send_control(&mut self, key: char) -> Result<()> {
        let byte = (key.to_ascii_lowercase() as u8) & 0x1f;
        debug!("[{}] > ^{}", self.hostname, key.to_ascii_uppercase());
        self.transport
            .send(&[byte])
            .map_err(|e| Error::critical(format!("console write failed: {}", e)))
    }

    /// Block until one of `patterns` matches the console output, or until
    /// `timeout` expires, or until the connection is closed.
    ///
    /// When several patterns match, the one matching earliest in the output
    /// wins, ties going to the first pattern in the list. The output up to the
    /// end of the match is consumed. On timeout nothing is consumed and the
    /// session stays usable.
    pub fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Outcome {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(captures) = self.search(patterns) {
                trace!("[{}] matched pattern #{}", self.hostname, captures.index);
                return Outcome::Matched(captures);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "[{}] timeout after {:?} waiting for {:?}",
                    self.hostname, timeout, patterns
                );
                return Outcome::Timeout;
            }

            match self.transport.receive(deadline - now) {
                Ok(Incoming::Data(data)) => self.feed(&data),
                Ok(Incoming::Idle) => {}
                Ok(Incoming::Closed) => {
                    debug!("[{}] console connection closed", self.hostname);
                    return self.search(patterns).map_or(Outcome::Eof, Outcome::Matched);
                }
                Err(e) => {
                    warn!("[{}] console read failed: {}", self.hostname, e);
                    return Outcome::Eof;
                }
            }
        }
    }

    /// Everything exchanged on this session so far.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Forget received output not consumed by a match yet.
    pub fn discard_pending(&mut self) {
        self.buffer.clear();
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        debug!("Console session closed for {}", self.hostname);
        let mut active = active_sessions().lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.hostname);
    }
}

impl fmt::Debug for ConsoleSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSession")
            .field("hostname", &self.hostname)
            .field("pending", &self.buffer.len())
            .finish()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Hostnames of the boards with an open session.
fn active_sessions() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

impl ConsoleSession {
    fn feed(&mut self, data: &[u8]) {
        // Dump the received data in a hex table for debugging
        if log_enabled!(Trace) {
            let view = HexViewBuilder::new(data)
                .address_offset(0)
                .row_width(16)
                .finish();
            trace!("[{}] received:\n{}", self.hostname, view);
        }
        self.undecoded.extend_from_slice(data);
        // Invalid bytes are decoded lossily, only a truncated sequence at the
        // end waits for the next read.
        let mut start = 0;
        let complete = loop {
            match std::str::from_utf8(&self.undecoded[start..]) {
                Ok(_) => break self.undecoded.len(),
                Err(e) => match e.error_len() {
                    Some(invalid) => start += e.valid_up_to() + invalid,
                    None => break start + e.valid_up_to(),
                },
            }
        };
        let tail = self.undecoded.split_off(complete);
        let text = String::from_utf8_lossy(&self.undecoded).into_owned();
        self.undecoded = tail;
        self.transcript.push_str(&text);
        self.buffer.push_str(&text);
    }

    fn search(&mut self, patterns: &[Regex]) -> Option<Captures> {
        let mut best: Option<(usize, usize, usize)> = None; // (start, end, index)
        for (index, pattern) in patterns.iter().enumerate() {
            if let Some(m) = pattern.find(&self.buffer) {
                if best.map_or(true, |(start, _, _)| m.start() < start) {
                    best = Some((m.start(), m.end(), index));
                }
            }
        }
        let (start, end, index) = best?;

        let groups = patterns[index]
            .captures_at(&self.buffer, start)
            .map(|caps| {
                caps.iter()
                    .map(|g| g.map(|g| g.as_str().to_owned()))
                    .collect()
            })
            .unwrap_or_default();
        let before = self.buffer[..start].to_owned();
        self.buffer.drain(..end);

        Some(Captures {
            index,
            groups,
            before,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
