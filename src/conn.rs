//! The persistent control channel towards spp-ctl.
//!
//! One nonblocking TCP connection carries plain-text requests in and JSON
//! responses out. Whatever bytes are available get appended to a growing
//! buffer from which one logical message is cut: a balanced `{...}` block
//! when the controller wraps its request in braces, a full line, or the
//! whole chunk. A lost connection is retried with a one second backoff.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::Result;

/// Pause between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Pause between retries of a partial nonblocking send.
const SEND_RETRY_DELAY: Duration = Duration::from_micros(100);

pub struct CtlConnection {
    ctl_ip: String,
    ctl_port: u16,
    sock: Option<TcpStream>,
    buf: Vec<u8>,
    last_attempt: Option<Instant>,
}

impl CtlConnection {
    pub fn new(ctl_ip: &str, ctl_port: u16) -> CtlConnection {
        CtlConnection {
            ctl_ip: ctl_ip.to_string(),
            ctl_port,
            sock: None,
            buf: Vec::new(),
            last_attempt: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sock.is_some()
    }

    /// Try to establish the connection, rate-limited by the backoff.
    fn connect(&mut self) -> bool {
        if self.sock.is_some() {
            return true;
        }
        if let Some(last) = self.last_attempt {
            if last.elapsed() < RECONNECT_BACKOFF {
                return false;
            }
        }
        self.last_attempt = Some(Instant::now());

        match TcpStream::connect((self.ctl_ip.as_str(), self.ctl_port)) {
            Ok(sock) => {
                if let Err(err) = sock.set_nonblocking(true) {
                    warn!("cannot make controller socket nonblocking: {}", err);
                    return false;
                }
                info!("connected to spp-ctl {}:{}", self.ctl_ip, self.ctl_port);
                self.sock = Some(sock);
                self.buf.clear();
                true
            }
            Err(err) => {
                debug!(
                    "connect to {}:{} failed: {}",
                    self.ctl_ip, self.ctl_port, err
                );
                false
            }
        }
    }

    fn drop_connection(&mut self) {
        warn!("connection to spp-ctl lost, will reconnect");
        self.sock = None;
        self.buf.clear();
    }

    /// Read whatever is available and cut one request out of the buffer.
    /// Returns None when no complete request arrived yet.
    pub fn poll_request(&mut self) -> Option<String> {
        if !self.connect() {
            return None;
        }

        let mut chunk = [0u8; 2048];
        loop {
            match self.sock.as_mut().unwrap().read(&mut chunk) {
                Ok(0) => {
                    self.drop_connection();
                    return None;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("controller read error: {}", err);
                    self.drop_connection();
                    return None;
                }
            }
        }

        extract_message(&mut self.buf)
    }

    /// Send one reply, retrying partial nonblocking writes.
    pub fn send_message(&mut self, msg: &str) -> Result<()> {
        if self.sock.is_none() {
            return Ok(());
        }

        let mut rest = msg.as_bytes();
        let mut lost: Option<io::Error> = None;
        while !rest.is_empty() {
            match self.sock.as_mut().unwrap().write(rest) {
                Ok(0) => break,
                Ok(n) => rest = &rest[n..],
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(SEND_RETRY_DELAY)
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    lost = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = lost {
            self.drop_connection();
            return Err(err.into());
        }
        Ok(())
    }
}

/// Cut one logical request off the front of `buf`.
///
/// A message starting with `{` must balance its braces (string literals and
/// escapes included) and yields the content inside the outer pair. Anything
/// else is taken whole, or up to a newline if one is present.
pub fn extract_message(buf: &mut Vec<u8>) -> Option<String> {
    let start = buf.iter().position(|b| !b.is_ascii_whitespace())?;

    if buf[start] == b'{' {
        let mut depth = 0usize;
        let mut in_str = false;
        let mut escaped = false;

        for (i, b) in buf.iter().enumerate().skip(start) {
            if in_str {
                if escaped {
                    escaped = false;
                } else if *b == b'\\' {
                    escaped = true;
                } else if *b == b'"' {
                    in_str = false;
                }
                continue;
            }
            match *b {
                b'"' => in_str = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let body = String::from_utf8_lossy(&buf[start + 1..i])
                            .trim()
                            .to_string();
                        buf.drain(..=i);
                        return Some(body);
                    }
                }
                _ => {}
            }
        }
        // unbalanced so far: keep buffering
        return None;
    }

    let end = buf
        .iter()
        .skip(start)
        .position(|b| *b == b'\n')
        .map(|i| start + i + 1)
        .unwrap_or(buf.len());
    let body = String::from_utf8_lossy(&buf[start..end]).trim().to_string();
    buf.drain(..end);
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}
