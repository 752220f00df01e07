//! Newline-delimited JSON frames over a Unix stream.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{TimeoutId, Transport, TransportError, TransportEvent, WatchFlags, WatchId};
use crate::message::{self, error_names, Message};

const READ_WATCH: WatchId = WatchId(1);
const WRITE_WATCH: WatchId = WatchId(2);
const READ_CHUNK: usize = 4096;

/// Longest frame accepted from a peer, newline excluded.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

static NEXT_CONNECTION: AtomicU32 = AtomicU32::new(1);

/// Parse one frame (without its trailing newline).
pub fn decode_frame(frame: &[u8]) -> Result<Message, TransportError> {
    serde_json::from_slice(frame).map_err(|e| TransportError::Serialization(e.to_string()))
}

/// A transport over a connected Unix stream.
pub struct SocketTransport {
    stream: UnixStream,
    unique_name: String,
    next_serial: u32,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    inbox: VecDeque<Message>,
    events: Vec<TransportEvent>,
    /// serial -> armed reply timeout
    calls: HashMap<u32, TimeoutId>,
    timeouts: HashMap<TimeoutId, u32>,
    next_timeout: u32,
    write_enabled: bool,
    connected: bool,
    exit_on_disconnect: bool,
}

impl SocketTransport {
    pub fn new(stream: UnixStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        let unique_name = format!(
            ":{}.{}",
            std::process::id(),
            NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
        );
        debug!("Transport {} on fd {}", unique_name, fd);

        Ok(Self {
            stream,
            unique_name,
            next_serial: 1,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            inbox: VecDeque::new(),
            events: vec![
                TransportEvent::WatchAdded {
                    id: READ_WATCH,
                    fd,
                    flags: WatchFlags::READABLE,
                    enabled: true,
                },
                TransportEvent::WatchAdded {
                    id: WRITE_WATCH,
                    fd,
                    flags: WatchFlags::WRITABLE,
                    enabled: false,
                },
            ],
            calls: HashMap::new(),
            timeouts: HashMap::new(),
            next_timeout: 1,
            write_enabled: false,
            connected: true,
            exit_on_disconnect: true,
        })
    }

    /// Connect to a listening bus socket.
    pub fn connect(path: &Path) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path)
            .map_err(|e| TransportError::Connect(format!("{}: {}", path.display(), e)))?;
        Self::new(stream)
    }

    fn enqueue(&mut self, mut message: Message) -> Result<u32, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        message.serial = serial;
        if message.sender.is_none() {
            message.sender = Some(self.unique_name.clone());
        }

        let json = serde_json::to_vec(&message)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        self.write_buf.extend_from_slice(&json);
        self.write_buf.push(b'\n');
        Ok(serial)
    }

    /// Write as much buffered output as the socket takes.
    fn flush(&mut self) {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    self.disconnect();
                    return;
                }
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Write on {} failed: {}", self.unique_name, e);
                    self.disconnect();
                    return;
                }
            }
        }
        self.sync_write_interest();
    }

    fn sync_write_interest(&mut self) {
        let wanted = !self.write_buf.is_empty();
        if self.connected && wanted != self.write_enabled {
            self.write_enabled = wanted;
            self.events.push(TransportEvent::WatchToggled {
                id: WRITE_WATCH,
                enabled: wanted,
            });
        }
    }

    fn read_available(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.parse_frames();
                    self.disconnect();
                    return;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    if self.read_buf.len() > MAX_FRAME_LEN {
                        self.parse_frames();
                        if !self.connected {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Read on {} failed: {}", self.unique_name, e);
                    self.disconnect();
                    return;
                }
            }
        }
        self.parse_frames();
    }

    fn parse_frames(&mut self) {
        while let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.read_buf.drain(..=pos).collect();
            let frame = &line[..line.len() - 1];
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match decode_frame(frame) {
                Ok(message) => self.accept(message),
                Err(e) => warn!("Dropping undecodable frame on {}: {}", self.unique_name, e),
            }
        }

        if self.read_buf.len() > MAX_FRAME_LEN {
            warn!(
                "Peer on {} sent a frame over {} bytes, disconnecting",
                self.unique_name, MAX_FRAME_LEN
            );
            self.read_buf.clear();
            self.disconnect();
        }
    }

    fn accept(&mut self, message: Message) {
        if message.is_reply() {
            if let Some(reply_serial) = message.reply_serial {
                if let Some(id) = self.calls.remove(&reply_serial) {
                    self.timeouts.remove(&id);
                    self.events.push(TransportEvent::TimeoutRemoved { id });
                }
            }
        }
        self.inbox.push_back(message);
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.write_buf.clear();
        let _ = self.stream.shutdown(Shutdown::Both);

        self.events.push(TransportEvent::WatchRemoved { id: READ_WATCH });
        self.events.push(TransportEvent::WatchRemoved { id: WRITE_WATCH });

        let mut armed: Vec<(u32, TimeoutId)> = self.calls.drain().collect();
        armed.sort();
        self.timeouts.clear();
        for (serial, id) in armed {
            self.events.push(TransportEvent::TimeoutRemoved { id });
            self.inbox.push_back(Message::error_reply(
                serial,
                error_names::NO_REPLY,
                "Connection closed before a reply was received",
            ));
        }

        self.inbox.push_back(Message::signal(
            message::LOCAL_PATH,
            message::LOCAL_INTERFACE,
            message::DISCONNECTED,
        ));

        if self.exit_on_disconnect {
            info!("Connection {} lost, exiting", self.unique_name);
            std::process::exit(1);
        }
        info!("Connection {} lost", self.unique_name);
    }

    fn take_reply(&mut self, serial: u32) -> Option<Message> {
        let index = self
            .inbox
            .iter()
            .position(|m| m.is_reply() && m.reply_serial == Some(serial))?;
        self.inbox.remove(index)
    }

    /// Block for at most `limit` waiting for input, after pushing out any
    /// buffered output.
    fn wait_blocking(&mut self, limit: Duration) -> Result<(), TransportError> {
        self.stream.set_nonblocking(false)?;
        let result = self.read_blocking(limit);
        self.stream.set_read_timeout(None)?;
        self.stream.set_nonblocking(true)?;

        match result {
            Ok(0) => {
                self.parse_frames();
                self.disconnect();
            }
            Ok(_) => self.parse_frames(),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!("Blocking read on {} failed: {}", self.unique_name, e);
                self.disconnect();
            }
        }
        Ok(())
    }

    fn read_blocking(&mut self, limit: Duration) -> io::Result<usize> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf)?;
            self.write_buf.clear();
            self.sync_write_interest();
        }

        // A zero read timeout means "block forever".
        self.stream
            .set_read_timeout(Some(limit.max(Duration::from_millis(1))))?;
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk)?;
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

impl Transport for SocketTransport {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn send(&mut self, message: Message) -> Result<u32, TransportError> {
        let serial = self.enqueue(message)?;
        self.flush();
        Ok(serial)
    }

    fn send_with_reply(
        &mut self,
        message: Message,
        timeout: Duration,
    ) -> Result<u32, TransportError> {
        let serial = self.enqueue(message)?;

        let id = TimeoutId(self.next_timeout);
        self.next_timeout = self.next_timeout.wrapping_add(1).max(1);
        self.calls.insert(serial, id);
        self.timeouts.insert(id, serial);
        self.events.push(TransportEvent::TimeoutAdded {
            id,
            interval: timeout,
            enabled: true,
        });

        self.flush();
        Ok(serial)
    }

    fn send_with_reply_and_block(
        &mut self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let serial = self.enqueue(message)?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(reply) = self.take_reply(serial) {
                return Ok(reply);
            }
            if !self.connected {
                return Err(TransportError::Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Message::error_reply(
                    serial,
                    error_names::NO_REPLY,
                    "Did not receive a reply before the timeout expired",
                ));
            }
            self.wait_blocking(deadline - now)?;
        }
    }

    fn handle_watch(&mut self, id: WatchId, flags: WatchFlags) {
        if !self.connected {
            return;
        }
        if id == READ_WATCH && flags.contains(WatchFlags::READABLE) {
            self.read_available();
        } else if id == WRITE_WATCH && flags.contains(WatchFlags::WRITABLE) {
            self.flush();
        }
    }

    fn handle_timeout(&mut self, id: TimeoutId) {
        let Some(serial) = self.timeouts.remove(&id) else {
            return;
        };
        self.calls.remove(&serial);
        debug!("Call {} on {} timed out", serial, self.unique_name);
        self.events.push(TransportEvent::TimeoutRemoved { id });
        self.inbox.push_back(Message::error_reply(
            serial,
            error_names::NO_REPLY,
            "Did not receive a reply before the timeout expired",
        ));
    }

    fn pop_message(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    fn has_messages(&self) -> bool {
        !self.inbox.is_empty()
    }

    fn take_events(&mut self) -> Vec<TransportEvent> {
        std::mem::take(&mut self.events)
    }

    fn set_exit_on_disconnect(&mut self, exit: bool) {
        self.exit_on_disconnect = exit;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        self.exit_on_disconnect = false;
        self.disconnect();
        self.inbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::io::{BufRead, BufReader};

    fn pair() -> (SocketTransport, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let mut transport = SocketTransport::new(a).unwrap();
        transport.set_exit_on_disconnect(false);
        (transport, b)
    }

    #[test]
    fn test_announces_watches() {
        let (mut transport, _peer) = pair();
        let events = transport.take_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            TransportEvent::WatchAdded { id: READ_WATCH, enabled: true, .. }
        ));
        assert!(matches!(
            events[1],
            TransportEvent::WatchAdded { id: WRITE_WATCH, enabled: false, .. }
        ));
    }

    #[test]
    fn test_send_writes_one_line() {
        let (mut transport, peer) = pair();
        let call = Message::method_call("org.example", "/a", "org.example.I", "M");
        let serial = transport.send(call).unwrap();
        assert_eq!(serial, 1);

        let mut line = String::new();
        BufReader::new(peer).read_line(&mut line).unwrap();
        let received: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(received.serial, 1);
        assert_eq!(received.sender.as_deref(), Some(transport.unique_name()));
    }

    #[test]
    fn test_reply_disarms_timeout() {
        let (mut transport, mut peer) = pair();
        transport.take_events();
        let mut call = Message::method_call("org.example", "/a", "org.example.I", "M");
        let serial = transport
            .send_with_reply(call.clone(), Duration::from_secs(5))
            .unwrap();

        call.serial = serial;
        let reply = Message::method_return(&call);
        writeln!(peer, "{}", serde_json::to_string(&reply).unwrap()).unwrap();
        writeln!(peer, "not json").unwrap();

        transport.handle_watch(READ_WATCH, WatchFlags::READABLE);
        let events = transport.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::TimeoutRemoved { .. })));
        let received = transport.pop_message().unwrap();
        assert_eq!(received.reply_serial, Some(serial));
        assert!(transport.pop_message().is_none());
    }

    #[test]
    fn test_timeout_synthesizes_no_reply() {
        let (mut transport, _peer) = pair();
        transport.take_events();
        let call = Message::method_call("org.example", "/a", "org.example.I", "M");
        let serial = transport
            .send_with_reply(call, Duration::from_millis(10))
            .unwrap();
        let id = match transport.take_events().as_slice() {
            [TransportEvent::TimeoutAdded { id, .. }] => *id,
            other => panic!("unexpected events {:?}", other),
        };

        transport.handle_timeout(id);
        let reply = transport.pop_message().unwrap();
        assert_eq!(reply.reply_serial, Some(serial));
        assert_eq!(reply.error_name.as_deref(), Some(error_names::NO_REPLY));

        // A second firing is ignored.
        transport.handle_timeout(id);
        assert!(transport.pop_message().is_none());
    }

    #[test]
    fn test_hangup_synthesizes_disconnected() {
        let (mut transport, peer) = pair();
        transport.take_events();
        let call = Message::method_call("org.example", "/a", "org.example.I", "M");
        let serial = transport
            .send_with_reply(call, Duration::from_secs(5))
            .unwrap();
        drop(peer);

        transport.handle_watch(READ_WATCH, WatchFlags::READABLE);
        assert!(!transport.is_connected());

        let failed = transport.pop_message().unwrap();
        assert_eq!(failed.reply_serial, Some(serial));
        assert_eq!(failed.error_name.as_deref(), Some(error_names::NO_REPLY));

        let signal = transport.pop_message().unwrap();
        assert_eq!(signal.kind, MessageType::Signal);
        assert_eq!(signal.member.as_deref(), Some(message::DISCONNECTED));
        assert!(matches!(
            transport.send(Message::signal("/a", "org.example.I", "S")),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_overlong_frame_disconnects() {
        let (mut transport, mut peer) = pair();
        transport.take_events();
        peer.set_nonblocking(true).unwrap();

        let chunk = vec![b'x'; 64 * 1024];
        let mut sent = 0;
        while transport.is_connected() {
            assert!(sent <= 2 * MAX_FRAME_LEN, "peer was never cut off");
            match peer.write(&chunk) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
            transport.handle_watch(READ_WATCH, WatchFlags::READABLE);
        }

        assert!(!transport.is_connected());
        assert!(sent > MAX_FRAME_LEN);
        let signal = transport.pop_message().unwrap();
        assert_eq!(signal.member.as_deref(), Some(message::DISCONNECTED));
    }

    #[test]
    fn test_blocking_call_times_out() {
        let (mut transport, _peer) = pair();
        let call = Message::method_call("org.example", "/a", "org.example.I", "M");
        let reply = transport
            .send_with_reply_and_block(call, Duration::from_millis(20))
            .unwrap();
        assert_eq!(reply.error_name.as_deref(), Some(error_names::NO_REPLY));
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        assert!(decode_frame(b"{}").is_err());
        assert!(decode_frame(b"\xff").is_err());
        assert!(decode_frame(br#"{"type":"signal","path":"/a"}"#).is_ok());
    }
}
