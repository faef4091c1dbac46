//! Telnet console session manager.
//!
//! One session per node name, created lazily on first send and torn down by
//! explicit disconnect, idle sweep, or reader EOF. Each session owns a
//! background reader that filters telnet negotiation and ANSI sequences out
//! of the stream and appends cleaned text to a capped [`OutputBuffer`].
//!
//! Concurrency: a manager-level lock guards the name → slot map; each slot
//! is its own async mutex, so the dial happens off the map lock and
//! concurrent callers for the same node serialize on the slot — the first
//! caller dials, the rest find the installed session. At most one telnet
//! connection per node, under any interleaving.

#![forbid(unsafe_code)]

pub mod filter;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gns_proto::{OutputBuffer, ReadMode};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::filter::{TelnetParser, TextCleaner};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("console connect to {host}:{port} failed: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("console session for '{0}' lost its connection")]
    Disconnected(String),

    #[error("no console session for '{0}'")]
    SessionNotFound(String),

    #[error("pattern '{pattern}' not matched within {timeout_secs:.1}s")]
    PatternTimeout {
        pattern: String,
        timeout_secs: f64,
        /// Output that did arrive while waiting.
        partial: String,
    },

    #[error("invalid wait pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;

// ─── Tunables ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConsoleTunables {
    pub buffer_cap: usize,
    pub buffer_trim: usize,
    pub page_lines: usize,
    pub connect_timeout: Duration,
    /// Polling cadence for `send_and_wait`.
    pub poll_interval: Duration,
}

impl Default for ConsoleTunables {
    fn default() -> Self {
        Self {
            buffer_cap: gns_proto::buffer::DEFAULT_BUFFER_CAP,
            buffer_trim: gns_proto::buffer::DEFAULT_TRIM_TO,
            page_lines: gns_proto::buffer::DEFAULT_PAGE_LINES,
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

/// State shared between a session handle and its background reader.
struct SessionShared {
    buffer: Mutex<OutputBuffer>,
    connected: AtomicBool,
}

struct ConsoleSession {
    id: String,
    host: String,
    port: u16,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    shared: Arc<SessionShared>,
    reader: JoinHandle<()>,
    last_activity: Instant,
    opened_at: DateTime<Utc>,
}

impl ConsoleSession {
    async fn dial(
        node: &str,
        host: &str,
        port: u16,
        tunables: &ConsoleTunables,
    ) -> ConsoleResult<Self> {
        let stream = tokio::time::timeout(tunables.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConsoleError::ConnectionFailed {
                host: host.to_string(),
                port,
                reason: format!("connect timed out after {:?}", tunables.connect_timeout),
            })?
            .map_err(|e| ConsoleError::ConnectionFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(AsyncMutex::new(write_half));
        let shared = Arc::new(SessionShared {
            buffer: Mutex::new(OutputBuffer::new(
                tunables.buffer_cap,
                tunables.buffer_trim,
                tunables.page_lines,
            )),
            connected: AtomicBool::new(true),
        });

        let reader = tokio::spawn(reader_loop(
            read_half,
            writer.clone(),
            shared.clone(),
            node.to_string(),
        ));

        let session = Self {
            id: Uuid::new_v4().to_string(),
            host: host.to_string(),
            port,
            writer,
            shared,
            reader,
            last_activity: Instant::now(),
            opened_at: Utc::now(),
        };
        info!(node, host, port, session = %session.id, "console connected");
        Ok(session)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn write(&mut self, node: &str, data: &[u8]) -> ConsoleResult<()> {
        let mut w = self.writer.lock().await;
        match w.write_all(data).await {
            Ok(()) => {
                w.flush().await.ok();
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.shared.connected.store(false, Ordering::SeqCst);
                debug!(node, error = %e, "console write failed");
                Err(ConsoleError::Disconnected(node.to_string()))
            }
        }
    }

    async fn shutdown(self) {
        self.reader.abort();
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    shared: Arc<SessionShared>,
    node: String,
) {
    let mut parser = TelnetParser::new();
    let mut cleaner = TextCleaner::new();
    let mut raw = [0u8; 4096];

    loop {
        match read_half.read(&mut raw).await {
            Ok(0) => break,
            Ok(n) => {
                let mut data = Vec::with_capacity(n);
                let mut replies = Vec::new();
                parser.push(&raw[..n], &mut data, &mut replies);
                if !replies.is_empty() {
                    let mut w = writer.lock().await;
                    let _ = w.write_all(&replies).await;
                }
                let text = cleaner.push(&data);
                if !text.is_empty() {
                    shared.buffer.lock().append(&text);
                }
            }
            Err(e) => {
                debug!(node = %node, error = %e, "console read error");
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    debug!(node = %node, "console reader finished");
}

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleStatus {
    pub node_name: String,
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub buffer_bytes: usize,
    /// Bytes a diff read would return right now.
    pub pending_bytes: usize,
    pub idle_secs: u64,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub session_id: String,
    pub bytes_sent: usize,
    /// True when this call dialed (or re-dialed) the console.
    pub connected_now: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitOutcome {
    pub session_id: String,
    /// Everything the peer produced between the send and the match.
    pub output: String,
    /// The region the pattern matched.
    pub matched: String,
    pub elapsed_secs: f64,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

struct SlotState {
    session: Option<ConsoleSession>,
}

type Slot = Arc<AsyncMutex<SlotState>>;

pub struct ConsoleManager {
    slots: AsyncMutex<HashMap<String, Slot>>,
    tunables: ConsoleTunables,
}

impl ConsoleManager {
    pub fn new(tunables: ConsoleTunables) -> Self {
        Self {
            slots: AsyncMutex::new(HashMap::new()),
            tunables,
        }
    }

    /// Send raw bytes, auto-connecting (or re-connecting) as needed.
    pub async fn send(
        &self,
        node: &str,
        host: &str,
        port: u16,
        data: &[u8],
    ) -> ConsoleResult<SendOutcome> {
        let slot = self.slot_for(node).await;
        let mut state = slot.lock().await;
        let connected_now = self.ensure_session(&mut state, node, host, port).await?;
        let session = state.session.as_mut().expect("session installed above");
        session.write(node, data).await?;
        Ok(SendOutcome {
            session_id: session.id.clone(),
            bytes_sent: data.len(),
            connected_now,
        })
    }

    /// Read from the session buffer. Requires an existing session; a session
    /// closed by the sweeper comes back on the next `send`, not on read.
    pub async fn read(&self, node: &str, mode: ReadMode) -> ConsoleResult<String> {
        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| ConsoleError::SessionNotFound(node.to_string()))?;
        let mut state = slot.lock().await;
        let session = state
            .session
            .as_mut()
            .ok_or_else(|| ConsoleError::SessionNotFound(node.to_string()))?;
        session.last_activity = Instant::now();
        Ok(session.shared.buffer.lock().read(mode))
    }

    /// Write, then poll the buffer until `pattern` matches or the timeout
    /// elapses. The matched region is consumed for subsequent diff reads.
    pub async fn send_and_wait(
        &self,
        node: &str,
        host: &str,
        port: u16,
        data: &[u8],
        pattern: &str,
        timeout: Duration,
    ) -> ConsoleResult<WaitOutcome> {
        let re = Regex::new(pattern)?;
        let slot = self.slot_for(node).await;
        let mut state = slot.lock().await;
        self.ensure_session(&mut state, node, host, port).await?;
        let session = state.session.as_mut().expect("session installed above");

        let start_stream = session.shared.buffer.lock().stream_len();
        session.write(node, data).await?;

        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            {
                let mut buf = session.shared.buffer.lock();
                let found = {
                    let hay = buf.slice_from_stream(start_stream);
                    re.find(hay)
                        .map(|m| (m.end(), hay[..m.end()].to_string(), m.as_str().to_string()))
                };
                if let Some((end, output, matched)) = found {
                    buf.consume_to_stream(start_stream + end);
                    drop(buf);
                    session.last_activity = Instant::now();
                    return Ok(WaitOutcome {
                        session_id: session.id.clone(),
                        output,
                        matched,
                        elapsed_secs: started.elapsed().as_secs_f64(),
                    });
                }
            }
            if Instant::now() >= deadline {
                let partial = session
                    .shared
                    .buffer
                    .lock()
                    .slice_from_stream(start_stream)
                    .to_string();
                return Err(ConsoleError::PatternTimeout {
                    pattern: pattern.to_string(),
                    timeout_secs: timeout.as_secs_f64(),
                    partial,
                });
            }
            if !session.is_connected() {
                return Err(ConsoleError::Disconnected(node.to_string()));
            }
            tokio::time::sleep(self.tunables.poll_interval).await;
        }
    }

    /// Snapshot the whole buffer without touching the diff offset or the
    /// activity clock. Resource browsing must have no side effects.
    pub async fn peek(&self, node: &str) -> ConsoleResult<String> {
        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| ConsoleError::SessionNotFound(node.to_string()))?;
        let state = slot.lock().await;
        let session = state
            .session
            .as_ref()
            .ok_or_else(|| ConsoleError::SessionNotFound(node.to_string()))?;
        Ok(session.shared.buffer.lock().snapshot().to_string())
    }

    pub async fn status(&self, node: &str) -> ConsoleResult<ConsoleStatus> {
        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| ConsoleError::SessionNotFound(node.to_string()))?;
        let state = slot.lock().await;
        let session = state
            .session
            .as_ref()
            .ok_or_else(|| ConsoleError::SessionNotFound(node.to_string()))?;
        Ok(Self::status_of(node, session))
    }

    pub async fn status_all(&self) -> Vec<ConsoleStatus> {
        let slots: Vec<(String, Slot)> = {
            let map = self.slots.lock().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut out = Vec::new();
        for (name, slot) in slots {
            let state = slot.lock().await;
            if let Some(session) = state.session.as_ref() {
                out.push(Self::status_of(&name, session));
            }
        }
        out.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        out
    }

    /// Explicit teardown. Returns false when no session existed.
    pub async fn disconnect(&self, node: &str) -> ConsoleResult<bool> {
        let slot = {
            let mut map = self.slots.lock().await;
            map.remove(node)
        };
        let Some(slot) = slot else {
            return Ok(false);
        };
        let mut state = slot.lock().await;
        if let Some(session) = state.session.take() {
            info!(node, session = %session.id, "console disconnected");
            session.shutdown().await;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Close every session; returns how many were open.
    pub async fn disconnect_all(&self) -> usize {
        let slots: Vec<Slot> = {
            let mut map = self.slots.lock().await;
            map.drain().map(|(_, v)| v).collect()
        };
        let mut closed = 0;
        for slot in slots {
            let mut state = slot.lock().await;
            if let Some(session) = state.session.take() {
                session.shutdown().await;
                closed += 1;
            }
        }
        closed
    }

    /// Close sessions idle past `idle_timeout` (and any whose reader died).
    /// Sessions mid-operation hold their slot lock and are skipped — they
    /// are by definition not idle.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let slots: Vec<(String, Slot)> = {
            let map = self.slots.lock().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut closed = Vec::new();
        for (name, slot) in slots {
            let Ok(mut state) = slot.try_lock() else {
                continue;
            };
            let evict = match state.session.as_ref() {
                Some(s) => !s.is_connected() || s.last_activity.elapsed() >= idle_timeout,
                None => false,
            };
            if evict {
                if let Some(session) = state.session.take() {
                    info!(node = %name, session = %session.id, "closing idle console session");
                    session.shutdown().await;
                    closed.push(name);
                }
            }
        }

        if !closed.is_empty() {
            let mut map = self.slots.lock().await;
            for name in &closed {
                let empty = match map.get(name) {
                    Some(slot) => slot
                        .try_lock()
                        .map(|state| state.session.is_none())
                        .unwrap_or(false),
                    None => false,
                };
                if empty {
                    map.remove(name);
                }
            }
        }
        closed
    }

    pub async fn session_count(&self) -> usize {
        let slots: Vec<Slot> = {
            let map = self.slots.lock().await;
            map.values().cloned().collect()
        };
        let mut count = 0;
        for slot in slots {
            if let Ok(state) = slot.try_lock() {
                if state.session.is_some() {
                    count += 1;
                }
            } else {
                // Busy slot implies a live session.
                count += 1;
            }
        }
        count
    }

    // ── internals ─────────────────────────────────────────────────────────

    async fn slot_for(&self, node: &str) -> Slot {
        let mut map = self.slots.lock().await;
        map.entry(node.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(SlotState { session: None })))
            .clone()
    }

    async fn existing_slot(&self, node: &str) -> Option<Slot> {
        self.slots.lock().await.get(node).cloned()
    }

    /// Install a live session in the slot if one is not already there.
    /// Returns true when this call dialed.
    async fn ensure_session(
        &self,
        state: &mut SlotState,
        node: &str,
        host: &str,
        port: u16,
    ) -> ConsoleResult<bool> {
        if let Some(session) = state.session.as_ref() {
            if session.is_connected() {
                return Ok(false);
            }
            warn!(node, "console session is stale, re-dialing");
        }
        if let Some(stale) = state.session.take() {
            stale.shutdown().await;
        }
        state.session = Some(ConsoleSession::dial(node, host, port, &self.tunables).await?);
        Ok(true)
    }

    fn status_of(node: &str, session: &ConsoleSession) -> ConsoleStatus {
        let buf = session.shared.buffer.lock();
        ConsoleStatus {
            node_name: node.to_string(),
            session_id: session.id.clone(),
            host: session.host.clone(),
            port: session.port,
            connected: session.is_connected(),
            buffer_bytes: buf.len(),
            pending_bytes: buf.pending(),
            idle_secs: session.last_activity.elapsed().as_secs(),
            opened_at: session.opened_at,
        }
    }
}

impl Default for ConsoleManager {
    fn default() -> Self {
        Self::new(ConsoleTunables::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A telnet peer that emits a prompt on connect and echoes a prompt
    /// after every newline received.
    async fn spawn_echo_peer() -> (std::net::SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = stream.write_all(b"alpine:~# ").await;
                    let mut buf = [0u8; 256];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if buf[..n].contains(&b'\n') {
                                    let _ = stream.write_all(b"\r\nalpine:~# ").await;
                                }
                            }
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    fn test_tunables() -> ConsoleTunables {
        ConsoleTunables {
            connect_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            ..ConsoleTunables::default()
        }
    }

    async fn wait_for_output(mgr: &ConsoleManager, node: &str) {
        for _ in 0..100 {
            if let Ok(status) = mgr.status(node).await {
                if status.buffer_bytes > 0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no console output arrived");
    }

    #[tokio::test]
    async fn test_send_connects_and_diff_reads() {
        let (addr, accepted) = spawn_echo_peer().await;
        let mgr = ConsoleManager::new(test_tunables());

        let outcome = mgr
            .send("R1", &addr.ip().to_string(), addr.port(), b"")
            .await
            .expect("send");
        assert!(outcome.connected_now);
        wait_for_output(&mgr, "R1").await;

        assert_eq!(mgr.read("R1", ReadMode::Diff).await.expect("read"), "alpine:~# ");
        // No new output → empty second diff.
        assert_eq!(mgr.read("R1", ReadMode::Diff).await.expect("read"), "");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prompt_echo_is_normalized() {
        let (addr, _) = spawn_echo_peer().await;
        let mgr = ConsoleManager::new(test_tunables());
        let host = addr.ip().to_string();

        mgr.send("R1", &host, addr.port(), b"").await.expect("send");
        wait_for_output(&mgr, "R1").await;
        mgr.read("R1", ReadMode::Diff).await.expect("read");

        mgr.send("R1", &host, addr.port(), b"\n").await.expect("send");
        // Poll until the echoed prompt lands.
        for _ in 0..100 {
            let status = mgr.status("R1").await.expect("status");
            if status.pending_bytes > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let diff = mgr.read("R1", ReadMode::Diff).await.expect("read");
        assert_eq!(diff, "\nalpine:~# ");
    }

    #[tokio::test]
    async fn test_concurrent_sends_share_one_connection() {
        let (addr, accepted) = spawn_echo_peer().await;
        let mgr = Arc::new(ConsoleManager::new(test_tunables()));
        let host = addr.ip().to_string();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let mgr = mgr.clone();
            let host = host.clone();
            handles.push(tokio::spawn(async move {
                mgr.send("R1", &host, addr.port(), b"\n").await
            }));
        }
        for h in handles {
            h.await.expect("join").expect("send");
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_and_wait_matches_prompt() {
        let (addr, _) = spawn_echo_peer().await;
        let mgr = ConsoleManager::new(test_tunables());

        let outcome = mgr
            .send_and_wait(
                "R1",
                &addr.ip().to_string(),
                addr.port(),
                b"\n",
                r"alpine:~# $",
                Duration::from_secs(2),
            )
            .await
            .expect("wait");
        assert!(outcome.matched.contains("alpine"));
    }

    #[tokio::test]
    async fn test_send_and_wait_times_out() {
        let (addr, _) = spawn_echo_peer().await;
        let mgr = ConsoleManager::new(test_tunables());

        let started = Instant::now();
        let err = mgr
            .send_and_wait(
                "R1",
                &addr.ip().to_string(),
                addr.port(),
                b"\n",
                r"NEVER_APPEARS",
                Duration::from_millis(200),
            )
            .await
            .expect_err("timeout");
        assert!(matches!(err, ConsoleError::PatternTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_disconnect_then_send_redials() {
        let (addr, accepted) = spawn_echo_peer().await;
        let mgr = ConsoleManager::new(test_tunables());
        let host = addr.ip().to_string();

        let first = mgr.send("R1", &host, addr.port(), b"").await.expect("send");
        assert!(mgr.disconnect("R1").await.expect("disconnect"));
        assert!(mgr.status("R1").await.is_err());

        let second = mgr.send("R1", &host, addr.port(), b"").await.expect("send");
        assert!(second.connected_now);
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_sessions() {
        let (addr, _) = spawn_echo_peer().await;
        let mgr = ConsoleManager::new(test_tunables());

        mgr.send("R2", &addr.ip().to_string(), addr.port(), b"")
            .await
            .expect("send");
        assert_eq!(mgr.session_count().await, 1);

        // Nothing idle yet under a generous timeout.
        assert!(mgr.sweep_idle(Duration::from_secs(60)).await.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let closed = mgr.sweep_idle(Duration::from_millis(10)).await;
        assert_eq!(closed, vec!["R2".to_string()]);
        assert_eq!(mgr.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_read_without_session_fails() {
        let mgr = ConsoleManager::new(test_tunables());
        let err = mgr.read("ghost", ReadMode::Diff).await.expect_err("no session");
        assert!(matches!(err, ConsoleError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connection_failed() {
        let mgr = ConsoleManager::new(test_tunables());
        // Port 1 on localhost is practically never listening.
        let err = mgr.send("R1", "127.0.0.1", 1, b"x").await.expect_err("refused");
        assert!(matches!(err, ConsoleError::ConnectionFailed { .. }));
    }
}
