//! Cross-board synchronization.
//!
//! Board workers rendezvous through a hub of named, counted events. Each
//! secondary posts `"<name>_to_prim"` and waits on `"<name>_from_prim"`; the
//! primary collects all secondaries, merges the JSON payloads and posts the
//! merged dict back. Event counters are monotonic per event so a late poster
//! from a previous, timed-out round can never satisfy the current one.
//!
//! Workers in one process share an [`EventHub`] directly. Workers in
//! separate processes reach the same hub through a [`HubServer`] exposed on
//! TCP and per-worker [`RemoteHub`] connections; [`SyncLink`] runs the same
//! rendezvous over either transport via the [`EventBus`] trait. The wire
//! format is one versioned frame per request and response, a JSON body
//! behind a length prefix.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

/// Total rendezvous budget for one synchronization round.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack added when sleeping out the remainder of a failed round, so both
/// sides of a partial timeout re-enter the next round together.
pub const SYNC_TIME_MARGIN: Duration = Duration::from_millis(50);
/// Payload a peer posts when its own previous wait timed out.
pub const TIMEOUT_PAYLOAD: &str = "timeout!";

#[derive(Debug, Default)]
struct Slot {
    count: u64,
    payload: Value,
}

#[derive(Default)]
struct HubInner {
    slots: Mutex<HashMap<String, Slot>>,
    cond: Condvar,
}

/// Shared rendezvous hub; clone one handle per worker thread.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts `payload` under `event`, bumping its counter.
    pub fn post(&self, event: &str, payload: Value) -> u64 {
        let mut slots = self.inner.slots.lock();
        let slot = slots.entry(event.to_string()).or_default();
        slot.count += 1;
        slot.payload = payload;
        let count = slot.count;
        self.inner.cond.notify_all();
        count
    }

    /// Waits until `event` has been posted at least `min_count` times.
    /// Returns the payload of the latest post, or `None` on timeout.
    pub fn wait(&self, event: &str, min_count: u64, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.inner.slots.lock();
        loop {
            if let Some(slot) = slots.get(event) {
                if slot.count >= min_count {
                    return Some(slot.payload.clone());
                }
            }
            if self.inner.cond.wait_until(&mut slots, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Resets an event's counter, recovering from a desynchronized round.
    pub fn reset(&self, event: &str) {
        let mut slots = self.inner.slots.lock();
        slots.remove(event);
    }

    pub fn count(&self, event: &str) -> u64 {
        self.inner.slots.lock().get(event).map_or(0, |s| s.count)
    }
}

/// Transport a [`SyncLink`] rendezvouses over: the in-process [`EventHub`]
/// or a [`RemoteHub`] connection to a hub server in another process.
pub trait EventBus: Send {
    fn post(&self, event: &str, payload: &Value) -> io::Result<u64>;
    fn wait(&self, event: &str, min_count: u64, timeout: Duration) -> io::Result<Option<Value>>;
    fn reset(&self, event: &str) -> io::Result<()>;
}

impl EventBus for EventHub {
    fn post(&self, event: &str, payload: &Value) -> io::Result<u64> {
        Ok(EventHub::post(self, event, payload.clone()))
    }
    fn wait(&self, event: &str, min_count: u64, timeout: Duration) -> io::Result<Option<Value>> {
        Ok(EventHub::wait(self, event, min_count, timeout))
    }
    fn reset(&self, event: &str) -> io::Result<()> {
        EventHub::reset(self, event);
        Ok(())
    }
}

// ---- cross-process transport ------------------------------------------------

const HUB_WIRE_VERSION: u8 = 1;
const HUB_OP_POST: u8 = 0x01;
const HUB_OP_WAIT: u8 = 0x02;
const HUB_OP_RESET: u8 = 0x03;
const HUB_RSP_VALUE: u8 = 0x10;
const HUB_RSP_NONE: u8 = 0x11;

fn write_frame<W: Write>(w: &mut W, op: u8, body: &Value) -> io::Result<()> {
    let bytes =
        serde_json::to_vec(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&[HUB_WIRE_VERSION, op])?;
    w.write_u32::<BigEndian>(bytes.len() as u32)?;
    w.write_all(&bytes)?;
    w.flush()
}

fn read_frame<R: Read>(r: &mut R) -> io::Result<(u8, Value)> {
    let mut head = [0u8; 2];
    r.read_exact(&mut head)?;
    if head[0] != HUB_WIRE_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported hub wire version {}", head[0]),
        ));
    }
    let len = r.read_u32::<BigEndian>()? as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    let value = serde_json::from_slice(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((head[1], value))
}

/// Serves an [`EventHub`] to workers in other processes, one thread per
/// connection. Waits are answered when the event fires or the requested
/// timeout passes, so a blocked wait ties up only its own connection.
pub struct HubServer {
    endpoint: String,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl HubServer {
    pub fn bind(addr: &str, hub: EventHub) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let endpoint = listener.local_addr()?.to_string();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let accept_thread = thread::Builder::new().name("hub-server".to_string()).spawn(
            move || {
                for conn in listener.incoming() {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match conn {
                        Ok(stream) => {
                            let hub = hub.clone();
                            let _ = thread::Builder::new()
                                .name("hub-conn".to_string())
                                .spawn(move || serve_connection(stream, hub));
                        }
                        Err(e) => log::warn!("hub server: accept failed: {}", e),
                    }
                }
            },
        )?;
        log::info!("hub server listening on {}", endpoint);
        Ok(Self { endpoint, shutdown, accept_thread: Some(accept_thread) })
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

impl Drop for HubServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept loop
        let _ = TcpStream::connect(&self.endpoint);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve_connection(mut stream: TcpStream, hub: EventHub) {
    let _ = stream.set_nodelay(true);
    loop {
        let (op, body) = match read_frame(&mut stream) {
            Ok(frame) => frame,
            // Peer disconnected or sent garbage
            Err(_) => return,
        };
        let event = body["event"].as_str().unwrap_or_default().to_string();
        let (kind, rsp) = match op {
            HUB_OP_POST => {
                let count = hub.post(&event, body["payload"].clone());
                (HUB_RSP_VALUE, serde_json::json!({ "count": count }))
            }
            HUB_OP_WAIT => {
                let min_count = body["min_count"].as_u64().unwrap_or(0);
                let timeout = Duration::from_millis(body["timeout_ms"].as_u64().unwrap_or(0));
                match hub.wait(&event, min_count, timeout) {
                    Some(payload) => (HUB_RSP_VALUE, payload),
                    None => (HUB_RSP_NONE, Value::Null),
                }
            }
            HUB_OP_RESET => {
                hub.reset(&event);
                (HUB_RSP_VALUE, Value::Null)
            }
            other => {
                log::warn!("hub server: unknown op {:#04x}", other);
                return;
            }
        };
        if write_frame(&mut stream, kind, &rsp).is_err() {
            return;
        }
    }
}

/// Client side of a [`HubServer`] connection.
pub struct RemoteHub {
    stream: Mutex<TcpStream>,
}

impl RemoteHub {
    pub fn connect(endpoint: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(endpoint)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream: Mutex::new(stream) })
    }

    fn request(&self, op: u8, body: &Value, read_timeout: Duration) -> io::Result<(u8, Value)> {
        let mut stream = self.stream.lock();
        stream.set_read_timeout(Some(read_timeout))?;
        write_frame(&mut *stream, op, body)?;
        read_frame(&mut *stream)
    }
}

impl EventBus for RemoteHub {
    fn post(&self, event: &str, payload: &Value) -> io::Result<u64> {
        let body = serde_json::json!({ "event": event, "payload": payload });
        let (_, rsp) = self.request(HUB_OP_POST, &body, SYNC_TIMEOUT)?;
        Ok(rsp["count"].as_u64().unwrap_or(0))
    }

    fn wait(&self, event: &str, min_count: u64, timeout: Duration) -> io::Result<Option<Value>> {
        let body = serde_json::json!({
            "event": event,
            "min_count": min_count,
            "timeout_ms": timeout.as_millis() as u64,
        });
        // The server holds the reply until the event fires or its timeout
        // runs out, so the socket deadline gets extra headroom
        let (kind, rsp) = self.request(HUB_OP_WAIT, &body, timeout + SYNC_TIMEOUT)?;
        Ok(match kind {
            HUB_RSP_VALUE => Some(rsp),
            _ => None,
        })
    }

    fn reset(&self, event: &str) -> io::Result<()> {
        let body = serde_json::json!({ "event": event });
        self.request(HUB_OP_RESET, &body, SYNC_TIMEOUT)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// All peers arrived in time.
    Ok,
    /// This side's own wait timed out.
    Timeout,
    /// A peer reported a timeout of its own.
    TimeoutOther,
}

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub status: SyncStatus,
    /// Payloads keyed by peer name; the merged dict on a secondary.
    pub payloads: IndexMap<String, Value>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub enum SyncRole {
    Primary { secondaries: Vec<String> },
    Secondary { name: String },
}

/// One worker's view of the rendezvous, over either transport.
pub struct SyncLink {
    bus: Box<dyn EventBus>,
    role: SyncRole,
    timeout: Duration,
    /// Monotonic round number; both sides advance it every call.
    event_count: u64,
}

fn to_prim(secondary: &str) -> String {
    format!("{}_to_prim", secondary)
}
fn from_prim(secondary: &str) -> String {
    format!("{}_from_prim", secondary)
}

fn is_timeout_payload(value: &Value) -> bool {
    value.as_str() == Some(TIMEOUT_PAYLOAD)
}

impl SyncLink {
    pub fn new(hub: EventHub, role: SyncRole) -> Self {
        Self::with_bus(Box::new(hub), role)
    }

    /// A link over an explicit transport, e.g. a [`RemoteHub`] connection.
    pub fn with_bus(bus: Box<dyn EventBus>, role: SyncRole) -> Self {
        Self { bus, role, timeout: SYNC_TIMEOUT, event_count: 0 }
    }

    /// Swaps the transport. The round counter restarts, the new hub keeps
    /// its own counters.
    pub fn set_bus(&mut self, bus: Box<dyn EventBus>) {
        self.bus = bus;
        self.event_count = 0;
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Synchronizes with the peer boards, exchanging `payload`.
    ///
    /// With `reset_event_counter` both the local round number and the hub
    /// counters of this link's events restart from zero first, which is how a
    /// pair recovers after one side missed a round.
    pub fn sync_boards(&mut self, payload: &Value, reset_event_counter: bool) -> SyncResult {
        if reset_event_counter {
            self.event_count = 0;
            match &self.role {
                SyncRole::Primary { secondaries } => {
                    for sec in secondaries {
                        if let Err(e) = self.bus.reset(&to_prim(sec)) {
                            log::error!("sync: resetting '{}' failed: {}", to_prim(sec), e);
                        }
                    }
                }
                SyncRole::Secondary { name } => {
                    if let Err(e) = self.bus.reset(&from_prim(name)) {
                        log::error!("sync: resetting '{}' failed: {}", from_prim(name), e);
                    }
                }
            }
        }
        self.event_count += 1;
        let started = Instant::now();
        let result = match self.role.clone() {
            SyncRole::Primary { secondaries } => self.sync_primary(&secondaries, payload),
            SyncRole::Secondary { name } => self.sync_secondary(&name, payload),
        };
        SyncResult { duration: started.elapsed(), ..result }
    }

    fn sync_primary(&mut self, secondaries: &[String], payload: &Value) -> SyncResult {
        let started = Instant::now();
        let per_peer = self.timeout / secondaries.len().max(1) as u32;
        let mut payloads = IndexMap::new();
        let mut status = SyncStatus::Ok;
        for sec in secondaries {
            let arrived = match self.bus.wait(&to_prim(sec), self.event_count, per_peer) {
                Ok(value) => value,
                Err(e) => {
                    log::error!("sync: hub i/o error waiting for '{}': {}", sec, e);
                    None
                }
            };
            match arrived {
                Some(value) => {
                    if is_timeout_payload(&value) && status == SyncStatus::Ok {
                        status = SyncStatus::TimeoutOther;
                    }
                    payloads.insert(sec.clone(), value);
                }
                None => {
                    log::warn!("sync: secondary '{}' missed round {}", sec, self.event_count);
                    status = SyncStatus::Timeout;
                    payloads.insert(sec.clone(), Value::String(TIMEOUT_PAYLOAD.to_string()));
                }
            }
        }
        if status == SyncStatus::Timeout {
            // Sleep out the rest of the budget so a late secondary finds the
            // next round instead of a half-open one
            let remaining = (self.timeout + SYNC_TIME_MARGIN).saturating_sub(started.elapsed());
            std::thread::sleep(remaining);
        }
        let mut merged = serde_json::Map::new();
        merged.insert("primary".to_string(), payload.clone());
        for (name, value) in &payloads {
            merged.insert(name.clone(), value.clone());
        }
        let merged = Value::Object(merged);
        for sec in secondaries {
            if let Err(e) = self.bus.post(&from_prim(sec), &merged) {
                log::error!("sync: posting to '{}' failed: {}", from_prim(sec), e);
                status = SyncStatus::Timeout;
            }
        }
        SyncResult { status, payloads, duration: Duration::ZERO }
    }

    fn sync_secondary(&mut self, name: &str, payload: &Value) -> SyncResult {
        if let Err(e) = self.bus.post(&to_prim(name), payload) {
            log::error!("sync: secondary '{}' cannot post: {}", name, e);
            return SyncResult {
                status: SyncStatus::Timeout,
                payloads: IndexMap::new(),
                duration: Duration::ZERO,
            };
        }
        let arrived = match self.bus.wait(
            &from_prim(name),
            self.event_count,
            self.timeout + SYNC_TIME_MARGIN,
        ) {
            Ok(value) => value,
            Err(e) => {
                log::error!("sync: hub i/o error waiting for '{}': {}", from_prim(name), e);
                None
            }
        };
        match arrived {
            Some(merged) => {
                let mut payloads = IndexMap::new();
                let mut status = SyncStatus::Ok;
                if let Value::Object(map) = &merged {
                    for (peer, value) in map {
                        if peer != name && is_timeout_payload(value) {
                            status = SyncStatus::TimeoutOther;
                        }
                        payloads.insert(peer.clone(), value.clone());
                    }
                } else {
                    payloads.insert("primary".to_string(), merged);
                }
                SyncResult { status, payloads, duration: Duration::ZERO }
            }
            None => {
                log::warn!("sync: secondary '{}' timed out in round {}", name, self.event_count);
                SyncResult { status: SyncStatus::Timeout, payloads: IndexMap::new(), duration: Duration::ZERO }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn pair(timeout: Duration) -> (SyncLink, SyncLink) {
        let hub = EventHub::new();
        let primary = SyncLink::new(
            hub.clone(),
            SyncRole::Primary { secondaries: vec!["sec".to_string()] },
        )
        .with_timeout(timeout);
        let secondary =
            SyncLink::new(hub, SyncRole::Secondary { name: "sec".to_string() }).with_timeout(timeout);
        (primary, secondary)
    }

    #[test]
    fn payloads_cross_both_ways() {
        let (mut primary, mut secondary) = pair(Duration::from_secs(2));
        let handle = thread::spawn(move || secondary.sync_boards(&json!({"crc": 7}), false));
        let p = primary.sync_boards(&json!({"crc": 1}), false);
        let s = handle.join().unwrap();
        assert_eq!(p.status, SyncStatus::Ok);
        assert_eq!(s.status, SyncStatus::Ok);
        assert_eq!(p.payloads["sec"]["crc"], 7);
        assert_eq!(s.payloads["primary"]["crc"], 1);
        assert_eq!(s.payloads["sec"]["crc"], 7);
    }

    #[test]
    fn missing_secondary_times_out_and_recovers() {
        let (mut primary, mut secondary) = pair(Duration::from_millis(100));
        // Round 1: the secondary never shows up
        let p = primary.sync_boards(&json!({}), false);
        assert_eq!(p.status, SyncStatus::Timeout);
        assert_eq!(p.payloads["sec"], json!(TIMEOUT_PAYLOAD));
        assert!(p.duration >= Duration::from_millis(100));

        // Recovery: both sides reset their counters and resync
        let handle = thread::spawn(move || {
            // Let the primary clear its counters before posting
            thread::sleep(Duration::from_millis(20));
            let s = secondary.sync_boards(&json!({"ready": true}), true);
            (s, secondary)
        });
        let p = primary.sync_boards(&json!({}), true);
        let (s, _) = handle.join().unwrap();
        assert_eq!(p.status, SyncStatus::Ok);
        assert_eq!(s.status, SyncStatus::Ok);
        assert_eq!(p.payloads["sec"]["ready"], true);
    }

    #[test]
    fn secondary_timeout_is_reported_to_the_primary() {
        let (mut primary, mut secondary) = pair(Duration::from_millis(100));
        // The secondary posts the sentinel after a failed round of its own
        let handle = thread::spawn(move || {
            secondary.sync_boards(&Value::String(TIMEOUT_PAYLOAD.to_string()), false)
        });
        let p = primary.sync_boards(&json!({}), false);
        handle.join().unwrap();
        assert_eq!(p.status, SyncStatus::TimeoutOther);
    }

    #[test]
    fn remote_links_rendezvous_over_tcp() {
        let server = HubServer::bind("127.0.0.1:0", EventHub::new()).unwrap();
        let endpoint = server.endpoint();
        let mut primary = SyncLink::with_bus(
            Box::new(RemoteHub::connect(&endpoint).unwrap()),
            SyncRole::Primary { secondaries: vec!["sec".to_string()] },
        )
        .with_timeout(Duration::from_secs(2));
        let sec_bus = RemoteHub::connect(&endpoint).unwrap();
        let handle = thread::spawn(move || {
            let mut secondary = SyncLink::with_bus(
                Box::new(sec_bus),
                SyncRole::Secondary { name: "sec".to_string() },
            )
            .with_timeout(Duration::from_secs(2));
            secondary.sync_boards(&json!({"crc": 7}), false)
        });
        let p = primary.sync_boards(&json!({"crc": 1}), false);
        let s = handle.join().unwrap();
        assert_eq!(p.status, SyncStatus::Ok);
        assert_eq!(s.status, SyncStatus::Ok);
        assert_eq!(p.payloads["sec"]["crc"], 7);
        assert_eq!(s.payloads["primary"]["crc"], 1);
    }

    #[test]
    fn restarted_remote_peer_recovers_after_reset() {
        let server = HubServer::bind("127.0.0.1:0", EventHub::new()).unwrap();
        let endpoint = server.endpoint();
        let mut primary = SyncLink::with_bus(
            Box::new(RemoteHub::connect(&endpoint).unwrap()),
            SyncRole::Primary { secondaries: vec!["sec".to_string()] },
        )
        .with_timeout(Duration::from_millis(100));
        // Round 1: nobody on the other end yet
        let p = primary.sync_boards(&json!({}), false);
        assert_eq!(p.status, SyncStatus::Timeout);

        // A fresh connection stands in for a restarted peer process; both
        // sides reset and resync
        let sec_bus = RemoteHub::connect(&endpoint).unwrap();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut secondary = SyncLink::with_bus(
                Box::new(sec_bus),
                SyncRole::Secondary { name: "sec".to_string() },
            )
            .with_timeout(Duration::from_millis(500));
            secondary.sync_boards(&json!({"ready": true}), true)
        });
        let p = primary.sync_boards(&json!({}), true);
        let s = handle.join().unwrap();
        assert_eq!(p.status, SyncStatus::Ok);
        assert_eq!(s.status, SyncStatus::Ok);
        assert_eq!(p.payloads["sec"]["ready"], true);
    }

    #[test]
    fn stale_posts_do_not_satisfy_a_new_round() {
        let hub = EventHub::new();
        hub.post("sec_to_prim", json!({"stale": true}));
        let mut primary = SyncLink::new(
            hub.clone(),
            SyncRole::Primary { secondaries: vec!["sec".to_string()] },
        )
        .with_timeout(Duration::from_millis(50));
        // Round 1 consumes the stale post
        let p = primary.sync_boards(&json!({}), false);
        assert_eq!(p.status, SyncStatus::Ok);
        // Round 2 must not be satisfied by it again
        let p = primary.sync_boards(&json!({}), false);
        assert_eq!(p.status, SyncStatus::Timeout);
    }
}
