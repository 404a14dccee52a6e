//! Process-wide port registry.
//!
//! A port is a non-zero 64-bit id owned either by an isolate's mailbox or
//! by a native handler. Ports start out present but not live; only live
//! ports keep an isolate's run loop going.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use object::cid;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cobject::CObject;
use crate::error::{ApiError, RuntimeResult};
use crate::isolate::Isolate;
use crate::message::{Mailbox, Message};
use crate::thread_pool::{PoolConfig, ThreadPool};

pub type PortId = u64;

/// The port id that never names a port.
pub const ILLEGAL_PORT: PortId = 0;

/// `(dest_port, reply_port, message)`. The message is only borrowed for
/// the call.
pub type NativeMessageHandler = Arc<dyn Fn(PortId, PortId, &CObject) + Send + Sync>;

#[derive(Clone)]
pub enum PortOwner {
    Isolate(Arc<Mailbox>),
    Native(Arc<NativePort>),
}

impl PortOwner {
    fn is_mailbox(&self, mailbox: &Arc<Mailbox>) -> bool {
        match self {
            PortOwner::Isolate(m) => Arc::ptr_eq(m, mailbox),
            PortOwner::Native(_) => false,
        }
    }
}

// ── Native ports ───────────────────────────────────────────────────

pub struct NativePort {
    name: String,
    handler: NativeMessageHandler,
    concurrent: bool,
    pending: Mutex<VecDeque<Message>>,
    draining: AtomicBool,
    closed: AtomicBool,
}

impl NativePort {
    pub fn new(name: &str, handler: NativeMessageHandler, handle_concurrently: bool) -> Arc<Self> {
        Arc::new(NativePort {
            name: name.to_owned(),
            handler,
            concurrent: handle_concurrently,
            pending: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, message: &Message) {
        if !self.closed.load(Ordering::Acquire) {
            (self.handler)(message.dest_port, message.reply_port, &message.payload);
        }
    }

    /// Hands `message` to the pool. Returns false if the pool no longer
    /// accepts work.
    fn deliver(self: &Arc<Self>, message: Message, pool: &ThreadPool) -> bool {
        if self.concurrent {
            let port = Arc::clone(self);
            return pool.run(Box::new(move || port.handle(&message)));
        }
        self.pending.lock().push_back(message);
        if self.draining.swap(true, Ordering::AcqRel) {
            return true;
        }
        let port = Arc::clone(self);
        if pool.run(Box::new(move || port.drain())) {
            true
        } else {
            self.draining.store(false, Ordering::Release);
            self.pending.lock().clear();
            false
        }
    }

    /// Runs queued messages in order. At most one drain runs at a time.
    fn drain(&self) {
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(message) => self.handle(&message),
                None => {
                    self.draining.store(false, Ordering::Release);
                    // A post may have queued after the pop but seen the
                    // drain still running.
                    if self.pending.lock().is_empty() || self.draining.swap(true, Ordering::AcqRel) {
                        return;
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
    }
}

impl std::fmt::Debug for NativePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePort")
            .field("name", &self.name)
            .field("concurrent", &self.concurrent)
            .finish()
    }
}

// ── Registry ───────────────────────────────────────────────────────

struct PortEntry {
    owner: PortOwner,
    live: bool,
}

struct Ports {
    entries: FxHashMap<PortId, PortEntry>,
    next_id: PortId,
}

pub struct PortMap {
    ports: Mutex<Ports>,
    pool: ThreadPool,
}

impl PortMap {
    pub fn new(pool: PoolConfig) -> Self {
        PortMap {
            ports: Mutex::new(Ports {
                entries: FxHashMap::default(),
                next_id: 1,
            }),
            pool: ThreadPool::new(pool),
        }
    }

    /// Registers a new port. It is present but not live.
    pub fn create_port(&self, owner: PortOwner) -> PortId {
        let mut ports = self.ports.lock();
        let mut id = ports.next_id;
        while id == ILLEGAL_PORT || ports.entries.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        ports.next_id = id.wrapping_add(1);
        ports.entries.insert(id, PortEntry { owner, live: false });
        log::debug!("created port {}", id);
        id
    }

    pub fn set_live(&self, port: PortId, live: bool) -> bool {
        match self.ports.lock().entries.get_mut(&port) {
            Some(entry) => {
                entry.live = live;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, port: PortId) -> bool {
        self.ports.lock().entries.contains_key(&port)
    }

    pub fn is_live(&self, port: PortId) -> bool {
        self.ports.lock().entries.get(&port).is_some_and(|e| e.live)
    }

    /// Closes `port`. Messages still queued for it are dropped.
    pub fn close_port(&self, port: PortId) -> bool {
        let removed = self.ports.lock().entries.remove(&port);
        match removed {
            Some(entry) => {
                log::debug!("closed port {}", port);
                match entry.owner {
                    PortOwner::Isolate(mailbox) => {
                        mailbox.drop_messages_for(port);
                    }
                    PortOwner::Native(native) => native.close(),
                }
                true
            }
            None => false,
        }
    }

    /// Closes every port delivering to `mailbox`.
    pub fn close_ports_of(&self, mailbox: &Arc<Mailbox>) -> usize {
        let mut ports = self.ports.lock();
        let before = ports.entries.len();
        ports.entries.retain(|_, entry| !entry.owner.is_mailbox(mailbox));
        let closed = before - ports.entries.len();
        log::debug!("closed {} ports of an isolate", closed);
        closed
    }

    pub fn has_live_ports(&self, mailbox: &Arc<Mailbox>) -> bool {
        self.ports
            .lock()
            .entries
            .values()
            .any(|entry| entry.live && entry.owner.is_mailbox(mailbox))
    }

    pub fn num_ports(&self) -> usize {
        self.ports.lock().entries.len()
    }

    /// Delivers `message`. The registry lock is only held for the lookup.
    pub fn post(&self, message: Message) -> Result<(), ApiError> {
        let port = message.dest_port;
        let owner = self.ports.lock().entries.get(&port).map(|entry| entry.owner.clone());
        match owner {
            Some(PortOwner::Isolate(mailbox)) => {
                mailbox.post(message);
                Ok(())
            }
            Some(PortOwner::Native(native)) => {
                if native.deliver(message, &self.pool) {
                    Ok(())
                } else {
                    log::warn!("native port '{}' dropped a message during shutdown", native.name());
                    Err(ApiError::ClosedPort(port))
                }
            }
            None => Err(ApiError::ClosedPort(port)),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.pool.shutdown();
    }
}

// ── Language-level ports ───────────────────────────────────────────

impl Isolate {
    /// Opens another port delivering to this isolate's mailbox.
    pub fn new_receive_port(&mut self) -> PortId {
        self.runtime
            .port_map()
            .create_port(PortOwner::Isolate(Arc::clone(&self.mailbox)))
    }

    /// A `SendPort` object for `port`.
    pub fn new_send_port(&mut self, port: PortId) -> RuntimeResult<object::Value> {
        self.new_port_object(cid::SEND_PORT, port)
    }

    /// A `ReceivePort` object for one of this isolate's ports.
    pub fn get_receive_port(&mut self, port: PortId) -> RuntimeResult<object::Value> {
        self.new_port_object(cid::RECEIVE_PORT, port)
    }

    pub fn port_id_of(&self, port: object::Value) -> Option<PortId> {
        match self.class_id_of(port) {
            cid::SEND_PORT | cid::RECEIVE_PORT => Some(unsafe { port.as_ref::<object::Port>() }.id),
            _ => None,
        }
    }

    /// Serializes `value` and posts it to `port`.
    pub fn post(&mut self, port: PortId, value: object::Value) -> Result<(), ApiError> {
        let payload = self.serialize_message(value);
        if payload.is_unsupported() {
            log::debug!("isolate '{}': refusing to post an unsupported object", self.name());
            return Err(ApiError::InvalidArgument("message contains an unsupported object"));
        }
        self.runtime.port_map().post(Message::new(port, payload))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn port_map() -> PortMap {
        let _ = env_logger::builder().is_test(true).try_init();
        PortMap::new(PoolConfig::default())
    }

    fn mailbox_owner() -> (Arc<Mailbox>, PortOwner) {
        let mailbox = Arc::new(Mailbox::new());
        let owner = PortOwner::Isolate(Arc::clone(&mailbox));
        (mailbox, owner)
    }

    #[test]
    fn create_and_close_ports() {
        let map = port_map();
        let (_, owner) = mailbox_owner();
        let a = map.create_port(owner.clone());
        let b = map.create_port(owner);
        assert_ne!(a, ILLEGAL_PORT);
        assert_ne!(a, b);
        assert!(map.is_active(a) && map.is_active(b));
        assert!(map.close_port(a));
        assert!(!map.is_active(a));
        assert!(!map.close_port(a));
        assert!(map.is_active(b));
    }

    #[test]
    fn close_ports_of_one_owner() {
        let map = port_map();
        let (mailbox, owner) = mailbox_owner();
        let (_, other) = mailbox_owner();
        let mine: Vec<_> = (0..3).map(|_| map.create_port(owner.clone())).collect();
        let theirs = map.create_port(other);
        assert_eq!(map.close_ports_of(&mailbox), 3);
        assert!(mine.iter().all(|&p| !map.is_active(p)));
        assert!(map.is_active(theirs));
    }

    #[test]
    fn many_ports_get_distinct_ids() {
        let map = port_map();
        let (_, owner) = mailbox_owner();
        let mut ids: Vec<_> = (0..1000).map(|_| map.create_port(owner.clone())).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1000);
        assert_eq!(map.num_ports(), 1000);
    }

    #[test]
    fn liveness_is_explicit() {
        let map = port_map();
        let (mailbox, owner) = mailbox_owner();
        let port = map.create_port(owner);
        assert!(!map.is_live(port));
        assert!(!map.has_live_ports(&mailbox));
        assert!(map.set_live(port, true));
        assert!(map.has_live_ports(&mailbox));
        map.close_port(port);
        assert!(!map.has_live_ports(&mailbox));
        assert!(!map.set_live(port, true));
    }

    #[test]
    fn post_notifies_the_owner() {
        let map = port_map();
        let (mailbox, owner) = mailbox_owner();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        mailbox.set_notify_callback(Some(Arc::new(move |_: PortId| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let port = map.create_port(owner);
        map.post(Message::new(port, CObject::Null)).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn posting_to_invalid_ports_fails() {
        let map = port_map();
        let (mailbox, owner) = mailbox_owner();
        assert!(map.post(Message::new(ILLEGAL_PORT, CObject::Null)).is_err());
        let port = map.create_port(owner);
        map.post(Message::new(port, CObject::Int32(1))).unwrap();
        map.close_port(port);
        assert_eq!(mailbox.len(), 0);
        assert!(matches!(
            map.post(Message::new(port, CObject::Null)),
            Err(ApiError::ClosedPort(p)) if p == port
        ));
    }

    // ── Native ports ───────────────────────────────────────────────

    #[test]
    fn serial_native_port_keeps_order() {
        let map = port_map();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: NativeMessageHandler = Arc::new(move |_: PortId, _: PortId, message: &CObject| {
            if let CObject::Int32(n) = message {
                tx.lock().send(*n).unwrap();
            }
        });
        let port = map.create_port(PortOwner::Native(NativePort::new("serial", handler, false)));
        for n in 0..100 {
            map.post(Message::new(port, CObject::Int32(n))).unwrap();
        }
        let received: Vec<i32> = (0..100).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_native_port_sees_every_message() {
        let map = port_map();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: NativeMessageHandler = Arc::new(move |dest: PortId, reply: PortId, _: &CObject| {
            tx.lock().send((dest, reply)).unwrap();
        });
        let port = map.create_port(PortOwner::Native(NativePort::new("concurrent", handler, true)));
        for _ in 0..20 {
            map.post(Message::new(port, CObject::Null).with_reply_port(9)).unwrap();
        }
        for _ in 0..20 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (port, 9));
        }
    }

    #[test]
    fn closed_native_port_stops_delivery() {
        let map = port_map();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: NativeMessageHandler = Arc::new(move |_: PortId, _: PortId, _: &CObject| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let port = map.create_port(PortOwner::Native(NativePort::new("closing", handler, false)));
        map.close_port(port);
        assert!(map.post(Message::new(port, CObject::Null)).is_err());
        map.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
