//! Mailboxes and the per-isolate message pump.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use object::Value;
use parking_lot::{Condvar, Mutex};

use crate::cobject::CObject;
use crate::error::{ErrorKind, RuntimeResult, Unwind};
use crate::function::FunctionId;
use crate::isolate::Isolate;
use crate::port::PortId;

/// How long `run_loop` sleeps before polling for interrupts again.
const RUN_LOOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Delivered ahead of every normal message.
    Oob,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub dest_port: PortId,
    pub reply_port: PortId,
    pub payload: CObject,
    pub priority: Priority,
}

impl Message {
    pub fn new(dest_port: PortId, payload: CObject) -> Self {
        Message {
            dest_port,
            reply_port: 0,
            payload,
            priority: Priority::Normal,
        }
    }

    pub fn with_reply_port(mut self, reply_port: PortId) -> Self {
        self.reply_port = reply_port;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

// ── Queue ──────────────────────────────────────────────────────────

/// FIFO per priority; out-of-band messages go first.
#[derive(Debug, Default)]
pub struct MessageQueue {
    normal: VecDeque<Message>,
    oob: VecDeque<Message>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: Message) {
        match message.priority {
            Priority::Normal => self.normal.push_back(message),
            Priority::Oob => self.oob.push_back(message),
        }
    }

    pub fn dequeue(&mut self) -> Option<Message> {
        self.oob.pop_front().or_else(|| self.normal.pop_front())
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.oob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued message, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.normal.clear();
        self.oob.clear();
        dropped
    }

    /// Drops the messages addressed to `port`.
    pub fn remove_port(&mut self, port: PortId) -> usize {
        let before = self.len();
        self.normal.retain(|m| m.dest_port != port);
        self.oob.retain(|m| m.dest_port != port);
        before - self.len()
    }
}

// ── Mailbox ────────────────────────────────────────────────────────

/// Called on the posting thread after a message lands in a mailbox.
pub type NotifyCallback = Arc<dyn Fn(PortId) + Send + Sync>;

/// The receiving end of an isolate's ports. Posting only takes the
/// mailbox lock.
#[derive(Default)]
pub struct Mailbox {
    queue: Mutex<MessageQueue>,
    arrived: Condvar,
    notify: Mutex<Option<NotifyCallback>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, message: Message) {
        let dest = message.dest_port;
        self.queue.lock().enqueue(message);
        self.arrived.notify_one();
        let notify = self.notify.lock().clone();
        if let Some(notify) = notify {
            notify(dest);
        }
    }

    pub fn try_take(&self) -> Option<Message> {
        self.queue.lock().dequeue()
    }

    /// Waits up to `timeout` for a message.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Message> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.arrived.wait_for(&mut queue, timeout);
        }
        queue.dequeue()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        self.queue.lock().clear()
    }

    pub(crate) fn drop_messages_for(&self, port: PortId) -> usize {
        self.queue.lock().remove_port(port)
    }

    pub fn set_notify_callback(&self, callback: Option<NotifyCallback>) {
        *self.notify.lock() = callback;
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("pending", &self.len()).finish()
    }
}

// ── Pump ───────────────────────────────────────────────────────────

pub type NativeMessageFn = dyn FnMut(&mut Isolate, PortId, PortId, Value) -> RuntimeResult<()> + Send;

/// Receiver of an isolate's decoded messages.
pub enum MessageHandler {
    /// Managed function taking `(dest_port, reply_port, message)`.
    Function(FunctionId),
    /// Embedder callback. The message value is not rooted; it must be
    /// re-read after anything that can allocate.
    Native(Box<NativeMessageFn>),
}

impl MessageHandler {
    pub fn native(f: impl FnMut(&mut Isolate, PortId, PortId, Value) -> RuntimeResult<()> + Send + 'static) -> Self {
        MessageHandler::Native(Box::new(f))
    }
}

impl Isolate {
    pub fn set_message_handler(&mut self, handler: MessageHandler) {
        self.message_handler = Some(handler);
    }

    pub fn set_message_notify_callback(&self, callback: Option<NotifyCallback>) {
        self.mailbox.set_notify_callback(callback);
    }

    pub fn has_live_ports(&self) -> bool {
        self.runtime.port_map().has_live_ports(&self.mailbox)
    }

    pub fn pending_messages(&self) -> usize {
        self.mailbox.len()
    }

    /// Handles at most one queued message. Returns whether one was
    /// handled.
    pub fn handle_message(&mut self) -> RuntimeResult<bool> {
        match self.mailbox.try_take() {
            Some(message) => {
                self.dispatch_message(message)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handles messages until no live port is left.
    pub fn run_loop(&mut self) -> RuntimeResult<()> {
        log::debug!("isolate '{}' entering run loop", self.name());
        while self.has_live_ports() {
            match self.mailbox.take_timeout(RUN_LOOP_POLL) {
                Some(message) => self.dispatch_message(message)?,
                None => self.check_interrupts()?,
            }
        }
        log::debug!("isolate '{}' has no live ports", self.name());
        Ok(())
    }

    fn dispatch_message(&mut self, message: Message) -> RuntimeResult<()> {
        self.check_interrupts()?;
        if !self.runtime.port_map().is_active(message.dest_port) {
            log::trace!("dropping message for closed port {}", message.dest_port);
            return Ok(());
        }
        log::trace!("isolate '{}' handling message for port {}", self.name(), message.dest_port);
        let depth = self.roots.api.scope_depth();
        self.roots.api.enter_scope();
        let result = self.deliver(&message);
        self.roots.api.unwind_scopes_to(depth);
        match result {
            Ok(()) => Ok(()),
            Err(unwind) => self.report_unhandled(unwind),
        }
    }

    fn deliver(&mut self, message: &Message) -> RuntimeResult<()> {
        let value = self.deserialize_message(&message.payload)?;
        let Some(mut handler) = self.message_handler.take() else {
            return Err(self.raise_error(ErrorKind::Api, "isolate has no message handler"));
        };
        let result = match &mut handler {
            MessageHandler::Function(function) => {
                let function = *function;
                self.with_rooted(&[value], |isolate, mark| {
                    let dest = isolate.new_integer_i128(i128::from(message.dest_port))?;
                    isolate.roots.scratch.push(dest);
                    let reply = isolate.new_integer_i128(i128::from(message.reply_port))?;
                    let args = [isolate.roots.scratch[mark + 1], reply, isolate.roots.scratch[mark]];
                    isolate.invoke_function(function, &args).map(|_| ())
                })
            }
            MessageHandler::Native(callback) => callback(self, message.dest_port, message.reply_port, value),
        };
        if self.message_handler.is_none() {
            self.message_handler = Some(handler);
        }
        result
    }

    /// Offers an unhandled exception to the embedder. Errors it does not
    /// absorb stay pending and propagate.
    fn report_unhandled(&mut self, unwind: Unwind) -> RuntimeResult<()> {
        if self.roots.unwinder.kind() != Some(ErrorKind::UnhandledException) {
            return Err(unwind);
        }
        let Some(callback) = self.runtime.callbacks().isolate_unhandled_exception else {
            return Err(unwind);
        };
        let error = self.roots.unwinder.pending();
        if callback(self, error) {
            self.roots.unwinder.take();
            Ok(())
        } else {
            Err(unwind)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};

    fn message(port: PortId, n: i32) -> Message {
        Message::new(port, CObject::Int32(n))
    }

    // ── Queue ──────────────────────────────────────────────────────

    #[test]
    fn queue_is_fifo_with_oob_first() {
        let mut queue = MessageQueue::new();
        assert!(queue.dequeue().is_none());
        queue.enqueue(message(1, 1));
        queue.enqueue(message(1, 2));
        queue.enqueue(message(1, 3).with_priority(Priority::Oob));
        assert_eq!(queue.len(), 3);
        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue()).map(|m| m.payload).collect();
        assert_eq!(order, vec![CObject::Int32(3), CObject::Int32(1), CObject::Int32(2)]);
    }

    #[test]
    fn clear_drops_everything() {
        let mut queue = MessageQueue::new();
        queue.enqueue(message(1, 1));
        queue.enqueue(message(2, 2).with_priority(Priority::Oob));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn remove_port_keeps_other_ports() {
        let mut queue = MessageQueue::new();
        queue.enqueue(message(1, 1));
        queue.enqueue(message(2, 2));
        queue.enqueue(message(1, 3));
        assert_eq!(queue.remove_port(1), 2);
        assert_eq!(queue.dequeue().map(|m| m.dest_port), Some(2));
    }

    #[test]
    fn mailbox_notifies_after_enqueue() {
        let mailbox = Arc::new(Mailbox::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let observed = Arc::clone(&mailbox);
        mailbox.set_notify_callback(Some(Arc::new(move |port: PortId| {
            assert_eq!(port, 7);
            assert_eq!(observed.len(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        mailbox.post(message(7, 0));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(mailbox.take_timeout(Duration::from_millis(1)).is_some());
        assert!(mailbox.take_timeout(Duration::from_millis(1)).is_none());
    }

    // ── Pump ───────────────────────────────────────────────────────

    fn with_isolate<R>(config: RuntimeConfig, f: impl FnOnce(&mut Isolate) -> R) -> R {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = Runtime::initialize(config).unwrap();
        let handle = runtime.create_isolate("pump", 0).unwrap();
        let result = handle.with(f).unwrap();
        handle.shutdown().unwrap();
        result
    }

    #[test]
    fn handle_message_decodes_and_dispatches_in_order() {
        with_isolate(RuntimeConfig::default(), |isolate| {
            let received = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&received);
            isolate.set_message_handler(MessageHandler::native(move |isolate, dest, _, value| {
                assert_eq!(dest, isolate.main_port());
                sink.lock().push(isolate.integer_value(value));
                Ok(())
            }));
            assert!(!isolate.handle_message().unwrap());
            let port = isolate.main_port();
            for n in 0..3 {
                isolate.runtime().post(port, CObject::Int32(n)).unwrap();
            }
            while isolate.handle_message().unwrap() {}
            assert_eq!(*received.lock(), vec![Some(0), Some(1), Some(2)]);
        });
    }

    #[test]
    fn messages_to_closed_ports_are_dropped() {
        with_isolate(RuntimeConfig::default(), |isolate| {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            isolate.set_message_handler(MessageHandler::native(move |_, _, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            let port = isolate.new_receive_port();
            isolate.runtime().post(port, CObject::Null).unwrap();
            assert!(isolate.runtime().port_map().close_port(port));
            assert!(!isolate.handle_message().unwrap());
            assert!(isolate.runtime().post(port, CObject::Null).is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        });
    }

    fn absorb(_: &mut Isolate, _: Value) -> bool {
        true
    }

    #[test]
    fn unhandled_exceptions_reach_the_callback() {
        let mut config = RuntimeConfig::default();
        config.callbacks.isolate_unhandled_exception = Some(absorb);
        with_isolate(config, |isolate| {
            isolate.set_message_handler(MessageHandler::native(|isolate, _, _, value| {
                Err(isolate.throw_exception(value))
            }));
            let port = isolate.main_port();
            isolate.runtime().post(port, CObject::from("boom")).unwrap();
            assert!(isolate.handle_message().unwrap());
            assert!(!isolate.roots.unwinder.is_pending());
        });
    }

    #[test]
    fn unhandled_exceptions_propagate_without_a_callback() {
        with_isolate(RuntimeConfig::default(), |isolate| {
            isolate.set_message_handler(MessageHandler::native(|isolate, _, _, value| {
                Err(isolate.throw_exception(value))
            }));
            let port = isolate.main_port();
            isolate.runtime().post(port, CObject::Int32(1)).unwrap();
            assert!(isolate.handle_message().is_err());
            assert_eq!(isolate.roots.unwinder.kind(), Some(ErrorKind::UnhandledException));
            isolate.roots.unwinder.take();
        });
    }

    #[test]
    fn run_loop_returns_once_ports_close() {
        with_isolate(RuntimeConfig::default(), |isolate| {
            let port = isolate.main_port();
            isolate.runtime().port_map().set_live(port, true);
            isolate.set_message_handler(MessageHandler::native(|isolate, dest, _, value| {
                if isolate.integer_value(value) == Some(2) {
                    isolate.runtime().port_map().close_port(dest);
                }
                Ok(())
            }));
            isolate.runtime().post(port, CObject::Int32(1)).unwrap();
            isolate.runtime().post(port, CObject::Int32(2)).unwrap();
            isolate.run_loop().unwrap();
            assert!(!isolate.has_live_ports());
            assert_eq!(isolate.pending_messages(), 0);
        });
    }
}
