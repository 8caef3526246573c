//! Typed terminals: the endpoints on a task template.
//!
//! An input terminal [`In`] receives `(key, value)` pairs through a set of
//! callbacks installed by its owning template; an output terminal [`Out`]
//! fans values out to the input terminals it was connected to. Value
//! category is preserved end to end: an owned send is steered to at most
//! one consuming peer while every other peer receives a borrow, so a value
//! with a single consumer is never cloned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use enum_as_inner::EnumAsInner;
use tracing::trace;

use crate::error::ProtocolError;
use crate::graph::TtNode;
use crate::key::{Datum, Key};
use crate::world::Rank;

/// How an input terminal uses the values it receives.
///
/// `Consume` grants the task body ownership (the body may move the value
/// out); `Read` promises non-mutating use, which lets the runtime hand the
/// moved payload to a consuming sibling instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum TerminalMode {
    Consume,
    Read,
}

/// Container access for one pull input: `get` fetches the value for a task
/// key, `owner` names the rank holding it. Both are pre-composed with the
/// task-key-to-container-key mapper.
pub(crate) struct PullSpec<K, V> {
    pub get: Arc<dyn Fn(&K) -> Option<V> + Send + Sync>,
    pub owner: Arc<dyn Fn(&K) -> Rank + Send + Sync>,
}

impl<K, V> Clone for PullSpec<K, V> {
    fn clone(&self) -> Self {
        Self {
            get: self.get.clone(),
            owner: self.owner.clone(),
        }
    }
}

/// The callback quintuple a template installs into each of its inputs.
pub(crate) struct InCallbacks<K, V> {
    pub send: Box<dyn Fn(&K, &V) + Send + Sync>,
    pub send_owned: Box<dyn Fn(&K, V) + Send + Sync>,
    /// Absent by default; [`In::broadcast`] then degrades to per-key sends.
    pub broadcast: Option<Box<dyn Fn(&[K], &V) + Send + Sync>>,
    pub set_size: Box<dyn Fn(&K, usize) + Send + Sync>,
    pub finalize: Box<dyn Fn(&K) + Send + Sync>,
}

struct InInner<K: Key, V: Datum> {
    name: String,
    mode: TerminalMode,
    callbacks: OnceLock<InCallbacks<K, V>>,
    pull: OnceLock<PullSpec<K, V>>,
    node: OnceLock<Weak<dyn TtNode>>,
}

/// A typed input terminal.
pub struct In<K: Key, V: Datum> {
    inner: Arc<InInner<K, V>>,
}

impl<K: Key, V: Datum> Clone for In<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Key, V: Datum> In<K, V> {
    pub(crate) fn new(name: &str, mode: TerminalMode) -> Self {
        Self {
            inner: Arc::new(InInner {
                name: name.to_string(),
                mode,
                callbacks: OnceLock::new(),
                pull: OnceLock::new(),
                node: OnceLock::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> TerminalMode {
        self.inner.mode
    }

    pub fn is_pull(&self) -> bool {
        self.inner.pull.get().is_some()
    }

    /// Installs the callback quintuple. A template installs callbacks
    /// exactly once per input terminal.
    pub(crate) fn set_callbacks(&self, callbacks: InCallbacks<K, V>) {
        if self.inner.callbacks.set(callbacks).is_err() {
            panic!(
                "terminal `{}`: input callbacks installed twice",
                self.inner.name
            );
        }
    }

    pub(crate) fn set_pull(&self, spec: PullSpec<K, V>) {
        let _ = self.inner.pull.set(spec);
    }

    pub(crate) fn pull_spec(&self) -> Option<&PullSpec<K, V>> {
        self.inner.pull.get()
    }

    pub(crate) fn bind_node(&self, node: Weak<dyn TtNode>) {
        let _ = self.inner.node.set(node);
    }

    pub(crate) fn node(&self) -> Option<&Weak<dyn TtNode>> {
        self.inner.node.get()
    }

    fn callbacks(&self, which: &'static str) -> &InCallbacks<K, V> {
        match self.inner.callbacks.get() {
            Some(callbacks) => callbacks,
            None => panic!(
                "{}",
                ProtocolError::CallbackUninitialized {
                    terminal: self.inner.name.clone(),
                    callback: which,
                }
            ),
        }
    }

    /// Delivers a borrowed value; the receiving template clones it into the
    /// pending record.
    pub fn send(&self, key: &K, value: &V) {
        (self.callbacks("send").send)(key, value)
    }

    /// Delivers an owned value without a clone.
    pub fn send_owned(&self, key: &K, value: V) {
        (self.callbacks("move").send_owned)(key, value)
    }

    /// Delivers `value` once under every key in `keys`.
    pub fn broadcast(&self, keys: &[K], value: &V) {
        let callbacks = self.callbacks("send");
        match &callbacks.broadcast {
            Some(broadcast) => broadcast(keys, value),
            None => {
                for key in keys {
                    (callbacks.send)(key, value);
                }
            }
        }
    }

    /// Declares a bounded stream length for this input under `key`.
    pub fn set_size(&self, key: &K, size: usize) {
        (self.callbacks("set_size").set_size)(key, size)
    }

    /// Terminates an unbounded stream for this input under `key`.
    pub fn finalize(&self, key: &K) {
        (self.callbacks("finalize").finalize)(key)
    }
}

impl<K: Key> In<K, ()> {
    /// Control-signal send: a keyed message with no payload.
    pub fn sendk(&self, key: &K) {
        self.send_owned(key, ());
    }
}

impl<V: Datum> In<(), V> {
    /// Send to the single task instance of a void-keyed template.
    pub fn sendv(&self, value: V) {
        self.send_owned(&(), value);
    }
}

impl In<(), ()> {
    /// Pure control signal to a void-keyed template.
    pub fn fire(&self) {
        self.send_owned(&(), ());
    }
}

struct OutInner<K: Key, V: Datum> {
    name: String,
    connections: RwLock<Vec<In<K, V>>>,
    pull: AtomicBool,
    node: OnceLock<Weak<dyn TtNode>>,
}

/// A typed output terminal.
pub struct Out<K: Key, V: Datum> {
    inner: Arc<OutInner<K, V>>,
}

impl<K: Key, V: Datum> Clone for Out<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Key, V: Datum> Out<K, V> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(OutInner {
                name: name.to_string(),
                connections: RwLock::new(Vec::new()),
                pull: AtomicBool::new(false),
                node: OnceLock::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn mark_pull(&self) {
        self.inner.pull.store(true, Ordering::Release);
    }

    pub fn is_pull(&self) -> bool {
        self.inner.pull.load(Ordering::Acquire)
    }

    pub(crate) fn bind_node(&self, node: Weak<dyn TtNode>) {
        let _ = self.inner.node.set(node);
    }

    /// Number of input terminals this output fans out to.
    pub fn num_connections(&self) -> usize {
        self.inner.connections.read().unwrap().len()
    }

    /// Wires this output to an input terminal and records the downstream
    /// template as a successor of the owning one.
    pub fn connect(&self, input: &In<K, V>) {
        if let (Some(src), Some(dst)) = (
            self.inner.node.get().and_then(Weak::upgrade),
            input.node().cloned(),
        ) {
            src.add_successor(dst);
        }
        trace!(out = %self.inner.name, input = %input.name(), "connected terminals");
        self.inner.connections.write().unwrap().push(input.clone());
    }

    /// Sends an owned value to every connection.
    ///
    /// Every `Read` peer and every consuming peer but one receives a
    /// borrow (cloned on arrival); the remaining consuming peer, if any,
    /// receives the value itself.
    pub fn send(&self, key: &K, value: V) {
        let connections = self.inner.connections.read().unwrap();
        let mut consumer: Option<&In<K, V>> = None;
        for input in connections.iter() {
            if input.mode().is_consume() && consumer.is_none() {
                consumer = Some(input);
                continue;
            }
            input.send(key, &value);
        }
        if let Some(input) = consumer {
            input.send_owned(key, value);
        }
    }

    /// Targeted send to the `index`-th connection.
    pub fn send_to(&self, key: &K, value: V, index: usize) {
        let connections = self.inner.connections.read().unwrap();
        match connections.get(index) {
            Some(input) => input.send_owned(key, value),
            None => panic!(
                "terminal `{}`: send_to({index}) but only {} connections",
                self.inner.name,
                connections.len()
            ),
        }
    }

    /// Delivers `value` once under every key in `keys`, on every
    /// connection. Broadcast payloads are always borrowed.
    pub fn broadcast(&self, keys: &[K], value: &V) {
        for input in self.inner.connections.read().unwrap().iter() {
            input.broadcast(keys, value);
        }
    }

    /// Declares a bounded stream length on every connection.
    pub fn set_size(&self, key: &K, size: usize) {
        for input in self.inner.connections.read().unwrap().iter() {
            input.set_size(key, size);
        }
    }

    /// Terminates the stream under `key` on every connection.
    pub fn finalize(&self, key: &K) {
        for input in self.inner.connections.read().unwrap().iter() {
            input.finalize(key);
        }
    }
}

impl<K: Key> Out<K, ()> {
    /// Control-signal send: a keyed message with no payload.
    pub fn sendk(&self, key: &K) {
        self.send(key, ());
    }
}

impl<V: Datum> Out<(), V> {
    /// Send to the single task instance of a void-keyed template.
    pub fn sendv(&self, value: V) {
        self.send(&(), value);
    }
}

impl Out<(), ()> {
    /// Pure control signal to a void-keyed template.
    pub fn fire(&self) {
        self.send(&(), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct Traced(u64);

    impl Clone for Traced {
        fn clone(&self) -> Self {
            Traced(self.0)
        }
    }

    fn recording_input(
        name: &str,
        mode: TerminalMode,
        log: Arc<Mutex<Vec<(u64, u64, bool)>>>,
    ) -> In<u64, Traced> {
        let input = In::new(name, mode);
        let borrowed = log.clone();
        let owned = log;
        input.set_callbacks(InCallbacks {
            send: Box::new(move |k, v: &Traced| {
                let v = v.clone();
                borrowed.lock().unwrap().push((*k, v.0, false));
            }),
            send_owned: Box::new(move |k, v: Traced| owned.lock().unwrap().push((*k, v.0, true))),
            broadcast: None,
            set_size: Box::new(|_, _| {}),
            finalize: Box::new(|_| {}),
        });
        input
    }

    #[test]
    fn owned_send_moves_to_at_most_one_consumer() {
        let out = Out::<u64, Traced>::new("src");
        let log = Arc::new(Mutex::new(Vec::new()));
        out.connect(&recording_input("read-a", TerminalMode::Read, log.clone()));
        out.connect(&recording_input("consume", TerminalMode::Consume, log.clone()));
        out.connect(&recording_input("read-b", TerminalMode::Read, log.clone()));

        out.send(&3, Traced(9));

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|(_, _, moved)| *moved).count(), 1);
        assert_eq!(log.iter().filter(|(_, _, moved)| !*moved).count(), 2);
    }

    #[test]
    fn broadcast_degrades_to_per_key_sends() {
        let out = Out::<u64, Traced>::new("src");
        let log = Arc::new(Mutex::new(Vec::new()));
        out.connect(&recording_input("sink", TerminalMode::Consume, log.clone()));

        out.broadcast(&[0, 1, 2], &Traced(5));

        let log = log.lock().unwrap();
        let keys: Vec<u64> = log.iter().map(|(k, _, _)| *k).collect();
        assert_eq!(keys, vec![0, 1, 2]);
        assert!(log.iter().all(|(_, v, moved)| *v == 5 && !*moved));
    }

    #[test]
    #[should_panic(expected = "callback not initialized")]
    fn send_without_callbacks_panics() {
        let input: In<u64, Traced> = In::new("orphan", TerminalMode::Consume);
        input.send(&0, &Traced(0));
    }

    #[test]
    fn send_to_targets_a_single_connection() {
        let out = Out::<u64, Traced>::new("src");
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        out.connect(&recording_input("a", TerminalMode::Consume, first.clone()));
        out.connect(&recording_input("b", TerminalMode::Consume, second.clone()));

        out.send_to(&1, Traced(4), 1);

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().as_slice(), &[(1, 4, true)]);
    }
}
