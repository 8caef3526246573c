//! The dispatch core of a task template.
//!
//! For every key flowing into a template the core locates the owning rank,
//! accumulates arguments in a pending record, triggers execution exactly
//! once when the record completes, and retires it from the cache. The core
//! is generic over the key type only; values travel through type-erased
//! slots, and the typed boundary is restored by the adapters that
//! [`make_tt`](crate::make_tt) installs.

use std::any::Any;
use std::cell::Cell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};

use tracing::{error, trace};

use crate::codec::{encode_value, ErasedValue, ValueCodec};
use crate::error::ProtocolError;
use crate::graph::TtNode;
use crate::key::{cache_hasher, stable_hash, Datum, Key};
use crate::terminal::In;
use crate::world::{protocol_abort, AmOp, AmTarget, Envelope, ObjectId, Rank, World};

/// Upper bound on nested inline task execution. Chains of templates whose
/// keys hash identically run on the caller's stack up to this depth.
pub(crate) const INLINE_CALL_DEPTH_LIMIT: usize = 6;

thread_local! {
    static TASK_KEY_HASH: Cell<u64> = Cell::new(0);
    static TASK_CALL_DEPTH: Cell<usize> = Cell::new(0);
}

/// Sentinel for an input that has never been touched.
const UNTOUCHED: i64 = i64::MAX;

pub(crate) type ErasedReducer = Box<dyn Fn(&mut (dyn Any + Send), ErasedValue) + Send + Sync>;
pub(crate) type TaskBody<K> = Box<dyn Fn(&K, Vec<Option<ErasedValue>>) + Send + Sync>;

pub(crate) struct ErasedPull<K> {
    pub get: Box<dyn Fn(&K) -> Option<ErasedValue> + Send + Sync>,
    pub owner: Box<dyn Fn(&K) -> Rank + Send + Sync>,
}

/// Per-input metadata fixed at wiring time.
#[doc(hidden)]
pub struct InputSlot<K: Key> {
    pub(crate) name: String,
    pub(crate) codec: ValueCodec,
    pub(crate) reducer: RwLock<Option<ErasedReducer>>,
    pub(crate) static_size: AtomicUsize,
    pub(crate) pull: Option<ErasedPull<K>>,
}

impl<K: Key> InputSlot<K> {
    pub(crate) fn from_terminal<V: Datum>(terminal: &In<K, V>) -> Self {
        let pull = terminal.pull_spec().map(|spec| {
            let get = spec.get.clone();
            let owner = spec.owner.clone();
            ErasedPull {
                get: Box::new(move |key: &K| get(key).map(|v| Box::new(v) as ErasedValue)),
                owner: Box::new(move |key: &K| owner(key)),
            }
        });
        Self {
            name: terminal.name().to_string(),
            codec: ValueCodec::of::<V>(),
            reducer: RwLock::new(None),
            static_size: AtomicUsize::new(0),
            pull,
        }
    }
}

/// Accumulation state for one `(template, key)` pair.
///
/// `nargs[i]` tracks expected-minus-received for input `i`: the
/// [`UNTOUCHED`] sentinel until the first touch, `0` once finalized, a
/// positive count for the remainder of a bounded stream, and a negative
/// provisional tally while an unbounded stream's size is still unknown.
struct Pending<K> {
    key: K,
    counter: usize,
    nargs: Vec<i64>,
    stream_size: Vec<usize>,
    slots: Vec<Option<ErasedValue>>,
    pull_invoked: bool,
    prio: i32,
}

impl<K> Pending<K> {
    fn new(key: K, arity: usize, prio: i32) -> Self {
        Self {
            key,
            counter: arity,
            nargs: vec![UNTOUCHED; arity],
            stream_size: vec![0; arity],
            slots: (0..arity).map(|_| None).collect(),
            pull_invoked: false,
            prio,
        }
    }
}

type Cache<K> = HashMap<K, Arc<Mutex<Pending<K>>>, ahash::RandomState>;
type KeymapFn<K> = Arc<dyn Fn(&K) -> Rank + Send + Sync>;
type PriomapFn<K> = Arc<dyn Fn(&K) -> i32 + Send + Sync>;

/// The engine behind a [`TaskTemplate`](crate::TaskTemplate).
#[doc(hidden)]
pub struct TtCore<K: Key> {
    me: Weak<TtCore<K>>,
    name: String,
    world: World,
    object: OnceLock<ObjectId>,
    keymap: RwLock<KeymapFn<K>>,
    priomap: RwLock<PriomapFn<K>>,
    inputs: OnceLock<Vec<InputSlot<K>>>,
    num_pull_inputs: AtomicUsize,
    lazy_pull: AtomicBool,
    executable: AtomicBool,
    cache: Mutex<Cache<K>>,
    body: OnceLock<TaskBody<K>>,
    successors: Mutex<Vec<Weak<dyn TtNode>>>,
}

impl<K: Key> TtCore<K> {
    pub(crate) fn new(me: Weak<TtCore<K>>, name: &str, world: World) -> Self {
        let size = world.size();
        Self {
            me,
            name: name.to_string(),
            world,
            object: OnceLock::new(),
            keymap: RwLock::new(Arc::new(move |key: &K| {
                (stable_hash(key) % size as u64) as Rank
            })),
            priomap: RwLock::new(Arc::new(|_: &K| 0)),
            inputs: OnceLock::new(),
            num_pull_inputs: AtomicUsize::new(0),
            lazy_pull: AtomicBool::new(false),
            executable: AtomicBool::new(false),
            cache: Mutex::new(HashMap::with_hasher(cache_hasher())),
            body: OnceLock::new(),
            successors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn world(&self) -> &World {
        &self.world
    }

    pub(crate) fn init_inputs(&self, slots: Vec<InputSlot<K>>) {
        let pulls = slots.iter().filter(|s| s.pull.is_some()).count();
        self.num_pull_inputs.store(pulls, Ordering::Release);
        if self.inputs.set(slots).is_err() {
            panic!("task template `{}`: inputs initialized twice", self.name);
        }
    }

    pub(crate) fn install_body(&self, body: TaskBody<K>) {
        if self.body.set(body).is_err() {
            panic!("task template `{}`: body installed twice", self.name);
        }
    }

    pub(crate) fn set_object(&self, object: ObjectId) {
        let _ = self.object.set(object);
    }

    fn object_id(&self) -> ObjectId {
        *self.object.get().expect("template registered with its world")
    }

    pub(crate) fn inputs(&self) -> &[InputSlot<K>] {
        self.inputs.get().expect("template inputs initialized")
    }

    pub(crate) fn arity(&self) -> usize {
        self.inputs().len()
    }

    fn num_pulls(&self) -> usize {
        self.num_pull_inputs.load(Ordering::Acquire)
    }

    pub(crate) fn set_keymap(&self, keymap: KeymapFn<K>) {
        *self.keymap.write().unwrap() = keymap;
    }

    pub(crate) fn set_priomap(&self, priomap: PriomapFn<K>) {
        *self.priomap.write().unwrap() = priomap;
    }

    pub(crate) fn set_lazy_pull(&self, lazy: bool) {
        self.lazy_pull.store(lazy, Ordering::Release);
    }

    fn is_lazy_pull(&self) -> bool {
        self.lazy_pull.load(Ordering::Acquire)
    }

    pub(crate) fn set_reducer(&self, index: usize, reducer: ErasedReducer) {
        *self.inputs()[index].reducer.write().unwrap() = Some(reducer);
    }

    /// Declares a template-wide stream size for input `index`, used when a
    /// pending record has no per-key size.
    pub(crate) fn set_static_argstream_size(&self, index: usize, size: usize) {
        assert!(size > 0, "static stream size must be positive");
        assert!(
            self.inputs()[index].reducer.read().unwrap().is_some(),
            "task template `{}`: set_static_argstream_size on non-streaming input {index}",
            self.name
        );
        let previous = self.inputs()[index].static_size.swap(size, Ordering::AcqRel);
        if previous > 0 {
            protocol_abort(
                self.world.rank(),
                &ProtocolError::StreamAlreadyBounded {
                    index,
                    key: "<static>".into(),
                },
            );
        }
    }

    pub(crate) fn owner_of(&self, key: &K) -> Rank {
        (self.keymap.read().unwrap())(key)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub(crate) fn assert_executable(&self) {
        if !self.executable.load(Ordering::Acquire) {
            protocol_abort(
                self.world.rank(),
                &ProtocolError::NotExecutable {
                    tt: self.name.clone(),
                },
            );
        }
    }

    fn encode_key(&self, key: &K) -> Vec<u8> {
        encode_value(key).unwrap_or_else(|e| protocol_abort(self.world.rank(), &e))
    }

    fn key_display(key: &K) -> String {
        format!("{key:?}")
    }

    fn acquire(&self, key: &K) -> (Arc<Mutex<Pending<K>>>, bool) {
        let mut cache = self.cache.lock().unwrap();
        match cache.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let prio = (self.priomap.read().unwrap())(key);
                let record = Arc::new(Mutex::new(Pending::new(key.clone(), self.arity(), prio)));
                entry.insert(record.clone());
                (record, true)
            }
        }
    }

    /// Accumulates one argument for input `index` under `key`.
    ///
    /// On a non-owning rank the value is serialized and forwarded; on the
    /// owner it lands in the pending record, folded through the input's
    /// reducer when one is installed.
    pub(crate) fn set_arg(&self, index: usize, key: &K, value: ErasedValue) {
        let rank = self.world.rank();
        let owner = self.owner_of(key);
        if owner != rank {
            trace!(rank, tt = %self.name, key = ?key, index, "forwarding argument to owner");
            let bytes = self.inputs()[index]
                .codec
                .encode(value.as_ref())
                .unwrap_or_else(|e| protocol_abort(rank, &e));
            self.world.send_am(
                owner,
                Envelope {
                    object: self.object_id(),
                    op: AmOp::SetArg {
                        index,
                        key: self.encode_key(key),
                        value: bytes,
                    },
                },
            );
            return;
        }

        trace!(rank, tt = %self.name, key = ?key, index, "received argument");
        let (record, created) = self.acquire(key);
        let mut guard = record.lock().unwrap();
        if created && !self.is_lazy_pull() && self.num_pulls() > 0 {
            self.deliver_pull_values(key, &mut guard);
        }
        if guard.nargs[index] == 0 {
            protocol_abort(
                rank,
                &ProtocolError::StreamFinalized {
                    index,
                    key: Self::key_display(key),
                },
            );
        }

        let slot = &self.inputs()[index];
        let reducer = slot.reducer.read().unwrap();
        if let Some(reduce) = reducer.as_ref() {
            if guard.nargs[index] == UNTOUCHED {
                // First datum seeds the storage; the expected count comes
                // from the per-key size, the template-wide size, or stays
                // unbounded awaiting finalize.
                let bound = if guard.stream_size[index] != 0 {
                    guard.stream_size[index]
                } else {
                    let size = slot.static_size.load(Ordering::Acquire);
                    if size != 0 {
                        guard.stream_size[index] = size;
                    }
                    size
                };
                guard.nargs[index] = bound as i64;
                guard.slots[index] = Some(value);
            } else {
                let accumulator = guard.slots[index]
                    .as_mut()
                    .expect("streaming slot seeded by first datum")
                    .as_mut();
                reduce(accumulator, value);
            }
            guard.nargs[index] -= 1;
            if guard.nargs[index] == 0 {
                guard.counter -= 1;
            }
        } else {
            guard.slots[index] = Some(value);
            guard.nargs[index] = 0;
            guard.counter -= 1;
        }
        drop(reducer);

        self.finish_update(key, &record, guard);
    }

    /// Declares a bounded stream length for input `index` under `key`.
    pub(crate) fn set_argstream_size(&self, index: usize, key: &K, size: usize) {
        assert!(
            self.inputs()[index].reducer.read().unwrap().is_some(),
            "task template `{}`: set_argstream_size on non-streaming input {index}",
            self.name
        );
        assert!(size > 0, "stream size must be positive");
        let rank = self.world.rank();
        let owner = self.owner_of(key);
        if owner != rank {
            self.world.send_am(
                owner,
                Envelope {
                    object: self.object_id(),
                    op: AmOp::SetStreamSize {
                        index,
                        key: self.encode_key(key),
                        size,
                    },
                },
            );
            return;
        }

        trace!(rank, tt = %self.name, key = ?key, index, size, "bounding stream");
        let (record, _) = self.acquire(key);
        let mut guard = record.lock().unwrap();
        if guard.stream_size[index] > 0 {
            protocol_abort(
                rank,
                &ProtocolError::StreamAlreadyBounded {
                    index,
                    key: Self::key_display(key),
                },
            );
        }
        if guard.nargs[index] == 0 {
            protocol_abort(
                rank,
                &ProtocolError::StreamFinalized {
                    index,
                    key: Self::key_display(key),
                },
            );
        }
        guard.stream_size[index] = size;
        if guard.nargs[index] != UNTOUCHED {
            // Messages arrived before the bound: the provisional tally is
            // negative and must not already exceed the declared size.
            let received = -guard.nargs[index];
            if received > size as i64 {
                protocol_abort(
                    rank,
                    &ProtocolError::StreamOverrun {
                        index,
                        key: Self::key_display(key),
                    },
                );
            }
            guard.nargs[index] += size as i64;
            if guard.nargs[index] == 0 {
                guard.counter -= 1;
            }
        }
        self.finish_stream_update(key, &record, guard);
    }

    /// Terminates the unbounded stream on input `index` under `key`.
    pub(crate) fn finalize_argstream(&self, index: usize, key: &K) {
        assert!(
            self.inputs()[index].reducer.read().unwrap().is_some(),
            "task template `{}`: finalize_argstream on non-streaming input {index}",
            self.name
        );
        let rank = self.world.rank();
        let owner = self.owner_of(key);
        if owner != rank {
            self.world.send_am(
                owner,
                Envelope {
                    object: self.object_id(),
                    op: AmOp::FinalizeStream {
                        index,
                        key: self.encode_key(key),
                    },
                },
            );
            return;
        }

        trace!(rank, tt = %self.name, key = ?key, index, "finalizing stream");
        let record = match self.cache.lock().unwrap().get(key) {
            Some(record) => record.clone(),
            None => panic!(
                "task template `{}`: finalize_argstream for key {:?} before any value arrived",
                self.name, key
            ),
        };
        let mut guard = record.lock().unwrap();
        if guard.stream_size[index] > 0 {
            protocol_abort(
                rank,
                &ProtocolError::FinalizeBounded {
                    index,
                    key: Self::key_display(key),
                },
            );
        }
        if guard.nargs[index] == 0 {
            protocol_abort(
                rank,
                &ProtocolError::StreamFinalized {
                    index,
                    key: Self::key_display(key),
                },
            );
        }
        guard.nargs[index] = 0;
        guard.counter -= 1;
        self.finish_stream_update(key, &record, guard);
    }

    /// Seeds a task that has no push inputs: either a zero-arity template
    /// or one whose every input is a pull input.
    pub(crate) fn seed(&self, key: &K) {
        let rank = self.world.rank();
        let owner = self.owner_of(key);
        if owner != rank {
            self.world.send_am(
                owner,
                Envelope {
                    object: self.object_id(),
                    op: AmOp::Seed {
                        key: self.encode_key(key),
                    },
                },
            );
            return;
        }
        trace!(rank, tt = %self.name, key = ?key, "seeding task");
        let (record, created) = self.acquire(key);
        let mut guard = record.lock().unwrap();
        if created && !self.is_lazy_pull() && self.num_pulls() > 0 {
            self.deliver_pull_values(key, &mut guard);
        }
        self.finish_update(key, &record, guard);
    }

    /// Queries every pull input: local containers are read directly into
    /// the record, remote ones receive a pull request whose answer comes
    /// back as a normal `set_arg`.
    fn deliver_pull_values(&self, key: &K, guard: &mut Pending<K>) {
        let rank = self.world.rank();
        for (index, slot) in self.inputs().iter().enumerate() {
            let Some(pull) = &slot.pull else { continue };
            let owner = (pull.owner)(key);
            if owner == rank {
                if guard.nargs[index] == 0 {
                    protocol_abort(
                        rank,
                        &ProtocolError::StreamFinalized {
                            index,
                            key: Self::key_display(key),
                        },
                    );
                }
                match (pull.get)(key) {
                    Some(value) => {
                        guard.slots[index] = Some(value);
                        guard.nargs[index] = 0;
                        guard.counter -= 1;
                    }
                    None => protocol_abort(
                        rank,
                        &ProtocolError::ContainerMiss {
                            index,
                            key: Self::key_display(key),
                        },
                    ),
                }
            } else {
                trace!(rank, tt = %self.name, key = ?key, index, owner, "requesting pull value");
                self.world.send_am(
                    owner,
                    Envelope {
                        object: self.object_id(),
                        op: AmOp::PullRequest {
                            index,
                            key: self.encode_key(key),
                        },
                    },
                );
            }
        }
        guard.pull_invoked = true;
    }

    /// Container-owner side of the pull protocol: read locally and ship
    /// the value to the task's owning rank.
    fn handle_pull_request(&self, index: usize, key: &K) {
        let rank = self.world.rank();
        let slot = &self.inputs()[index];
        let pull = match &slot.pull {
            Some(pull) => pull,
            None => panic!(
                "task template `{}`: pull request for non-pull input {index}",
                self.name
            ),
        };
        let value = match (pull.get)(key) {
            Some(value) => value,
            None => protocol_abort(
                rank,
                &ProtocolError::ContainerMiss {
                    index,
                    key: Self::key_display(key),
                },
            ),
        };
        let dst = self.owner_of(key);
        if dst == rank {
            self.set_arg(index, key, value);
        } else {
            let bytes = slot
                .codec
                .encode(value.as_ref())
                .unwrap_or_else(|e| protocol_abort(rank, &e));
            self.world.send_am(
                dst,
                Envelope {
                    object: self.object_id(),
                    op: AmOp::SetArg {
                        index,
                        key: self.encode_key(key),
                        value: bytes,
                    },
                },
            );
        }
    }

    /// Tail of a `set_arg`/`seed` update: fire lazy pulls once only the
    /// pull inputs remain, and launch the task when the record completes.
    fn finish_update(
        &self,
        key: &K,
        record: &Arc<Mutex<Pending<K>>>,
        mut guard: MutexGuard<'_, Pending<K>>,
    ) {
        let pulls = self.num_pulls();
        if pulls > 0 && self.is_lazy_pull() && !guard.pull_invoked && guard.counter == pulls {
            self.deliver_pull_values(key, &mut guard);
        }
        if guard.counter == 0 {
            drop(guard);
            self.cache.lock().unwrap().remove(key);
            trace!(rank = self.world.rank(), tt = %self.name, key = ?key, "task ready");
            self.launch(record.clone());
        }
    }

    /// Tail of a stream-control update. A task made ready by a size
    /// declaration or a finalize is always handed to the task queue; the
    /// inline short-circuit applies only to argument arrival.
    fn finish_stream_update(
        &self,
        key: &K,
        record: &Arc<Mutex<Pending<K>>>,
        mut guard: MutexGuard<'_, Pending<K>>,
    ) {
        let pulls = self.num_pulls();
        if pulls > 0 && self.is_lazy_pull() && !guard.pull_invoked && guard.counter == pulls {
            self.deliver_pull_values(key, &mut guard);
        }
        if guard.counter == 0 {
            drop(guard);
            self.cache.lock().unwrap().remove(key);
            trace!(rank = self.world.rank(), tt = %self.name, key = ?key, "task ready");
            self.enqueue(record.clone());
        }
    }

    /// Inline-vs-enqueue choice. A task whose key hashes like the one
    /// already running on this thread short-circuits onto the current
    /// stack, bounded by [`INLINE_CALL_DEPTH_LIMIT`].
    fn launch(&self, record: Arc<Mutex<Pending<K>>>) {
        let hash = stable_hash(&record.lock().unwrap().key);
        let inline = TASK_KEY_HASH.with(|h| h.get()) == hash
            && TASK_CALL_DEPTH.with(|d| d.get()) < INLINE_CALL_DEPTH_LIMIT;
        if inline {
            TASK_CALL_DEPTH.with(|d| d.set(d.get() + 1));
            self.execute_record(&record);
            TASK_CALL_DEPTH.with(|d| d.set(d.get() - 1));
        } else {
            self.enqueue(record);
        }
    }

    fn enqueue(&self, record: Arc<Mutex<Pending<K>>>) {
        let prio = record.lock().unwrap().prio;
        let me = self.me.clone();
        self.world.submit(prio, move || match me.upgrade() {
            Some(core) => core.run_task(record),
            None => trace!("task template dropped before its task ran"),
        });
    }

    fn run_task(&self, record: Arc<Mutex<Pending<K>>>) {
        let hash = stable_hash(&record.lock().unwrap().key);
        TASK_KEY_HASH.with(|h| h.set(hash));
        TASK_CALL_DEPTH.with(|d| d.set(d.get() + 1));
        self.execute_record(&record);
        TASK_CALL_DEPTH.with(|d| d.set(d.get() - 1));
    }

    fn execute_record(&self, record: &Arc<Mutex<Pending<K>>>) {
        let (key, slots) = {
            let mut guard = record.lock().unwrap();
            (guard.key.clone(), std::mem::take(&mut guard.slots))
        };
        let body = self.body.get().expect("task body installed before execution");
        trace!(rank = self.world.rank(), tt = %self.name, key = ?key, "running task body");
        body(&key, slots);
    }
}

impl<K: Key> AmTarget for TtCore<K> {
    fn deliver(self: Arc<Self>, op: AmOp) {
        let rank = self.world.rank();
        let decode_key = |bytes: &[u8]| -> K {
            crate::codec::decode_value(bytes).unwrap_or_else(|e| protocol_abort(rank, &e))
        };
        match op {
            AmOp::SetArg { index, key, value } => {
                let key = decode_key(&key);
                let value = self.inputs()[index]
                    .codec
                    .decode(&value)
                    .unwrap_or_else(|e| protocol_abort(rank, &e));
                self.set_arg(index, &key, value);
            }
            AmOp::SetStreamSize { index, key, size } => {
                self.set_argstream_size(index, &decode_key(&key), size);
            }
            AmOp::FinalizeStream { index, key } => {
                self.finalize_argstream(index, &decode_key(&key));
            }
            AmOp::PullRequest { index, key } => {
                self.handle_pull_request(index, &decode_key(&key));
            }
            AmOp::Seed { key } => {
                self.seed(&decode_key(&key));
            }
        }
    }
}

impl<K: Key> TtNode for TtCore<K> {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn make_executable(&self) {
        trace!(rank = self.world.rank(), tt = %self.name, "template made executable");
        self.executable.store(true, Ordering::Release);
    }

    fn is_executable(&self) -> bool {
        self.executable.load(Ordering::Acquire)
    }

    fn successors(&self) -> Vec<Weak<dyn TtNode>> {
        self.successors.lock().unwrap().clone()
    }

    fn add_successor(&self, successor: Weak<dyn TtNode>) {
        self.successors.lock().unwrap().push(successor);
    }
}

impl<K: Key> Drop for TtCore<K> {
    fn drop(&mut self) {
        let cache = self.cache.get_mut().unwrap();
        if cache.is_empty() {
            return;
        }
        // Unexecuted tasks at teardown are a bug; dump what each record
        // was still waiting for, then abort.
        error!(
            rank = self.world.rank(),
            tt = %self.name,
            pending = cache.len(),
            "template destroyed with unexecuted tasks (T = assigned, F = missing)"
        );
        for (printed, (key, record)) in cache.iter().enumerate() {
            if printed >= 10 {
                error!("  ...");
                break;
            }
            let guard = record.lock().unwrap();
            let flags: String = guard
                .nargs
                .iter()
                .map(|&n| if n == 0 { 'T' } else { 'F' })
                .collect();
            error!(key = ?key, inputs = %flags, "  unexecuted task");
        }
        std::process::abort();
    }
}
