//! The process-group substrate.
//!
//! A [`World`] is one rank's handle onto a process group: it knows the
//! group size, its own rank, and how to ship an active message to a
//! registered object on another rank. The dispatch core is written against
//! this interface only.
//!
//! The substrate shipped here runs the group inside one process: each rank
//! is a user thread plus a small worker pool, and active messages travel
//! through lock-free mailboxes serialized by value, exactly as they would
//! across processes. Delivery is exactly-once and unordered; [`World::fence`]
//! provides the global quiescence barrier the core relies on.

mod executor;

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Barrier, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use crossbeam_utils::{Backoff, CachePadded};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::codec::{decode_value, encode_value};
use crate::error::ProtocolError;
use executor::TaskQueue;

/// Rank of a process within its group.
pub type Rank = usize;

/// Identifier of a registered world object, identical on every rank.
pub(crate) type ObjectId = u64;

/// Operations shipped between ranks on behalf of a task template.
pub(crate) enum AmOp {
    SetArg {
        index: usize,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    SetStreamSize {
        index: usize,
        key: Vec<u8>,
        size: usize,
    },
    FinalizeStream {
        index: usize,
        key: Vec<u8>,
    },
    PullRequest {
        index: usize,
        key: Vec<u8>,
    },
    Seed {
        key: Vec<u8>,
    },
}

pub(crate) struct Envelope {
    pub object: ObjectId,
    pub op: AmOp,
}

/// A world object that can receive active messages.
///
/// Implementations must tolerate arbitrary delivery order; each envelope is
/// delivered exactly once.
pub(crate) trait AmTarget: Send + Sync {
    fn deliver(self: Arc<Self>, op: AmOp);
}

struct Teardown {
    keep_alive: Vec<Box<dyn Any + Send>>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
    statuses: Vec<Arc<AtomicBool>>,
}

struct RankState {
    mailbox: SegQueue<Envelope>,
    registry: RwLock<Vec<Arc<dyn AmTarget>>>,
    queue: TaskQueue,
    teardown: Mutex<Teardown>,
}

impl RankState {
    fn new() -> Self {
        Self {
            mailbox: SegQueue::new(),
            registry: RwLock::new(Vec::new()),
            queue: TaskQueue::default(),
            teardown: Mutex::new(Teardown {
                keep_alive: Vec::new(),
                callbacks: Vec::new(),
                statuses: Vec::new(),
            }),
        }
    }
}

pub(crate) struct Shared {
    size: usize,
    /// Outstanding envelopes plus queued/running tasks across all ranks.
    /// Quiescence is `activity == 0` once every user thread sits in `fence`.
    activity: CachePadded<AtomicI64>,
    shutdown: AtomicBool,
    fence_gate: Barrier,
    bcast_slot: Mutex<Option<Vec<u8>>>,
    ranks: Vec<RankState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn shutdown_workers(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// One rank's handle onto its process group.
#[derive(Clone)]
pub struct World {
    rank: Rank,
    shared: Arc<Shared>,
}

impl World {
    /// This rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Registers an active-message target and returns its group-wide id.
    ///
    /// Registration order must be identical on every rank; the id is the
    /// registration index. Envelopes that arrive before the target exists
    /// are requeued until it does.
    pub(crate) fn register_object(&self, target: Arc<dyn AmTarget>) -> ObjectId {
        let mut registry = self.shared.ranks[self.rank].registry.write().unwrap();
        registry.push(target);
        (registry.len() - 1) as ObjectId
    }

    /// Ships an envelope to `dst`. Counted as outstanding activity until a
    /// worker on `dst` has finished delivering it.
    pub(crate) fn send_am(&self, dst: Rank, env: Envelope) {
        debug_assert!(dst < self.shared.size);
        trace!(src = self.rank, dst, object = env.object, "active message");
        self.shared.activity.fetch_add(1, Ordering::AcqRel);
        self.shared.ranks[dst].mailbox.push(env);
    }

    /// Hands a ready task to this rank's worker pool.
    pub(crate) fn submit(&self, prio: i32, job: impl FnOnce() + Send + 'static) {
        self.shared.activity.fetch_add(1, Ordering::AcqRel);
        self.shared.ranks[self.rank].queue.push(prio, Box::new(job));
    }

    /// Global quiescence barrier.
    ///
    /// Collective: every rank's user thread must call it. Returns once no
    /// messages are in flight and no tasks are queued or running anywhere
    /// in the group.
    pub fn fence(&self) {
        self.shared.fence_gate.wait();
        // With all user threads parked here, new activity can only be born
        // from existing activity, so a zero reading is stable.
        let backoff = Backoff::new();
        while self.shared.activity.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        self.shared.fence_gate.wait();
    }

    /// Collective broadcast of a serializable value from `source`.
    pub fn broadcast_serializable<T>(&self, value: T, source: Rank) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        self.shared.fence_gate.wait();
        if self.rank == source {
            let bytes = encode_value(&value).unwrap_or_else(|e| protocol_abort(self.rank, &e));
            *self.shared.bcast_slot.lock().unwrap() = Some(bytes);
        }
        self.shared.fence_gate.wait();
        let result = if self.rank == source {
            value
        } else {
            let slot = self.shared.bcast_slot.lock().unwrap();
            let bytes = slot.as_ref().expect("broadcast slot populated by source");
            decode_value(bytes).unwrap_or_else(|e| protocol_abort(self.rank, &e))
        };
        self.shared.fence_gate.wait();
        if self.rank == source {
            *self.shared.bcast_slot.lock().unwrap() = None;
        }
        result
    }

    /// Keeps `ptr` alive until this rank is torn down.
    pub fn register_ptr<T: Any + Send>(&self, ptr: T) {
        self.teardown().keep_alive.push(Box::new(ptr));
    }

    /// Flips `status` to true when this rank is torn down.
    pub fn register_status(&self, status: Arc<AtomicBool>) {
        self.teardown().statuses.push(status);
    }

    /// Runs `callback` when this rank is torn down.
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.teardown().callbacks.push(Box::new(callback));
    }

    fn teardown(&self) -> std::sync::MutexGuard<'_, Teardown> {
        self.shared.ranks[self.rank].teardown.lock().unwrap()
    }

    /// Tears down this rank: runs teardown hooks and drops every registered
    /// object. Templates with unretired tasks abort here.
    pub(crate) fn destroy_rank(&self) {
        let mut teardown = std::mem::replace(
            &mut *self.teardown(),
            Teardown {
                keep_alive: Vec::new(),
                callbacks: Vec::new(),
                statuses: Vec::new(),
            },
        );
        for callback in teardown.callbacks.drain(..) {
            callback();
        }
        for status in teardown.statuses.drain(..) {
            status.store(true, Ordering::Release);
        }
        self.shared.ranks[self.rank].registry.write().unwrap().clear();
        teardown.keep_alive.clear();
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

/// Rank-prefixed diagnostic for unrecoverable protocol violations.
pub(crate) fn protocol_abort(rank: Rank, err: &ProtocolError) -> ! {
    tracing::error!(rank, %err, "argument protocol violation");
    panic!("rank {rank}: {err}");
}

/// A panic escaping a task body or message handler is fatal to the whole
/// group: letting the worker die would leave the quiescence counter stuck
/// and hang every rank in `fence`.
fn fatal_on_panic(run: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(run)).is_err() {
        tracing::error!("panic escaped a task body; aborting process group");
        std::process::abort();
    }
}

/// Creates a process group of `size` ranks, each with `threads_per_rank`
/// workers, and returns one [`World`] handle per rank.
pub(crate) fn create_group(size: usize, threads_per_rank: usize) -> (Vec<World>, Arc<Shared>) {
    assert!(size > 0, "a process group needs at least one rank");
    assert!(threads_per_rank > 0, "each rank needs at least one worker");
    let shared = Arc::new(Shared {
        size,
        activity: CachePadded::new(AtomicI64::new(0)),
        shutdown: AtomicBool::new(false),
        fence_gate: Barrier::new(size),
        bcast_slot: Mutex::new(None),
        ranks: (0..size).map(|_| RankState::new()).collect(),
        workers: Mutex::new(Vec::new()),
    });

    let mut handles = Vec::with_capacity(size * threads_per_rank);
    for rank in 0..size {
        for worker in 0..threads_per_rank {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("keyflow-r{rank}w{worker}"))
                .spawn(move || worker_loop(shared, rank))
                .expect("spawn worker thread");
            handles.push(handle);
        }
    }
    *shared.workers.lock().unwrap() = handles;

    let worlds = (0..size)
        .map(|rank| World {
            rank,
            shared: shared.clone(),
        })
        .collect();
    (worlds, shared)
}

fn worker_loop(shared: Arc<Shared>, rank: Rank) {
    // Task bodies run here; give them the same default execution context
    // their rank's user thread has.
    crate::set_default_world(World {
        rank,
        shared: shared.clone(),
    });
    let state = &shared.ranks[rank];
    let backoff = Backoff::new();
    loop {
        if let Some(job) = state.queue.try_pop() {
            backoff.reset();
            fatal_on_panic(|| job.run());
            shared.activity.fetch_sub(1, Ordering::AcqRel);
            continue;
        }
        if let Some(env) = state.mailbox.pop() {
            let target = state.registry.read().unwrap().get(env.object as usize).cloned();
            match target {
                Some(target) => {
                    backoff.reset();
                    fatal_on_panic(|| target.deliver(env.op));
                    shared.activity.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    // Sender raced ahead of this rank's graph assembly;
                    // park the envelope until the object is registered.
                    state.mailbox.push(env);
                    backoff.snooze();
                }
            }
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if backoff.is_completed() {
            std::thread::sleep(Duration::from_micros(100));
        } else {
            backoff.snooze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        hits: AtomicUsize,
    }

    impl AmTarget for Probe {
        fn deliver(self: Arc<Self>, op: AmOp) {
            if let AmOp::Seed { key } = op {
                assert_eq!(key, vec![7]);
                self.hits.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    #[test]
    fn active_messages_reach_registered_objects() {
        let (worlds, shared) = create_group(2, 1);
        let probes: Vec<_> = worlds
            .iter()
            .map(|w| {
                let probe = Arc::new(Probe {
                    hits: AtomicUsize::new(0),
                });
                w.register_object(probe.clone());
                probe
            })
            .collect();

        worlds[0].send_am(
            1,
            Envelope {
                object: 0,
                op: AmOp::Seed { key: vec![7] },
            },
        );

        let handles: Vec<_> = worlds.iter().cloned().map(|w| std::thread::spawn(move || w.fence())).collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(probes[1].hits.load(Ordering::Acquire), 1);
        assert_eq!(probes[0].hits.load(Ordering::Acquire), 0);
        shared.shutdown_workers();
    }

    #[test]
    fn broadcast_round_trips_from_source() {
        let (worlds, shared) = create_group(3, 1);
        let handles: Vec<_> = worlds
            .into_iter()
            .map(|w| {
                std::thread::spawn(move || {
                    let seen = w.broadcast_serializable(
                        if w.rank() == 2 { vec![1u32, 2, 3] } else { Vec::new() },
                        2,
                    );
                    assert_eq!(seen, vec![1, 2, 3]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        shared.shutdown_workers();
    }
}
