//! Keyed dataflow task-graph runtime.
//!
//! Users declare a directed graph of *task templates* connected by typed
//! [`Edge`]s, then execute it across a process group by sending keyed data
//! into the graph. For each key flowing through an edge the runtime locates
//! the owning rank, accumulates the arguments the task needs, runs the user
//! body exactly once with the complete set, and retires the task.
//!
//! # Model
//!
//! - **Templates** ([`TaskTemplate`], built with [`make_tt`]) materialize
//!   one task instance per key. A keymap decides which rank owns each key;
//!   arguments sent from elsewhere are serialized and shipped there.
//! - **Terminals** ([`In`], [`Out`]) are the typed endpoints on a template.
//!   Owned sends are steered to at most one consuming peer, so a value
//!   with a single consumer is never cloned.
//! - **Streams**: an input with a reducer accepts many messages per key,
//!   folded as they arrive; the stream completes after a declared size or
//!   an explicit finalize.
//! - **Pull edges** ([`Edge::pull`]) let a task fetch an input from a user
//!   container on whatever rank holds it, instead of waiting for a push.
//! - **Quiescence**: [`fence`] returns once no messages are in flight and
//!   no tasks are pending anywhere in the group.
//!
//! # Example
//!
//! ```rust,ignore
//! use keyflow::prelude::*;
//!
//! let world = keyflow::initialize(2);
//! let numbers = Edge::<u64, i64>::new("numbers");
//!
//! let sink = make_tt(
//!     |key: &u64, total: i64, _outs: &()| println!("{key}: {total}"),
//!     (numbers.clone(),),
//!     (),
//!     "sink",
//!     &["numbers"],
//!     &[],
//!     &world,
//! )?;
//! sink.set_input_reducer::<i64>(0, |acc, v| *acc += v);
//! sink.set_static_argstream_size(0, 4);
//!
//! make_graph_executable(&sink);
//! for v in [1, 2, 3, 4] {
//!     sink.invoke_with(0, (v,));
//! }
//! keyflow::fence();
//! keyflow::finalize();
//! ```
//!
//! Multi-rank execution uses the same code inside
//! [`testing::LocalCluster::run`], which hands each rank its own [`World`].

use std::cell::RefCell;

mod codec;
mod edge;
mod error;
mod graph;
mod key;
mod template;
mod terminal;
pub mod testing;
mod world;

pub use edge::Edge;
pub use error::{GraphError, ProtocolError};
pub use graph::{graph_dot, make_graph_executable, AsTtNode, TtNode};
pub use key::{stable_hash, Datum, Key};
pub use template::{make_tt, make_tt_tpl, InputEdges, OutputEdges, TaskFn, TaskTemplate};
pub use terminal::{In, Out, TerminalMode};
pub use world::{Rank, World};

pub mod prelude {
    pub use crate::testing::LocalCluster;
    pub use crate::{
        graph_dot, make_graph_executable, make_tt, make_tt_tpl, Datum, Edge, GraphError, In, Key,
        Out, Rank, TaskTemplate, TerminalMode, World,
    };
}

thread_local! {
    static DEFAULT_WORLD: RefCell<Option<World>> = RefCell::new(None);
}

pub(crate) fn set_default_world(world: World) {
    DEFAULT_WORLD.with(|w| *w.borrow_mut() = Some(world));
}

pub(crate) fn clear_default_world() {
    DEFAULT_WORLD.with(|w| *w.borrow_mut() = None);
}

/// Starts a single-rank runtime with `num_threads` workers and installs it
/// as this thread's default execution context.
///
/// Multi-rank groups are created with [`testing::LocalCluster`], which
/// installs the default context on each rank thread itself.
pub fn initialize(num_threads: usize) -> World {
    let threads = num_threads.max(1);
    let (mut worlds, _) = world::create_group(1, threads);
    let world = worlds.remove(0);
    set_default_world(world.clone());
    world
}

/// The world installed for the current thread.
///
/// Panics if neither [`initialize`] nor a cluster rank installed one.
pub fn default_execution_context() -> World {
    DEFAULT_WORLD.with(|w| w.borrow().clone()).unwrap_or_else(|| {
        panic!("no default world: call initialize() or run inside LocalCluster::run")
    })
}

/// Rank of the current thread's world.
pub fn rank() -> Rank {
    default_execution_context().rank()
}

/// Size of the current thread's world.
pub fn size() -> usize {
    default_execution_context().size()
}

/// Tasks execute eagerly as their arguments complete; this hook exists for
/// symmetry with [`initialize`]/[`finalize`] and performs no work.
pub fn execute() {}

/// Global quiescence barrier over the current thread's world.
pub fn fence() {
    default_execution_context().fence();
}

/// Tears down the runtime installed by [`initialize`]: drains remaining
/// work, runs teardown hooks, drops registered templates and stops the
/// workers.
pub fn finalize() {
    let taken = DEFAULT_WORLD.with(|w| w.borrow_mut().take());
    if let Some(world) = taken {
        world.fence();
        world.destroy_rank();
        if world.size() == 1 {
            world.shared().shutdown_workers();
        }
    }
}

/// Terminates the whole process group immediately.
pub fn abort() -> ! {
    tracing::error!("aborting process group");
    std::process::abort();
}
