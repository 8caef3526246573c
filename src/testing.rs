//! In-process multi-rank harness.
//!
//! [`LocalCluster`] runs the same closure once per rank, SPMD-style: each
//! rank gets its own [`World`] handle and builds its own copy of the graph,
//! exactly as processes would under a distributed substrate. Ranks are
//! threads, so tests can assert on state shared across the whole group.

use crate::world::{create_group, World};

/// An in-process process group for tests and examples.
///
/// ```rust,ignore
/// LocalCluster::new(2).run(|world| {
///     let edge = Edge::<u64, String>::new("data");
///     // ... build the same graph on every rank ...
///     keyflow::fence();
/// });
/// ```
pub struct LocalCluster {
    size: usize,
    threads_per_rank: usize,
}

impl LocalCluster {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            threads_per_rank: 2,
        }
    }

    /// Worker threads per rank (default 2).
    pub fn threads_per_rank(mut self, threads: usize) -> Self {
        self.threads_per_rank = threads;
        self
    }

    /// Runs `f` once per rank and tears the group down after a final
    /// collective fence. Returns once every rank has quiesced and every
    /// worker has stopped.
    pub fn run<F>(self, f: F)
    where
        F: Fn(World) + Send + Sync,
    {
        let (worlds, shared) = create_group(self.size, self.threads_per_rank);
        std::thread::scope(|scope| {
            for world in worlds {
                let f = &f;
                scope.spawn(move || {
                    crate::set_default_world(world.clone());
                    f(world.clone());
                    world.fence();
                    world.destroy_rank();
                    crate::clear_default_world();
                });
            }
        });
        shared.shutdown_workers();
    }
}
