//! Edge descriptors: deferred, fusable connectivity between terminals.
//!
//! An [`Edge`] is a shallow-copy handle over one or more shared segments.
//! Wiring is lazy: producers are recorded with [`Edge::set_in`] and
//! consumers with [`Edge::set_out`], and each terminal is connected to the
//! opposite side the moment both exist. Fusing edges concatenates their
//! segment lists, so a send on any fused producer reaches every consumer
//! of every sibling.
//!
//! A pull edge carries no pushed values at all; instead it equips its
//! consuming terminals with container access (`get` and `owner` closures)
//! that the dispatch core queries on demand.

use std::sync::{Arc, Mutex};

use tracing::{error, trace};

use crate::error::GraphError;
use crate::key::{Datum, Key};
use crate::terminal::{In, Out, PullSpec};
use crate::world::Rank;

struct SegmentSides<K: Key, V: Datum> {
    producers: Vec<Out<K, V>>,
    consumers: Vec<In<K, V>>,
}

struct EdgeSegment<K: Key, V: Datum> {
    name: String,
    pull: Option<PullSpec<K, V>>,
    sides: Mutex<SegmentSides<K, V>>,
}

impl<K: Key, V: Datum> EdgeSegment<K, V> {
    fn new(name: &str, pull: Option<PullSpec<K, V>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            pull,
            sides: Mutex::new(SegmentSides {
                producers: Vec::new(),
                consumers: Vec::new(),
            }),
        })
    }

    fn set_in(&self, out: &Out<K, V>) {
        if self.pull.is_some() {
            out.mark_pull();
        }
        let mut sides = self.sides.lock().unwrap();
        if !sides.producers.is_empty() {
            trace!(edge = %self.name, "edge has multiple producers");
        }
        for input in sides.consumers.iter() {
            out.connect(input);
        }
        sides.producers.push(out.clone());
    }

    fn set_out(&self, input: &In<K, V>) {
        if let Some(pull) = &self.pull {
            input.set_pull(pull.clone());
        }
        let mut sides = self.sides.lock().unwrap();
        if !sides.consumers.is_empty() {
            trace!(edge = %self.name, "edge has multiple consumers");
        }
        for out in sides.producers.iter() {
            out.connect(input);
        }
        sides.consumers.push(input.clone());
    }
}

impl<K: Key, V: Datum> Drop for EdgeSegment<K, V> {
    fn drop(&mut self) {
        if self.pull.is_some() {
            return;
        }
        let sides = self.sides.get_mut().unwrap();
        if sides.producers.is_empty() != sides.consumers.is_empty() {
            error!(
                edge = %self.name,
                "edge dropped with only one side connected; the graph may be incomplete"
            );
        }
    }
}

/// A typed channel descriptor from output terminals to input terminals.
///
/// Handles are cheap to clone and share the underlying connectivity
/// record, so an edge may be captured once at graph-build time and wired
/// from several templates.
pub struct Edge<K: Key, V: Datum> {
    segments: Vec<Arc<EdgeSegment<K, V>>>,
    read_hint: bool,
}

impl<K: Key, V: Datum> std::fmt::Debug for Edge<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("segments", &self.segments.len())
            .field("read_hint", &self.read_hint)
            .finish()
    }
}

impl<K: Key, V: Datum> Clone for Edge<K, V> {
    fn clone(&self) -> Self {
        Self {
            segments: self.segments.clone(),
            read_hint: self.read_hint,
        }
    }
}

impl<K: Key, V: Datum> Edge<K, V> {
    /// A plain push edge.
    pub fn new(name: &str) -> Self {
        Self {
            segments: vec![EdgeSegment::new(name, None)],
            read_hint: false,
        }
    }

    /// A pull edge over a user container.
    ///
    /// `get` reads the container under a container key, `container_keymap`
    /// names the rank holding that key, and `mapper` translates a task key
    /// into the container key. The composed closures travel onto every
    /// consuming terminal wired to this edge.
    pub fn pull<CK, G, O, M>(name: &str, get: G, container_keymap: O, mapper: M) -> Self
    where
        CK: Send + Sync + 'static,
        G: Fn(&CK) -> Option<V> + Send + Sync + 'static,
        O: Fn(&CK) -> Rank + Send + Sync + 'static,
        M: Fn(&K) -> CK + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        let map_for_owner = mapper.clone();
        let spec = PullSpec {
            get: Arc::new(move |key: &K| get(&mapper(key))),
            owner: Arc::new(move |key: &K| container_keymap(&map_for_owner(key))),
        };
        Self {
            segments: vec![EdgeSegment::new(name, Some(spec))],
            read_hint: false,
        }
    }

    /// Fuses sibling edges into one descriptor. Sends on any fused
    /// producer then reach the consumers of every sibling. Pull edges do
    /// not participate in fusion.
    pub fn fuse(edges: impl IntoIterator<Item = Edge<K, V>>) -> Result<Self, GraphError> {
        let mut segments = Vec::new();
        for edge in edges {
            if edge.is_pull() {
                return Err(GraphError::InvalidEdgeFusion {
                    edge: edge.name().to_string(),
                });
            }
            segments.extend(edge.segments);
        }
        if segments.is_empty() {
            return Err(GraphError::EmptyFusion);
        }
        Ok(Self {
            segments,
            read_hint: false,
        })
    }

    /// A handle that declares read-only (non-consuming) use at the
    /// template it is wired into as an input.
    pub fn read_only(&self) -> Self {
        Self {
            segments: self.segments.clone(),
            read_hint: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.segments[0].name
    }

    pub fn is_pull(&self) -> bool {
        self.segments[0].pull.is_some()
    }

    pub(crate) fn read_hint(&self) -> bool {
        self.read_hint
    }

    /// Whether at least one producer has been attached.
    pub fn live(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !s.sides.lock().unwrap().producers.is_empty())
    }

    /// Attaches a producing output terminal.
    pub(crate) fn set_in(&self, out: &Out<K, V>) {
        for segment in &self.segments {
            segment.set_in(out);
        }
    }

    /// Attaches a consuming input terminal.
    pub(crate) fn set_out(&self, input: &In<K, V>) {
        for segment in &self.segments {
            segment.set_out(input);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::TerminalMode;

    #[test]
    fn fusing_a_pull_edge_is_rejected() {
        let push = Edge::<u64, u64>::new("push");
        let pull = Edge::<u64, u64>::pull("pull", |k: &u64| Some(*k), |_| 0, |k: &u64| *k);
        let err = Edge::fuse([push, pull]).unwrap_err();
        assert!(err.is_invalid_edge_fusion());
    }

    #[test]
    fn fusing_nothing_is_rejected() {
        assert!(Edge::<u64, u64>::fuse([]).unwrap_err().is_empty_fusion());
    }

    #[test]
    fn read_only_marks_the_handle_not_the_record() {
        let edge = Edge::<u64, u64>::new("e");
        let read = edge.read_only();
        assert!(read.read_hint());
        assert!(!edge.read_hint());
    }

    #[test]
    fn late_consumer_is_connected_to_existing_producer() {
        let edge = Edge::<u64, u64>::new("e");
        let out = Out::new("src");
        edge.set_in(&out);
        assert_eq!(out.num_connections(), 0);
        assert!(edge.live());

        let input = In::new("dst", TerminalMode::Consume);
        edge.set_out(&input);
        assert_eq!(out.num_connections(), 1);
    }

    #[test]
    fn pull_spec_lands_on_the_consumer() {
        let edge = Edge::<u64, u64>::pull("c", |ck: &u64| Some(ck * 10), |_| 0, |k: &u64| k + 1);
        let input = In::new("dst", TerminalMode::Consume);
        edge.set_out(&input);
        let spec = input.pull_spec().expect("pull spec installed");
        assert_eq!((spec.get)(&6), Some(70));
        assert_eq!((spec.owner)(&6), 0);
    }
}
