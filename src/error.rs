//! Error taxonomy for graph assembly and the argument protocol.
//!
//! [`GraphError`] covers mistakes made while the graph is being wired
//! together and is returned as a `Result` from assembly APIs.
//! [`ProtocolError`] covers violations of the argument protocol at runtime
//! (sending into a finalized stream, re-bounding a bounded stream, and so
//! on). These are programmer bugs with no recovery path; the runtime logs
//! them rank-prefixed and panics on the owning rank.

use enum_as_inner::EnumAsInner;

/// Errors raised while assembling the task graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, EnumAsInner)]
pub enum GraphError {
    /// Fusing a pull edge with anything else has no unified fetch model.
    #[error("edge `{edge}`: fusing push and pull edges is not supported")]
    InvalidEdgeFusion { edge: String },

    /// An edge constructed from zero sibling edges.
    #[error("cannot fuse an empty set of edges")]
    EmptyFusion,

    /// Input name count does not match the input terminal count.
    #[error("task template `{tt}`: {got} input names given for {expected} input terminals")]
    InputNameCount {
        tt: String,
        got: usize,
        expected: usize,
    },

    /// Output name count does not match the output terminal count.
    #[error("task template `{tt}`: {got} output names given for {expected} output terminals")]
    OutputNameCount {
        tt: String,
        got: usize,
        expected: usize,
    },
}

/// Violations of the argument protocol and related runtime contracts.
///
/// These indicate bugs in the program feeding the graph, not recoverable
/// conditions. The dispatch core formats them into a rank-prefixed panic on
/// the rank that owns the offending task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// `set_arg`, `set_size` or `finalize` hit an input that was already
    /// finalized for this key.
    #[error("input {index} for key {key} is already finalized")]
    StreamFinalized { index: usize, key: String },

    /// `set_argstream_size` on a stream that already has a bound.
    #[error("input {index} for key {key} is already bounded")]
    StreamAlreadyBounded { index: usize, key: String },

    /// A bounded stream received more messages than its declared size.
    #[error("input {index} for key {key} received more messages than its declared stream size")]
    StreamOverrun { index: usize, key: String },

    /// `finalize` on a stream whose size was declared up front.
    #[error("finalize called on bounded stream input {index} for key {key}")]
    FinalizeBounded { index: usize, key: String },

    /// A terminal operation was invoked before its callback was installed.
    #[error("`{callback}` callback not initialized on terminal `{terminal}`")]
    CallbackUninitialized {
        terminal: String,
        callback: &'static str,
    },

    /// A pull container had no entry for the requested key.
    #[error("pull input {index}: container lookup miss for key {key}")]
    ContainerMiss { index: usize, key: String },

    /// A value reached an input slot with the wrong concrete type.
    #[error("input {index}: value of type `{got}` does not match expected type `{expected}`")]
    ValueTypeMismatch {
        index: usize,
        expected: &'static str,
        got: &'static str,
    },

    /// Serialization or deserialization of a key or value failed.
    #[error("codec failure for `{type_name}`: {detail}")]
    Codec {
        type_name: &'static str,
        detail: String,
    },

    /// Task injection on a template that was never made executable.
    #[error("task template `{tt}` is not executable; call make_graph_executable first")]
    NotExecutable { tt: String },
}
