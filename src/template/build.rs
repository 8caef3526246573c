//! Typed construction of task templates.
//!
//! [`make_tt`] builds a [`TaskTemplate`] from a task function and tuples of
//! input and output edges; arity and value types are inferred from the
//! tuples. The adapters generated here are the only place where the typed
//! world of terminals meets the erased slots of the dispatch engine.

use std::any::TypeId;
use std::sync::{Arc, Weak};

use tracing::trace;

use super::dispatch::{InputSlot, TtCore};
use crate::codec::ErasedValue;
use crate::edge::Edge;
use crate::error::{GraphError, ProtocolError};
use crate::graph::{AsTtNode, TtNode};
use crate::key::{Datum, Key};
use crate::terminal::{In, InCallbacks, Out, TerminalMode};
use crate::world::{Rank, World};

/// A tuple of input edges, all keyed by `K`.
///
/// Implemented for `()` and for tuples of [`Edge`] up to arity 4. The
/// methods are wiring plumbing used by [`make_tt`]; user code only touches
/// the associated types.
pub trait InputEdges<K: Key>: Sized {
    /// The input terminals created for these edges.
    type Terminals: Send + Sync + 'static;
    /// The tuple of owned input values handed to the task body.
    type Values: Send + 'static;
    const ARITY: usize;

    #[doc(hidden)]
    fn build_terminals(&self, names: &[String]) -> Self::Terminals;
    #[doc(hidden)]
    fn bind(terminals: &Self::Terminals, node: &Weak<dyn TtNode>);
    #[doc(hidden)]
    fn wire(&self, terminals: &Self::Terminals);
    #[doc(hidden)]
    fn slots(terminals: &Self::Terminals) -> Vec<InputSlot<K>>;
    #[doc(hidden)]
    fn install(terminals: &Self::Terminals, core: &Arc<TtCore<K>>);
    #[doc(hidden)]
    fn scatter(core: &Arc<TtCore<K>>, key: &K, values: Self::Values);
    #[doc(hidden)]
    fn unpack(tt: &str, slots: Vec<Option<ErasedValue>>) -> Self::Values;
}

/// A tuple of output edges; keys may differ per edge.
pub trait OutputEdges: Sized {
    /// The output terminals created for these edges, handed to the body.
    type Terminals: Send + Sync + 'static;
    const ARITY: usize;

    #[doc(hidden)]
    fn build_terminals(&self, names: &[String]) -> Self::Terminals;
    #[doc(hidden)]
    fn bind(terminals: &Self::Terminals, node: &Weak<dyn TtNode>);
    #[doc(hidden)]
    fn wire(&self, terminals: &Self::Terminals);
}

/// A task body with expanded arguments: `f(&key, v0, .., &outputs)`.
pub trait TaskFn<K: Key, IE: InputEdges<K>, OE: OutputEdges>: Send + Sync + 'static {
    #[doc(hidden)]
    fn call(&self, key: &K, values: IE::Values, outputs: &OE::Terminals);
}

fn unpack_slot<V: Datum>(tt: &str, index: usize, slot: Option<ErasedValue>) -> V {
    // A control input finalized without a payload leaves its slot empty.
    let boxed = slot.unwrap_or_else(|| Box::new(()) as ErasedValue);
    match boxed.downcast::<V>() {
        Ok(value) => *value,
        Err(_) => panic!(
            "task template `{tt}`: {}",
            ProtocolError::ValueTypeMismatch {
                index,
                expected: std::any::type_name::<V>(),
                got: "<missing or mismatched slot>",
            }
        ),
    }
}

fn install_callbacks<K: Key, V: Datum>(terminal: &In<K, V>, core: &Arc<TtCore<K>>, index: usize) {
    let on_send = Arc::downgrade(core);
    let on_move = Arc::downgrade(core);
    let on_size = Arc::downgrade(core);
    let on_finalize = Arc::downgrade(core);
    terminal.set_callbacks(InCallbacks {
        send: Box::new(move |key: &K, value: &V| match on_send.upgrade() {
            Some(core) => core.set_arg(index, key, Box::new(value.clone())),
            None => trace!("send into dropped template"),
        }),
        send_owned: Box::new(move |key: &K, value: V| match on_move.upgrade() {
            Some(core) => core.set_arg(index, key, Box::new(value)),
            None => trace!("send into dropped template"),
        }),
        broadcast: None,
        set_size: Box::new(move |key: &K, size: usize| match on_size.upgrade() {
            Some(core) => core.set_argstream_size(index, key, size),
            None => trace!("set_size into dropped template"),
        }),
        finalize: Box::new(move |key: &K| match on_finalize.upgrade() {
            Some(core) => core.finalize_argstream(index, key),
            None => trace!("finalize into dropped template"),
        }),
    });
}

impl<K: Key> InputEdges<K> for () {
    type Terminals = ();
    type Values = ();
    const ARITY: usize = 0;

    fn build_terminals(&self, _names: &[String]) -> Self::Terminals {}
    fn bind(_terminals: &Self::Terminals, _node: &Weak<dyn TtNode>) {}
    fn wire(&self, _terminals: &Self::Terminals) {}
    fn slots(_terminals: &Self::Terminals) -> Vec<InputSlot<K>> {
        Vec::new()
    }
    fn install(_terminals: &Self::Terminals, _core: &Arc<TtCore<K>>) {}
    fn scatter(_core: &Arc<TtCore<K>>, _key: &K, _values: Self::Values) {}
    fn unpack(_tt: &str, _slots: Vec<Option<ErasedValue>>) -> Self::Values {}
}

macro_rules! impl_input_edges {
    ($(($idx:tt, $V:ident)),+) => {
        impl<K: Key, $($V: Datum),+> InputEdges<K> for ($(Edge<K, $V>,)+) {
            type Terminals = ($(In<K, $V>,)+);
            type Values = ($($V,)+);
            const ARITY: usize = [$(stringify!($V)),+].len();

            fn build_terminals(&self, names: &[String]) -> Self::Terminals {
                ($(
                    In::new(
                        &names[$idx],
                        if self.$idx.read_hint() {
                            TerminalMode::Read
                        } else {
                            TerminalMode::Consume
                        },
                    ),
                )+)
            }

            fn bind(terminals: &Self::Terminals, node: &Weak<dyn TtNode>) {
                $( terminals.$idx.bind_node(node.clone()); )+
            }

            fn wire(&self, terminals: &Self::Terminals) {
                $( self.$idx.set_out(&terminals.$idx); )+
            }

            fn slots(terminals: &Self::Terminals) -> Vec<InputSlot<K>> {
                vec![$( InputSlot::from_terminal(&terminals.$idx) ),+]
            }

            fn install(terminals: &Self::Terminals, core: &Arc<TtCore<K>>) {
                $( install_callbacks(&terminals.$idx, core, $idx); )+
            }

            fn scatter(core: &Arc<TtCore<K>>, key: &K, values: Self::Values) {
                $( core.set_arg($idx, key, Box::new(values.$idx)); )+
            }

            fn unpack(tt: &str, mut slots: Vec<Option<ErasedValue>>) -> Self::Values {
                ($( unpack_slot::<$V>(tt, $idx, slots[$idx].take()), )+)
            }
        }
    };
}

impl_input_edges!((0, V0));
impl_input_edges!((0, V0), (1, V1));
impl_input_edges!((0, V0), (1, V1), (2, V2));
impl_input_edges!((0, V0), (1, V1), (2, V2), (3, V3));

impl OutputEdges for () {
    type Terminals = ();
    const ARITY: usize = 0;

    fn build_terminals(&self, _names: &[String]) -> Self::Terminals {}
    fn bind(_terminals: &Self::Terminals, _node: &Weak<dyn TtNode>) {}
    fn wire(&self, _terminals: &Self::Terminals) {}
}

macro_rules! impl_output_edges {
    ($(($idx:tt, $K:ident, $V:ident)),+) => {
        impl<$($K: Key, $V: Datum),+> OutputEdges for ($(Edge<$K, $V>,)+) {
            type Terminals = ($(Out<$K, $V>,)+);
            const ARITY: usize = [$(stringify!($V)),+].len();

            fn build_terminals(&self, names: &[String]) -> Self::Terminals {
                ($( Out::new(&names[$idx]), )+)
            }

            fn bind(terminals: &Self::Terminals, node: &Weak<dyn TtNode>) {
                $( terminals.$idx.bind_node(node.clone()); )+
            }

            fn wire(&self, terminals: &Self::Terminals) {
                $( self.$idx.set_in(&terminals.$idx); )+
            }
        }
    };
}

impl_output_edges!((0, K0, V0));
impl_output_edges!((0, K0, V0), (1, K1, V1));
impl_output_edges!((0, K0, V0), (1, K1, V1), (2, K2, V2));
impl_output_edges!((0, K0, V0), (1, K1, V1), (2, K2, V2), (3, K3, V3));

impl<K: Key, OE: OutputEdges, F> TaskFn<K, (), OE> for F
where
    F: Fn(&K, &OE::Terminals) + Send + Sync + 'static,
{
    fn call(&self, key: &K, _values: (), outputs: &OE::Terminals) {
        self(key, outputs)
    }
}

macro_rules! impl_task_fn {
    ($(($idx:tt, $V:ident)),+) => {
        impl<K: Key, $($V: Datum,)+ OE: OutputEdges, F> TaskFn<K, ($(Edge<K, $V>,)+), OE> for F
        where
            F: Fn(&K, $($V,)+ &OE::Terminals) + Send + Sync + 'static,
        {
            fn call(&self, key: &K, values: ($($V,)+), outputs: &OE::Terminals) {
                self(key, $(values.$idx,)+ outputs)
            }
        }
    };
}

impl_task_fn!((0, V0));
impl_task_fn!((0, V0), (1, V1));
impl_task_fn!((0, V0), (1, V1), (2, V2));
impl_task_fn!((0, V0), (1, V1), (2, V2), (3, V3));

/// A stateful graph vertex that materializes one task per key.
///
/// Built with [`make_tt`] or [`make_tt_tpl`]; holds its input terminals,
/// its output terminals, and the dispatch engine that assembles arguments
/// and runs the body exactly once per key.
pub struct TaskTemplate<K: Key, IE: InputEdges<K>, OE: OutputEdges> {
    core: Arc<TtCore<K>>,
    inputs: IE::Terminals,
    outputs: Arc<OE::Terminals>,
}

impl<K: Key, IE: InputEdges<K>, OE: OutputEdges> std::fmt::Debug for TaskTemplate<K, IE, OE> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTemplate")
            .field("name", &self.name())
            .finish()
    }
}

impl<K: Key, IE: InputEdges<K>, OE: OutputEdges> TaskTemplate<K, IE, OE> {
    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn world(&self) -> &World {
        self.core.world()
    }

    /// Replaces the keymap. Must be identical on every rank and installed
    /// before any task is injected.
    pub fn set_keymap(&self, keymap: impl Fn(&K) -> Rank + Send + Sync + 'static) {
        self.core.set_keymap(Arc::new(keymap));
    }

    /// Replaces the priority map consulted when a ready task is enqueued.
    pub fn set_priomap(&self, priomap: impl Fn(&K) -> i32 + Send + Sync + 'static) {
        self.core.set_priomap(Arc::new(priomap));
    }

    /// Installs a streaming reducer on input `index`.
    ///
    /// Arguments arriving under one key are folded pairwise; message order
    /// is not guaranteed, so the reducer should be associative and
    /// commutative for deterministic results.
    pub fn set_input_reducer<V: Datum>(
        &self,
        index: usize,
        reduce: impl Fn(&mut V, V) + Send + Sync + 'static,
    ) {
        let slot = &self.core.inputs()[index];
        if slot.codec.type_id() != TypeId::of::<V>() {
            panic!(
                "task template `{}`: {}",
                self.core.name(),
                ProtocolError::ValueTypeMismatch {
                    index,
                    expected: slot.codec.type_name(),
                    got: std::any::type_name::<V>(),
                }
            );
        }
        let tt = self.core.name().to_string();
        self.core.set_reducer(
            index,
            Box::new(move |accumulator, value| {
                let accumulator = match accumulator.downcast_mut::<V>() {
                    Some(accumulator) => accumulator,
                    None => panic!("task template `{tt}`: reducer accumulator type drifted"),
                };
                let value = match value.downcast::<V>() {
                    Ok(value) => *value,
                    Err(_) => panic!("task template `{tt}`: reducer value type drifted"),
                };
                reduce(accumulator, value);
            }),
        );
    }

    /// Declares a template-wide stream size for input `index`.
    pub fn set_static_argstream_size(&self, index: usize, size: usize) {
        self.core.set_static_argstream_size(index, size);
    }

    /// Chooses when pull inputs are queried: eagerly on the first argument
    /// for a key (default) or lazily once only pull inputs remain.
    pub fn set_lazy_pull(&self, lazy: bool) {
        self.core.set_lazy_pull(lazy);
    }

    /// Injects a task that needs no pushed arguments: the template has
    /// either no inputs at all or only pull inputs.
    pub fn invoke(&self, key: K) {
        self.core.assert_executable();
        let pulls = self
            .core
            .inputs()
            .iter()
            .filter(|slot| slot.pull.is_some())
            .count();
        assert!(
            IE::ARITY == 0 || pulls == IE::ARITY,
            "task template `{}`: invoke(key) needs a template without push inputs; use invoke_with",
            self.core.name()
        );
        self.core.seed(&key);
    }

    /// Injects a task with every pushed argument given up front.
    pub fn invoke_with(&self, key: K, values: IE::Values) {
        self.core.assert_executable();
        IE::scatter(&self.core, &key, values);
    }

    /// The input terminal tuple.
    pub fn inputs(&self) -> &IE::Terminals {
        &self.inputs
    }

    /// The output terminal tuple, as also handed to the task body.
    pub fn outputs(&self) -> &OE::Terminals {
        &self.outputs
    }

    pub fn make_executable(&self) {
        TtNode::make_executable(&*self.core);
    }

    pub fn is_executable(&self) -> bool {
        TtNode::is_executable(&*self.core)
    }

    /// Waits for the whole graph containing this template to quiesce.
    /// Collective across the world.
    pub fn fence(&self) {
        self.core.world().fence();
    }

    /// Number of keys currently accumulating arguments on this rank.
    pub fn pending_count(&self) -> usize {
        self.core.pending_count()
    }

    pub fn node(&self) -> Arc<dyn TtNode> {
        self.core.clone()
    }
}

impl<K: Key, IE: InputEdges<K>, OE: OutputEdges> AsTtNode for TaskTemplate<K, IE, OE> {
    fn as_node(&self) -> Arc<dyn TtNode> {
        self.core.clone()
    }
}

/// Builds a task template whose body takes expanded arguments:
/// `f(&key, v0, v1, .., &outputs)`.
pub fn make_tt<K, IE, OE, F>(
    f: F,
    inedges: IE,
    outedges: OE,
    name: &str,
    input_names: &[&str],
    output_names: &[&str],
    world: &World,
) -> Result<TaskTemplate<K, IE, OE>, GraphError>
where
    K: Key,
    IE: InputEdges<K>,
    OE: OutputEdges,
    F: TaskFn<K, IE, OE>,
{
    make_tt_tpl(
        move |key: &K, values: IE::Values, outputs: &OE::Terminals| f.call(key, values, outputs),
        inedges,
        outedges,
        name,
        input_names,
        output_names,
        world,
    )
}

/// Builds a task template whose body takes the input values as one tuple:
/// `f(&key, values, &outputs)`.
pub fn make_tt_tpl<K, IE, OE, F>(
    f: F,
    inedges: IE,
    outedges: OE,
    name: &str,
    input_names: &[&str],
    output_names: &[&str],
    world: &World,
) -> Result<TaskTemplate<K, IE, OE>, GraphError>
where
    K: Key,
    IE: InputEdges<K>,
    OE: OutputEdges,
    F: Fn(&K, IE::Values, &OE::Terminals) + Send + Sync + 'static,
{
    if input_names.len() != IE::ARITY {
        return Err(GraphError::InputNameCount {
            tt: name.to_string(),
            got: input_names.len(),
            expected: IE::ARITY,
        });
    }
    if output_names.len() != OE::ARITY {
        return Err(GraphError::OutputNameCount {
            tt: name.to_string(),
            got: output_names.len(),
            expected: OE::ARITY,
        });
    }

    let core = Arc::new_cyclic(|me| TtCore::new(me.clone(), name, world.clone()));
    let node: Weak<dyn TtNode> = {
        let as_node: Arc<dyn TtNode> = core.clone();
        Arc::downgrade(&as_node)
    };

    let input_names: Vec<String> = input_names.iter().map(|s| s.to_string()).collect();
    let output_names: Vec<String> = output_names.iter().map(|s| s.to_string()).collect();

    let inputs = inedges.build_terminals(&input_names);
    IE::bind(&inputs, &node);
    let outputs = outedges.build_terminals(&output_names);
    OE::bind(&outputs, &node);

    inedges.wire(&inputs);
    core.init_inputs(IE::slots(&inputs));
    outedges.wire(&outputs);

    let outputs = Arc::new(outputs);
    let body_outputs = outputs.clone();
    let tt_name = name.to_string();
    core.install_body(Box::new(move |key: &K, slots| {
        let values = IE::unpack(&tt_name, slots);
        f(key, values, &body_outputs);
    }));
    IE::install(&inputs, &core);
    core.set_object(world.register_object(core.clone()));

    trace!(rank = world.rank(), tt = name, "task template constructed");
    Ok(TaskTemplate {
        core,
        inputs,
        outputs,
    })
}
