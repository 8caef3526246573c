//! Task templates: keyed graph vertices and their dispatch engine.
//!
//! The [`dispatch`] submodule owns the argument-assembly machinery:
//! pending records, streaming bookkeeping, owner routing, pull queries and
//! the inline short-circuit. The [`build`] submodule restores typing at the
//! template boundary and exposes [`make_tt`]/[`make_tt_tpl`].

mod build;
mod dispatch;

pub use build::{make_tt, make_tt_tpl, InputEdges, OutputEdges, TaskFn, TaskTemplate};

#[doc(hidden)]
pub use dispatch::{InputSlot, TtCore};
