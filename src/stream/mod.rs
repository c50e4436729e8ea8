//! Byte pipelines: the chain executor and the stages plugged into it.

pub mod chain;
pub mod codec;
pub mod collect;
pub mod io;
