//! Tree IR.
//!
//! - [`arena`]: typed arenas, side tables and bit sets
//! - [`node`], [`symbol`], [`block`]: the IR items
//! - [`body`]: a method body and its mutation API
//! - [`cfg`]: derived control flow, EBBs, loops
//! - [`verify`]: structural checks
//! - [`builder`]: fluent construction
//! - [`interp`]: reference interpreter

pub mod arena;
pub mod block;
pub mod body;
pub mod builder;
pub mod cfg;
pub mod interp;
pub mod node;
pub mod symbol;
mod verify;

pub use arena::{BitSet, Id, SecondaryMap};
pub use block::{
    Block, BlockId, MAX_BLOCK_COUNT, MAX_COLD_BLOCK_COUNT, UNKNOWN_FREQUENCY,
    VERSIONED_COLD_BLOCK_COUNT,
};
pub use body::{InlinedSite, MethodBody, TreePos};
pub use builder::MethodBuilder;
pub use cfg::Cfg;
pub use interp::{Heap, InterpError, Interpreter, Outcome, Value};
pub use node::{
    ByteCodeInfo, CallDescriptor, CallKind, GuardKind, GuardNode, GuardTestType, Node, NodeId,
    Opcode,
};
pub use symbol::{Symbol, SymbolId, SymbolKind, SymbolTable};
pub use verify::verify;
