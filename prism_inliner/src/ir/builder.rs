//! Fluent construction of method bodies.
//!
//! Used by IL providers that synthesize bodies, by benchmarks and by tests.
//! Every node gets a fresh top-level byte-code index, so calls built here are
//! uniquely identified by their [`ByteCodeInfo`].

use super::block::{BlockId, UNKNOWN_FREQUENCY};
use super::body::MethodBody;
use super::node::{ByteCodeInfo, CallDescriptor, CallKind, NodeId, Opcode};
use super::symbol::SymbolId;
use crate::method::{ClassId, MethodId, StaticId};

/// Builder for a [`MethodBody`].
#[derive(Debug)]
pub struct MethodBuilder {
    body: MethodBody,
    current: Option<BlockId>,
    next_bc: u32,
}

impl MethodBuilder {
    /// Start building the body of `method`.
    pub fn new(method: MethodId) -> Self {
        Self {
            body: MethodBody::new(method),
            current: None,
            next_bc: 0,
        }
    }

    fn bc(&mut self) -> ByteCodeInfo {
        let bc = ByteCodeInfo::top_level(self.next_bc);
        self.next_bc += 1;
        bc
    }

    fn node(&mut self, op: Opcode, children: &[NodeId]) -> NodeId {
        let bc = self.bc();
        self.body.create_node(op, children, bc)
    }

    fn root(&mut self, op: Opcode, children: &[NodeId]) -> NodeId {
        let block = self.current_block();
        let bc = self.bc();
        self.body.append_new_tree(block, op, children, bc)
    }

    fn current_block(&mut self) -> BlockId {
        match self.current {
            Some(b) => b,
            None => self.block(),
        }
    }

    // -------------------------------------------------------------------------
    // Symbols and blocks
    // -------------------------------------------------------------------------

    /// Declare the next parameter.
    pub fn parm(&mut self, name: &str) -> SymbolId {
        self.body.symbols.add_parm(name)
    }

    /// Declare a local.
    pub fn auto(&mut self, name: &str) -> SymbolId {
        self.body.symbols.add_auto(name)
    }

    /// Append a block with unknown frequency and make it current.
    pub fn block(&mut self) -> BlockId {
        self.block_with_frequency(UNKNOWN_FREQUENCY)
    }

    /// Append a block with the given frequency and make it current.
    pub fn block_with_frequency(&mut self, frequency: i32) -> BlockId {
        let b = self.body.append_block(frequency);
        self.current = Some(b);
        b
    }

    /// Continue appending trees to `block`.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    /// Route exceptions raised in `block` to `handler`.
    pub fn set_handler(&mut self, block: BlockId, handler: BlockId) {
        self.body.block_mut(block).handler = Some(handler);
    }

    /// Mark `block` cold.
    pub fn set_cold(&mut self, block: BlockId) {
        self.body.block_mut(block).is_cold = true;
    }

    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------

    pub fn iconst(&mut self, value: i64) -> NodeId {
        self.node(Opcode::Const(value), &[])
    }

    pub fn null(&mut self) -> NodeId {
        self.node(Opcode::Null, &[])
    }

    pub fn load(&mut self, symbol: SymbolId) -> NodeId {
        self.node(Opcode::Load(symbol), &[])
    }

    pub fn load_static(&mut self, field: StaticId) -> NodeId {
        self.node(Opcode::LoadStatic(field), &[])
    }

    pub fn new_object(&mut self, class: ClassId) -> NodeId {
        self.node(Opcode::New(class), &[])
    }

    pub fn load_field(&mut self, object: NodeId, field: u16) -> NodeId {
        self.node(Opcode::LoadField(field), &[object])
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.node(Opcode::Add, &[a, b])
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.node(Opcode::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.node(Opcode::Mul, &[a, b])
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.node(Opcode::Div, &[a, b])
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        self.node(Opcode::Neg, &[a])
    }

    pub fn cmp_lt(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.node(Opcode::CmpLt, &[a, b])
    }

    pub fn cmp_eq(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.node(Opcode::CmpEq, &[a, b])
    }

    /// Exception value inside a handler block.
    pub fn catch(&mut self) -> NodeId {
        self.node(Opcode::Catch, &[])
    }

    /// Build a call node. It still has to be anchored by a tree.
    pub fn call(&mut self, method: MethodId, kind: CallKind, args: &[NodeId]) -> NodeId {
        self.node(Opcode::Call(CallDescriptor { method, kind }), args)
    }

    // -------------------------------------------------------------------------
    // Trees
    // -------------------------------------------------------------------------

    pub fn store(&mut self, symbol: SymbolId, value: NodeId) -> NodeId {
        self.root(Opcode::Store(symbol), &[value])
    }

    pub fn store_static(&mut self, field: StaticId, value: NodeId) -> NodeId {
        self.root(Opcode::StoreStatic(field), &[value])
    }

    pub fn store_field(&mut self, object: NodeId, field: u16, value: NodeId) -> NodeId {
        self.root(Opcode::StoreField(field), &[object, value])
    }

    /// Anchor `value` in a `TreeTop`.
    pub fn anchor(&mut self, value: NodeId) -> NodeId {
        self.root(Opcode::TreeTop, &[value])
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        match value {
            Some(v) => self.root(Opcode::Return, &[v]),
            None => self.root(Opcode::Return, &[]),
        }
    }

    pub fn goto(&mut self, target: BlockId) -> NodeId {
        self.root(Opcode::Goto(target), &[])
    }

    pub fn if_nonzero(&mut self, condition: NodeId, target: BlockId) -> NodeId {
        self.root(Opcode::IfNonZero(target), &[condition])
    }

    pub fn throw(&mut self, value: NodeId) -> NodeId {
        self.root(Opcode::Throw, &[value])
    }

    /// Byte-code identity of a node built here.
    pub fn bc_of(&self, node: NodeId) -> ByteCodeInfo {
        self.body.node(node).bc
    }

    /// Finish building.
    pub fn finish(self) -> MethodBody {
        self.body
    }
}
