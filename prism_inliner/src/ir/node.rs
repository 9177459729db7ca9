//! Tree IR nodes.
//!
//! A method body is a sequence of basic blocks, each holding an ordered list
//! of *trees*. A tree is a root node (a store, an anchor, a branch, ...) whose
//! children are expression nodes. Expression nodes may be referenced from
//! several trees: the first reference in execution order evaluates the node,
//! later references reuse the value. Such sharing is only legal inside one
//! extended basic block.
//!
//! # Reference Counts
//!
//! Every node carries the number of parent slots (child edges plus tree
//! roots) that point at it. A count above one means the node is commoned.

use super::arena::Id;
use super::block::BlockId;
use super::symbol::SymbolId;
use crate::method::{ClassId, MethodId, StaticId};
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a node in a method body's node arena.
pub type NodeId = Id<Node>;

/// Byte-code identity of a node.
///
/// `caller_index` is the inlined-site index the node belongs to (`-1` for the
/// outermost method). Together with the byte-code index it identifies a call
/// uniquely even after the surrounding trees have been copied or split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteCodeInfo {
    pub caller_index: i32,
    pub bc_index: u32,
}

impl ByteCodeInfo {
    /// Byte-code info for a node of the outermost method.
    #[inline]
    pub const fn top_level(bc_index: u32) -> Self {
        Self {
            caller_index: -1,
            bc_index,
        }
    }

    /// Check whether the node belongs to the outermost method.
    #[inline]
    pub const fn is_top_level(self) -> bool {
        self.caller_index < 0
    }
}

impl fmt::Display for ByteCodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.caller_index, self.bc_index)
    }
}

// =============================================================================
// Call Descriptor
// =============================================================================

/// Dispatch kind of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Statically bound (static, private, constructor, super call).
    Direct,
    /// Dispatched through the receiver's virtual function table.
    Virtual,
    /// Dispatched through an interface table.
    Interface,
}

impl CallKind {
    /// Check whether the call needs devirtualization to be inlined.
    #[inline]
    pub const fn is_indirect(self) -> bool {
        !matches!(self, CallKind::Direct)
    }
}

/// Payload of a call node. Children are the arguments, receiver first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallDescriptor {
    /// Statically declared target.
    pub method: MethodId,
    pub kind: CallKind,
}

// =============================================================================
// Guards
// =============================================================================

/// Kind of a virtual guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GuardKind {
    NoGuard,
    Profiled,
    NonOverridden,
    Hierarchy,
    MethodTest,
    VftTest,
    Interface,
    /// Hot-code-replace guard.
    Hcr,
    /// Full-speed-debug breakpoint guard.
    Breakpoint,
    /// Ahead-of-time direct method guard.
    DirectMethod,
    /// Accepted in input IR; the inliner never emits it.
    Dummy,
    /// Only legal nested under another real guard. Never selected for a
    /// call target, and layering never introduces one.
    Inner,
}

impl GuardKind {
    /// All kinds, in declaration order.
    pub const ALL: [GuardKind; 12] = [
        GuardKind::NoGuard,
        GuardKind::Profiled,
        GuardKind::NonOverridden,
        GuardKind::Hierarchy,
        GuardKind::MethodTest,
        GuardKind::VftTest,
        GuardKind::Interface,
        GuardKind::Hcr,
        GuardKind::Breakpoint,
        GuardKind::DirectMethod,
        GuardKind::Dummy,
        GuardKind::Inner,
    ];

    /// Stable name for counters and traces.
    pub const fn as_str(self) -> &'static str {
        match self {
            GuardKind::NoGuard => "NoGuard",
            GuardKind::Profiled => "ProfiledGuard",
            GuardKind::NonOverridden => "NonoverriddenGuard",
            GuardKind::Hierarchy => "HierarchyGuard",
            GuardKind::MethodTest => "MethodTestGuard",
            GuardKind::VftTest => "VftTestGuard",
            GuardKind::Interface => "InterfaceGuard",
            GuardKind::Hcr => "HCRGuard",
            GuardKind::Breakpoint => "BreakpointGuard",
            GuardKind::DirectMethod => "DirectMethodGuard",
            GuardKind::Dummy => "DummyGuard",
            GuardKind::Inner => "InnerGuard",
        }
    }
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The runtime condition a guard evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardTestType {
    /// No runtime test; the guard is a patchable assumption.
    None,
    /// Patchable "method not overridden" assumption.
    Nonoverridden,
    /// Compare the receiver's class against a fixed class.
    Vft,
    /// Compare the receiver's dispatched method against the inlined one.
    Method,
    /// Full-speed-debug breakpoint check.
    Fsd,
}

impl GuardTestType {
    /// Check whether the test inspects the receiver object.
    #[inline]
    pub const fn reads_receiver(self) -> bool {
        matches!(self, GuardTestType::Vft | GuardTestType::Method)
    }

    /// Check whether the test inspects the receiver's class at runtime.
    #[inline]
    pub const fn is_class_test(self) -> bool {
        matches!(self, GuardTestType::Vft | GuardTestType::Method)
    }
}

/// Payload of a guard tree. On failure control branches to `slow_path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardNode {
    pub kind: GuardKind,
    pub test: GuardTestType,
    /// Declared method of the guarded call.
    pub declared: MethodId,
    /// Implementation inlined on the fast path.
    pub inlined: MethodId,
    /// Class witness for VFT tests.
    pub class: Option<ClassId>,
    pub slow_path: BlockId,
    /// Inlined-site index the guard protects.
    pub site: i32,
    /// Set when an HCR guard has been folded into this one.
    pub merged_with_hcr: bool,
}

// =============================================================================
// Opcodes
// =============================================================================

/// Node operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Values
    Const(i64),
    Null,
    Load(SymbolId),
    LoadStatic(StaticId),
    New(ClassId),
    /// child 0: object
    LoadField(u16),
    Add,
    Sub,
    Mul,
    /// Throws an arithmetic exception on a zero divisor.
    Div,
    Neg,
    CmpLt,
    CmpEq,
    Call(CallDescriptor),
    /// Value of the exception being handled; only valid in a handler block.
    Catch,

    // Tree roots
    /// child 0: value
    Store(SymbolId),
    /// child 0: value
    StoreStatic(StaticId),
    /// child 0: object, child 1: value
    StoreField(u16),
    /// Anchors the evaluation of child 0.
    TreeTop,
    /// Optional child 0: return value
    Return,
    Goto(BlockId),
    /// child 0: condition; branches when non-zero
    IfNonZero(BlockId),
    /// child 0: thrown value
    Throw,
    /// Optional child 0: receiver
    VirtualGuard(GuardNode),
    /// Bailout to the non-optimized execution mode for an inlined site.
    InduceOsr { site: i32, target: BlockId },
    /// Terminates the outermost OSR code block.
    OsrExit,
}

impl Opcode {
    /// Check whether the opcode ends a block unconditionally.
    #[inline]
    pub const fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Return | Opcode::Goto(_) | Opcode::Throw | Opcode::OsrExit
        )
    }

    /// Check whether the opcode may transfer control elsewhere.
    #[inline]
    pub const fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::Goto(_) | Opcode::IfNonZero(_) | Opcode::VirtualGuard(_)
        )
    }

    /// Explicit branch target, if any.
    #[inline]
    pub fn branch_target(&self) -> Option<BlockId> {
        match *self {
            Opcode::Goto(t) | Opcode::IfNonZero(t) => Some(t),
            Opcode::VirtualGuard(g) => Some(g.slow_path),
            _ => None,
        }
    }

    /// Rewrite the branch target in place.
    pub fn set_branch_target(&mut self, target: BlockId) {
        match self {
            Opcode::Goto(t) | Opcode::IfNonZero(t) => *t = target,
            Opcode::VirtualGuard(g) => g.slow_path = target,
            Opcode::InduceOsr { target: t, .. } => *t = target,
            _ => {}
        }
    }

    /// Check whether the opcode is only legal as a tree root.
    #[inline]
    pub const fn is_root_only(&self) -> bool {
        matches!(
            self,
            Opcode::Store(_)
                | Opcode::StoreStatic(_)
                | Opcode::StoreField(_)
                | Opcode::TreeTop
                | Opcode::Return
                | Opcode::Goto(_)
                | Opcode::IfNonZero(_)
                | Opcode::Throw
                | Opcode::VirtualGuard(_)
                | Opcode::InduceOsr { .. }
                | Opcode::OsrExit
        )
    }

    /// Check whether evaluating the node writes memory or calls out.
    #[inline]
    pub const fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Opcode::Store(_)
                | Opcode::StoreStatic(_)
                | Opcode::StoreField(_)
                | Opcode::Call(_)
                | Opcode::New(_)
                | Opcode::Throw
        )
    }

    /// Check whether the node is a compile-time constant.
    #[inline]
    pub const fn is_load_const(&self) -> bool {
        matches!(self, Opcode::Const(_) | Opcode::Null)
    }

    /// Call payload, if this is a call.
    #[inline]
    pub fn as_call(&self) -> Option<CallDescriptor> {
        match *self {
            Opcode::Call(desc) => Some(desc),
            _ => None,
        }
    }

    /// Mnemonic used by the IR dump.
    pub const fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Const(_) => "iconst",
            Opcode::Null => "aconst_null",
            Opcode::Load(_) => "load",
            Opcode::LoadStatic(_) => "loadstatic",
            Opcode::New(_) => "new",
            Opcode::LoadField(_) => "loadfield",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Neg => "neg",
            Opcode::CmpLt => "cmplt",
            Opcode::CmpEq => "cmpeq",
            Opcode::Call(_) => "call",
            Opcode::Catch => "catch",
            Opcode::Store(_) => "store",
            Opcode::StoreStatic(_) => "storestatic",
            Opcode::StoreField(_) => "storefield",
            Opcode::TreeTop => "treetop",
            Opcode::Return => "return",
            Opcode::Goto(_) => "goto",
            Opcode::IfNonZero(_) => "ifnonzero",
            Opcode::Throw => "throw",
            Opcode::VirtualGuard(_) => "virtualguard",
            Opcode::InduceOsr { .. } => "induceosr",
            Opcode::OsrExit => "osrexit",
        }
    }
}

// =============================================================================
// Node
// =============================================================================

/// Children are stored inline up to this arity.
const INLINE_CHILDREN: usize = 3;

/// A tree IR node.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Opcode,
    pub children: SmallVec<[NodeId; INLINE_CHILDREN]>,
    /// Number of parent slots and tree roots referencing this node.
    pub ref_count: u32,
    pub bc: ByteCodeInfo,
}

impl Node {
    /// Create an unreferenced node.
    pub fn new(op: Opcode, children: &[NodeId], bc: ByteCodeInfo) -> Self {
        Self {
            op,
            children: SmallVec::from_slice(children),
            ref_count: 0,
            bc,
        }
    }

    /// Child at `index`.
    #[inline]
    pub fn child(&self, index: usize) -> Option<NodeId> {
        self.children.get(index).copied()
    }

    /// First child, if any.
    #[inline]
    pub fn first_child(&self) -> Option<NodeId> {
        self.child(0)
    }

    /// Check whether the node is referenced from more than one place.
    #[inline]
    pub fn is_commoned(&self) -> bool {
        self.ref_count > 1
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminators_and_branches() {
        let target = BlockId::new(3);
        assert!(Opcode::Return.is_terminator());
        assert!(Opcode::Goto(target).is_terminator());
        assert!(!Opcode::IfNonZero(target).is_terminator());
        assert_eq!(Opcode::IfNonZero(target).branch_target(), Some(target));
        assert_eq!(Opcode::Return.branch_target(), None);
    }

    #[test]
    fn test_set_branch_target_on_guard() {
        let mut op = Opcode::VirtualGuard(GuardNode {
            kind: GuardKind::Profiled,
            test: GuardTestType::Vft,
            declared: MethodId(1),
            inlined: MethodId(2),
            class: Some(ClassId(7)),
            slow_path: BlockId::new(1),
            site: 0,
            merged_with_hcr: false,
        });
        op.set_branch_target(BlockId::new(9));
        assert_eq!(op.branch_target(), Some(BlockId::new(9)));
    }

    #[test]
    fn test_guard_test_reads_receiver() {
        assert!(GuardTestType::Vft.reads_receiver());
        assert!(GuardTestType::Method.is_class_test());
        assert!(!GuardTestType::Nonoverridden.reads_receiver());
        assert_eq!(GuardKind::Hcr.to_string(), "HCRGuard");
    }

    #[test]
    fn test_bytecode_info_top_level() {
        let bc = ByteCodeInfo::top_level(12);
        assert!(bc.is_top_level());
        assert_eq!(bc.to_string(), "-1.12");
    }
}
