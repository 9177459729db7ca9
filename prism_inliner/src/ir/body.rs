//! Method bodies: node and block arenas plus the block layout.
//!
//! The body is the unit the inliner mutates. Edges are not stored; they are
//! derived from the trees and the layout order (see [`crate::ir::Cfg`]), so
//! every structural mutation here keeps the CFG consistent by construction.

use super::arena::{Arena, BitSet};
use super::block::{Block, BlockId};
use super::node::{ByteCodeInfo, Node, NodeId, Opcode};
use super::symbol::SymbolTable;
use crate::method::MethodId;
use crate::osr::OsrCompilationData;
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Inlined Sites
// =============================================================================

/// One entry in the table of inlined call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlinedSite {
    /// Method whose body was inlined.
    pub method: MethodId,
    /// Byte-code identity of the call that was replaced. Its `caller_index`
    /// is the enclosing inlined site (`-1` for the outermost method).
    pub call: ByteCodeInfo,
}

// =============================================================================
// Tree Position
// =============================================================================

/// Position of a tree within a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreePos {
    pub block: BlockId,
    pub index: usize,
}

// =============================================================================
// Method Body
// =============================================================================

/// The tree IR of one compiled method, including everything inlined into it.
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub method: MethodId,
    nodes: Arena<Node>,
    blocks: Arena<Block>,
    layout: Vec<BlockId>,
    pub symbols: SymbolTable,
    pub inlined_sites: Vec<InlinedSite>,
    pub osr: OsrCompilationData,
}

impl MethodBody {
    /// Create an empty body for `method`.
    pub fn new(method: MethodId) -> Self {
        Self {
            method,
            nodes: Arena::new(),
            blocks: Arena::new(),
            layout: Vec::new(),
            symbols: SymbolTable::new(),
            inlined_sites: Vec::new(),
            osr: OsrCompilationData::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    /// Create a node. Each child gains one reference.
    pub fn create_node(&mut self, op: Opcode, children: &[NodeId], bc: ByteCodeInfo) -> NodeId {
        for &child in children {
            self.nodes[child].ref_count += 1;
        }
        self.nodes.alloc(Node::new(op, children, bc))
    }

    /// Look up a node.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Look up a node, returning `None` for foreign IDs.
    #[inline]
    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Rewrite a node's opcode in place. Children are unchanged.
    #[inline]
    pub fn set_op(&mut self, id: NodeId, op: Opcode) {
        self.nodes[id].op = op;
    }

    /// Total number of node slots, live or dead.
    #[inline]
    pub fn node_slots(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes still referenced from some tree.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|(_, n)| n.ref_count > 0).count()
    }

    /// Replace child `index` of `parent` with `new_child`, moving one
    /// reference from the old child to the new one.
    pub fn replace_child(&mut self, parent: NodeId, index: usize, new_child: NodeId) {
        let old = self.nodes[parent].children[index];
        if old == new_child {
            return;
        }
        self.nodes[new_child].ref_count += 1;
        self.nodes[parent].children[index] = new_child;
        self.dec_ref(old);
    }

    /// Drop one reference to `node`; a node that loses its last reference
    /// releases its children in turn.
    pub fn dec_ref(&mut self, node: NodeId) {
        let mut work: SmallVec<[NodeId; 8]> = SmallVec::new();
        work.push(node);
        while let Some(id) = work.pop() {
            let n = &mut self.nodes[id];
            debug_assert!(n.ref_count > 0, "reference count underflow on {:?}", id);
            n.ref_count = n.ref_count.saturating_sub(1);
            if n.ref_count == 0 {
                work.extend(n.children.iter().copied());
            }
        }
    }

    /// Copy the expression rooted at `node` into fresh, unshared slots.
    pub fn deep_copy(&mut self, node: NodeId) -> NodeId {
        let (op, children, bc) = {
            let n = &self.nodes[node];
            (n.op, n.children.clone(), n.bc)
        };
        let copied: SmallVec<[NodeId; 4]> = children.iter().map(|&c| self.deep_copy(c)).collect();
        self.create_node(op, &copied, bc)
    }

    /// Visit every node reachable from `root` once, parents before children.
    pub fn walk_tree(&self, root: NodeId, visited: &mut BitSet, f: &mut impl FnMut(NodeId, &Node)) {
        if !visited.insert(root.as_usize()) {
            return;
        }
        let node = &self.nodes[root];
        f(root, node);
        for &child in &node.children {
            self.walk_tree(child, visited, f);
        }
    }

    // -------------------------------------------------------------------------
    // Blocks and layout
    // -------------------------------------------------------------------------

    /// Create a block that is not yet part of the layout.
    pub fn create_block(&mut self, frequency: i32) -> BlockId {
        self.blocks.alloc(Block::new(frequency))
    }

    /// Create a block and append it to the layout.
    pub fn append_block(&mut self, frequency: i32) -> BlockId {
        let id = self.create_block(frequency);
        self.layout.push(id);
        id
    }

    /// Look up a block.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    /// Look up a block mutably. Use the tree helpers to change its trees.
    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id]
    }

    /// Number of block slots.
    #[inline]
    pub fn block_slots(&self) -> usize {
        self.blocks.len()
    }

    /// Blocks in layout order. The first block is the entry.
    #[inline]
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    /// Entry block.
    #[inline]
    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    /// Position of `block` in the layout.
    pub fn layout_position(&self, block: BlockId) -> Option<usize> {
        self.layout.iter().position(|&b| b == block)
    }

    /// Insert `block` into the layout right after `after`.
    pub fn insert_block_after(&mut self, after: BlockId, block: BlockId) {
        match self.layout_position(after) {
            Some(pos) => self.layout.insert(pos + 1, block),
            None => self.layout.push(block),
        }
    }

    /// Insert a run of blocks into the layout right after `after`.
    pub fn insert_blocks_after(&mut self, after: BlockId, blocks: &[BlockId]) {
        let pos = self.layout_position(after).map_or(self.layout.len(), |p| p + 1);
        self.layout.splice(pos..pos, blocks.iter().copied());
    }

    /// Append an existing block to the end of the layout.
    pub fn push_layout(&mut self, block: BlockId) {
        self.layout.push(block);
    }

    /// Block following `block` in the layout.
    pub fn next_in_layout(&self, block: BlockId) -> Option<BlockId> {
        let pos = self.layout_position(block)?;
        self.layout.get(pos + 1).copied()
    }

    /// Check whether control can fall off the end of `block`.
    pub fn falls_through(&self, block: BlockId) -> bool {
        match self.blocks[block].last_tree() {
            Some(last) => !self.nodes[last].op.is_terminator(),
            None => true,
        }
    }

    /// Normal (non-exceptional) successors derived from the trees.
    pub fn successors(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        let mut succs: SmallVec<[BlockId; 2]> = SmallVec::new();
        for &tree in &self.blocks[block].trees {
            match self.nodes[tree].op {
                Opcode::Goto(t) | Opcode::IfNonZero(t) => push_unique(&mut succs, t),
                Opcode::VirtualGuard(g) => push_unique(&mut succs, g.slow_path),
                Opcode::InduceOsr { target, .. } => push_unique(&mut succs, target),
                _ => {}
            }
        }
        if self.falls_through(block) {
            if let Some(next) = self.next_in_layout(block) {
                push_unique(&mut succs, next);
            }
        }
        succs
    }

    /// Split `block` before tree `index`. The trees from `index` on move to a
    /// new block placed right after `block` in the layout, inheriting its
    /// frequency, coldness and exception handler.
    pub fn split_block(&mut self, block: BlockId, index: usize) -> BlockId {
        let (tail, frequency, is_cold, handler) = {
            let b = &mut self.blocks[block];
            let tail = b.trees.split_off(index.min(b.trees.len()));
            (tail, b.frequency, b.is_cold, b.handler)
        };
        let new_block = self.create_block(frequency);
        {
            let nb = &mut self.blocks[new_block];
            nb.trees = tail;
            nb.is_cold = is_cold;
            nb.handler = handler;
        }
        self.insert_block_after(block, new_block);
        new_block
    }

    // -------------------------------------------------------------------------
    // Trees
    // -------------------------------------------------------------------------

    /// Tree roots of `block`.
    #[inline]
    pub fn trees(&self, block: BlockId) -> &[NodeId] {
        &self.blocks[block].trees
    }

    /// Append a tree to `block`.
    pub fn append_tree(&mut self, block: BlockId, root: NodeId) {
        self.nodes[root].ref_count += 1;
        self.blocks[block].trees.push(root);
    }

    /// Insert a tree at `index` in `block`.
    pub fn insert_tree(&mut self, block: BlockId, index: usize, root: NodeId) {
        self.nodes[root].ref_count += 1;
        self.blocks[block].trees.insert(index, root);
    }

    /// Remove the tree at `index`, releasing its references.
    pub fn remove_tree(&mut self, block: BlockId, index: usize) -> NodeId {
        let root = self.blocks[block].trees.remove(index);
        self.dec_ref(root);
        root
    }

    /// Convenience: create a node and append it as a tree.
    pub fn append_new_tree(&mut self, block: BlockId, op: Opcode, children: &[NodeId], bc: ByteCodeInfo) -> NodeId {
        let root = self.create_node(op, children, bc);
        self.append_tree(block, root);
        root
    }

    /// Find the tree anchoring the call with byte-code identity `bc`.
    pub fn find_call(&self, bc: ByteCodeInfo) -> Option<(TreePos, NodeId)> {
        for &block in &self.layout {
            for (index, &tree) in self.blocks[block].trees.iter().enumerate() {
                if let Some(child) = self.nodes[tree].first_child() {
                    let node = &self.nodes[child];
                    if node.op.as_call().is_some() && node.bc == bc {
                        return Some((TreePos { block, index }, child));
                    }
                }
            }
        }
        None
    }

    /// Check whether any tree in the body stores to `symbol`.
    pub fn stores_to(&self, symbol: super::symbol::SymbolId) -> bool {
        self.layout.iter().any(|&b| {
            self.blocks[b]
                .trees
                .iter()
                .any(|&t| self.nodes[t].op == Opcode::Store(symbol))
        })
    }
}

fn push_unique(succs: &mut SmallVec<[BlockId; 2]>, block: BlockId) {
    if !succs.contains(&block) {
        succs.push(block);
    }
}

// =============================================================================
// Display
// =============================================================================

impl MethodBody {
    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize, seen: &mut BitSet) -> fmt::Result {
        let node = &self.nodes[id];
        let indent = "  ".repeat(depth);
        if !seen.insert(id.as_usize()) {
            return writeln!(f, "{}==>{} {}", indent, node.op.mnemonic(), id);
        }
        write!(f, "{}n{} {}", indent, id.index(), node.op.mnemonic())?;
        match node.op {
            Opcode::Const(v) => write!(f, " {}", v)?,
            Opcode::Load(s) | Opcode::Store(s) => {
                let name = self.symbols.get(s).map_or("?", |sym| sym.name.as_str());
                write!(f, " {}", name)?
            }
            Opcode::Call(desc) => write!(f, " {} {:?}", desc.method, desc.kind)?,
            Opcode::Goto(t) | Opcode::IfNonZero(t) => write!(f, " -> block_{}", t.index())?,
            Opcode::VirtualGuard(g) => write!(f, " {} -> block_{}", g.kind, g.slow_path.index())?,
            _ => {}
        }
        writeln!(f, "  [refs={} bc={}]", node.ref_count, node.bc)?;
        for &child in &node.children {
            self.fmt_node(f, child, depth + 1, seen)?;
        }
        Ok(())
    }
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seen = BitSet::with_capacity(self.nodes.len());
        for &block in &self.layout {
            let b = &self.blocks[block];
            write!(f, "block_{} (freq {})", block.index(), b.frequency)?;
            if b.is_cold {
                write!(f, " cold")?;
            }
            if let Some(h) = b.handler {
                write!(f, " handler block_{}", h.index())?;
            }
            writeln!(f)?;
            for &tree in &b.trees {
                self.fmt_node(f, tree, 1, &mut seen)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bc(i: u32) -> ByteCodeInfo {
        ByteCodeInfo::top_level(i)
    }

    #[test]
    fn test_reference_counts_follow_tree_edits() {
        let mut body = MethodBody::new(MethodId(0));
        let b = body.append_block(-1);
        let x = body.symbols.add_auto("x");
        let c = body.create_node(Opcode::Const(4), &[], bc(0));
        let store = body.append_new_tree(b, Opcode::Store(x), &[c], bc(0));

        assert_eq!(body.node(c).ref_count, 1);
        assert_eq!(body.node(store).ref_count, 1);

        let anchor = body.append_new_tree(b, Opcode::TreeTop, &[c], bc(1));
        assert_eq!(body.node(c).ref_count, 2);
        assert!(body.node(c).is_commoned());

        body.remove_tree(b, 1);
        assert_eq!(body.node(anchor).ref_count, 0);
        assert_eq!(body.node(c).ref_count, 1);
        assert_eq!(body.node_count(), 2);
    }

    #[test]
    fn test_replace_child_moves_reference() {
        let mut body = MethodBody::new(MethodId(0));
        let b = body.append_block(-1);
        let one = body.create_node(Opcode::Const(1), &[], bc(0));
        let two = body.create_node(Opcode::Const(2), &[], bc(0));
        let root = body.append_new_tree(b, Opcode::TreeTop, &[one], bc(0));
        body.replace_child(root, 0, two);
        assert_eq!(body.node(one).ref_count, 0);
        assert_eq!(body.node(two).ref_count, 1);
    }

    #[test]
    fn test_split_block_moves_tail_and_inherits_handler() {
        let mut body = MethodBody::new(MethodId(0));
        let b = body.append_block(50);
        let handler = body.append_block(-1);
        body.block_mut(b).handler = Some(handler);
        for i in 0..3 {
            let c = body.create_node(Opcode::Const(i), &[], bc(i as u32));
            body.append_new_tree(b, Opcode::TreeTop, &[c], bc(i as u32));
        }
        let tail = body.split_block(b, 1);
        assert_eq!(body.trees(b).len(), 1);
        assert_eq!(body.trees(tail).len(), 2);
        assert_eq!(body.layout(), &[b, tail, handler]);
        assert_eq!(body.block(tail).handler, Some(handler));
        assert_eq!(body.block(tail).frequency, 50);
        assert_eq!(body.successors(b).as_slice(), &[tail]);
    }

    #[test]
    fn test_successors_of_conditional_branch() {
        let mut body = MethodBody::new(MethodId(0));
        let a = body.append_block(-1);
        let fall = body.append_block(-1);
        let taken = body.append_block(-1);
        let cond = body.create_node(Opcode::Const(1), &[], bc(0));
        body.append_new_tree(a, Opcode::IfNonZero(taken), &[cond], bc(0));
        body.append_new_tree(fall, Opcode::Return, &[], bc(1));
        body.append_new_tree(taken, Opcode::Return, &[], bc(2));

        assert_eq!(body.successors(a).as_slice(), &[taken, fall]);
        assert!(body.successors(fall).is_empty());
    }

    #[test]
    fn test_deep_copy_is_unshared() {
        let mut body = MethodBody::new(MethodId(0));
        let one = body.create_node(Opcode::Const(1), &[], bc(0));
        let sum = body.create_node(Opcode::Add, &[one, one], bc(0));
        let copy = body.deep_copy(sum);
        assert_ne!(copy, sum);
        let kids = body.node(copy).children.clone();
        assert_ne!(kids[0], one);
        assert_ne!(kids[0], kids[1]);
    }
}
