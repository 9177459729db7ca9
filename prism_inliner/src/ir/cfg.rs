//! Control flow graph analysis for the tree IR.
//!
//! Edges are never stored on blocks. They are recomputed here from the
//! branch trees, guard slow paths, OSR transitions, layout fall-through and
//! exception handlers, which keeps splicing simple: the inliner only edits
//! trees and layout, then rebuilds the CFG when it needs one.
//!
//! # Extended Basic Blocks
//!
//! A block *extends* its layout predecessor `p` when `p` falls through into
//! it and `p` is its only predecessor, normal or exceptional. A maximal run
//! of such blocks is an extended basic block (EBB); the first block of the
//! run is its leader. Node commoning is only legal within one EBB.

use super::arena::{BitSet, SecondaryMap};
use super::block::{Block, BlockId};
use super::body::MethodBody;
use super::node::Opcode;
use smallvec::SmallVec;

type Edges = SmallVec<[BlockId; 2]>;

// =============================================================================
// CFG
// =============================================================================

/// Derived control flow graph of a method body.
#[derive(Debug, Clone)]
pub struct Cfg {
    succs: SecondaryMap<Block, Edges>,
    preds: SecondaryMap<Block, Edges>,
    exception_preds: SecondaryMap<Block, Edges>,
    /// Entry block; invalid for an empty body.
    pub entry: BlockId,
    /// Reverse postorder over normal and exception edges.
    pub rpo: Vec<BlockId>,
    reachable: BitSet,
}

impl Cfg {
    /// Build the CFG of `body`.
    pub fn build(body: &MethodBody) -> Self {
        let slots = body.block_slots();
        let mut cfg = Cfg {
            succs: SecondaryMap::with_capacity(slots),
            preds: SecondaryMap::with_capacity(slots),
            exception_preds: SecondaryMap::with_capacity(slots),
            entry: body.entry().unwrap_or(BlockId::INVALID),
            rpo: Vec::new(),
            reachable: BitSet::with_capacity(slots),
        };

        for &block in body.layout() {
            for succ in body.successors(block) {
                cfg.succs.entry(block).push(succ);
                let preds = cfg.preds.entry(succ);
                if !preds.contains(&block) {
                    preds.push(block);
                }
            }
            if let Some(handler) = body.block(block).handler {
                let preds = cfg.exception_preds.entry(handler);
                if !preds.contains(&block) {
                    preds.push(block);
                }
            }
        }

        cfg.compute_rpo(body);
        cfg
    }

    fn compute_rpo(&mut self, body: &MethodBody) {
        if !self.entry.is_valid() {
            return;
        }
        let mut postorder = Vec::with_capacity(body.layout().len());
        // Iterative DFS: (block, next successor index)
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        self.reachable.insert(self.entry.as_usize());

        while let Some(top) = stack.last_mut() {
            let (block, next) = *top;
            top.1 += 1;
            let succ = self.all_successors(body, block).get(next).copied();
            match succ {
                Some(s) => {
                    if self.reachable.insert(s.as_usize()) {
                        stack.push((s, 0));
                    }
                }
                None => {
                    postorder.push(block);
                    stack.pop();
                }
            }
        }

        postorder.reverse();
        self.rpo = postorder;
    }

    fn all_successors(&self, body: &MethodBody, block: BlockId) -> Edges {
        let mut all = self.successors(block).iter().copied().collect::<Edges>();
        if let Some(handler) = body.block(block).handler {
            if !all.contains(&handler) {
                all.push(handler);
            }
        }
        all
    }

    /// Normal successors.
    #[inline]
    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        self.succs.get(block).map_or(&[], |e| e.as_slice())
    }

    /// Normal predecessors.
    #[inline]
    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.preds.get(block).map_or(&[], |e| e.as_slice())
    }

    /// Blocks whose exceptions are handled by `block`.
    #[inline]
    pub fn exception_predecessors(&self, block: BlockId) -> &[BlockId] {
        self.exception_preds.get(block).map_or(&[], |e| e.as_slice())
    }

    /// Check whether `block` is an exception handler for any block.
    #[inline]
    pub fn has_exception_predecessors(&self, block: BlockId) -> bool {
        !self.exception_predecessors(block).is_empty()
    }

    /// Check whether `block` is reachable from the entry.
    #[inline]
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.reachable.contains(block.as_usize())
    }

    // -------------------------------------------------------------------------
    // Extended basic blocks
    // -------------------------------------------------------------------------

    /// Check whether `block` extends the EBB of its layout predecessor.
    pub fn extends_previous(&self, body: &MethodBody, block: BlockId) -> bool {
        if block == self.entry || self.has_exception_predecessors(block) {
            return false;
        }
        let Some(pos) = body.layout_position(block) else {
            return false;
        };
        if pos == 0 {
            return false;
        }
        let prev = body.layout()[pos - 1];
        body.falls_through(prev) && self.predecessors(block) == [prev]
    }

    /// Map every laid-out block to the leader of its EBB.
    pub fn ebb_leaders(&self, body: &MethodBody) -> SecondaryMap<Block, BlockId> {
        let mut leaders = SecondaryMap::with_capacity(body.block_slots());
        let mut current = BlockId::INVALID;
        for &block in body.layout() {
            if !current.is_valid() || !self.extends_previous(body, block) {
                current = block;
            }
            leaders.set(block, current);
        }
        leaders
    }

    // -------------------------------------------------------------------------
    // Loops and always-reached blocks
    // -------------------------------------------------------------------------

    /// Blocks that belong to some natural loop.
    ///
    /// A back edge is an edge to a block still on the DFS stack; the loop
    /// body is everything that reaches the back edge source without passing
    /// through the header.
    pub fn looping_blocks(&self) -> BitSet {
        let mut in_loop = BitSet::new();
        if !self.entry.is_valid() {
            return in_loop;
        }

        let mut on_stack = BitSet::new();
        let mut visited = BitSet::new();
        let mut back_edges: Vec<(BlockId, BlockId)> = Vec::new();
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited.insert(self.entry.as_usize());
        on_stack.insert(self.entry.as_usize());

        while let Some(top) = stack.last_mut() {
            let (block, next) = *top;
            top.1 += 1;
            let succ = self.successors(block).get(next).copied();
            match succ {
                Some(s) if on_stack.contains(s.as_usize()) => back_edges.push((block, s)),
                Some(s) => {
                    if visited.insert(s.as_usize()) {
                        on_stack.insert(s.as_usize());
                        stack.push((s, 0));
                    }
                }
                None => {
                    on_stack.remove(block.as_usize());
                    stack.pop();
                }
            }
        }

        for (source, header) in back_edges {
            let mut body = BitSet::new();
            body.insert(header.as_usize());
            let mut worklist = vec![source];
            while let Some(b) = worklist.pop() {
                if body.insert(b.as_usize()) {
                    worklist.extend(self.predecessors(b).iter().copied());
                }
            }
            in_loop.union_with(&body);
        }
        in_loop
    }

    /// Blocks executed on every path from entry to the normal exit.
    ///
    /// Walks forward from the entry along single-successor, single-predecessor
    /// chains, then backward from the unique returning block (if there is one)
    /// along the same kind of chain.
    pub fn always_reached_blocks(&self, body: &MethodBody) -> BitSet {
        let mut reached = BitSet::new();
        if !self.entry.is_valid() {
            return reached;
        }

        let mut current = self.entry;
        reached.insert(current.as_usize());
        loop {
            let [next] = self.successors(current) else { break };
            let next = *next;
            if self.predecessors(next) != [current]
                || self.has_exception_predecessors(next)
                || !reached.insert(next.as_usize())
            {
                break;
            }
            current = next;
        }

        let mut exits = body.layout().iter().copied().filter(|&b| {
            self.is_reachable(b)
                && body
                    .block(b)
                    .last_tree()
                    .is_some_and(|t| body.node(t).op == Opcode::Return)
        });
        let (Some(exit), None) = (exits.next(), exits.next()) else {
            return reached;
        };

        let mut current = exit;
        reached.insert(current.as_usize());
        loop {
            let [prev] = self.predecessors(current) else { break };
            let prev = *prev;
            if self.successors(prev) != [current] || !reached.insert(prev.as_usize()) {
                break;
            }
            current = prev;
        }
        reached
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::ByteCodeInfo;
    use crate::method::MethodId;

    fn bc() -> ByteCodeInfo {
        ByteCodeInfo::top_level(0)
    }

    /// entry -> header <-> body, header -> exit
    fn loop_body() -> (MethodBody, [BlockId; 4]) {
        let mut body = MethodBody::new(MethodId(0));
        let entry = body.append_block(-1);
        let header = body.append_block(-1);
        let looped = body.append_block(-1);
        let exit = body.append_block(-1);
        let cond = body.create_node(Opcode::Const(0), &[], bc());
        body.append_new_tree(header, Opcode::IfNonZero(exit), &[cond], bc());
        body.append_new_tree(looped, Opcode::Goto(header), &[], bc());
        body.append_new_tree(exit, Opcode::Return, &[], bc());
        (body, [entry, header, looped, exit])
    }

    #[test]
    fn test_cfg_build_edges() {
        let (body, [entry, header, looped, exit]) = loop_body();
        let cfg = Cfg::build(&body);
        assert_eq!(cfg.successors(entry), &[header]);
        assert_eq!(cfg.successors(header), &[exit, looped]);
        assert_eq!(cfg.predecessors(header), &[entry, looped]);
        assert_eq!(cfg.rpo.first(), Some(&entry));
        assert!(cfg.is_reachable(exit));
    }

    #[test]
    fn test_looping_blocks() {
        let (body, [entry, header, looped, exit]) = loop_body();
        let in_loop = Cfg::build(&body).looping_blocks();
        assert!(in_loop.contains(header.as_usize()));
        assert!(in_loop.contains(looped.as_usize()));
        assert!(!in_loop.contains(entry.as_usize()));
        assert!(!in_loop.contains(exit.as_usize()));
    }

    #[test]
    fn test_ebb_leaders() {
        let (body, [entry, header, looped, exit]) = loop_body();
        let cfg = Cfg::build(&body);
        let leaders = cfg.ebb_leaders(&body);
        assert_eq!(leaders.get(entry), Some(&entry));
        // header has two predecessors
        assert_eq!(leaders.get(header), Some(&header));
        // looped only falls in from header
        assert_eq!(leaders.get(looped), Some(&header));
        assert_eq!(leaders.get(exit), Some(&exit));
    }

    #[test]
    fn test_handler_starts_new_ebb() {
        let mut body = MethodBody::new(MethodId(0));
        let a = body.append_block(-1);
        let h = body.append_block(-1);
        body.block_mut(a).handler = Some(h);
        body.append_new_tree(h, Opcode::Return, &[], bc());
        let cfg = Cfg::build(&body);
        assert_eq!(cfg.exception_predecessors(h), &[a]);
        assert!(!cfg.extends_previous(&body, h));
    }

    #[test]
    fn test_always_reached_straight_line() {
        let mut body = MethodBody::new(MethodId(0));
        let a = body.append_block(-1);
        let b = body.append_block(-1);
        let side = body.append_block(-1);
        let c = body.append_block(-1);
        let cond = body.create_node(Opcode::Const(1), &[], bc());
        body.append_new_tree(b, Opcode::IfNonZero(c), &[cond], bc());
        body.append_new_tree(side, Opcode::Goto(c), &[], bc());
        body.append_new_tree(c, Opcode::Return, &[], bc());

        let cfg = Cfg::build(&body);
        let reached = cfg.always_reached_blocks(&body);
        assert!(reached.contains(a.as_usize()));
        assert!(reached.contains(b.as_usize()));
        assert!(reached.contains(c.as_usize()));
        assert!(!reached.contains(side.as_usize()));
    }
}
