//! Injected-block fixup.
//!
//! Splitting a block turns one extended basic block into several. Nodes that
//! were commoned across the split point are then referenced from more than
//! one EBB, which the IR forbids: a later EBB can be entered along an edge
//! that never evaluated them.
//!
//! The fixup walks a region of blocks EBB by EBB and repairs every such
//! reference:
//!
//! ```text
//!   before                          after
//!   ------                          -----
//!   BB1: treetop n                  BB1: treetop n
//!                                        store T, n
//!   BB2 (new EBB): ... n ...        BB2: ... load T ...
//! ```
//!
//! Constants are duplicated instead of stored. Every later EBB shares one
//! `load T` (or one constant copy) per repaired node. A repaired body has
//! nothing left to repair, so a second run changes nothing.

use crate::ir::{BlockId, ByteCodeInfo, Cfg, MethodBody, NodeId, Opcode, SymbolId, SymbolTable};
use rustc_hash::FxHashMap;

/// Supplier of the temporaries the fixup stores repaired values to.
pub trait TempSource {
    fn injected_block_temp(&mut self, symbols: &mut SymbolTable) -> SymbolId;
}

/// Always creates a fresh temporary and records it.
impl TempSource for Vec<SymbolId> {
    fn injected_block_temp(&mut self, symbols: &mut SymbolTable) -> SymbolId {
        let temp = symbols.new_temp("ibt");
        self.push(temp);
        temp
    }
}

/// What one fixup run changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixupStats {
    /// Injected-block temporaries created.
    pub temps: u32,
    /// Constant nodes duplicated.
    pub constants: u32,
    /// `load temp` nodes created.
    pub loads: u32,
}

impl FixupStats {
    /// Check whether the run changed nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.temps == 0 && self.constants == 0 && self.loads == 0
    }

    pub fn merge(&mut self, other: FixupStats) {
        self.temps += other.temps;
        self.constants += other.constants;
        self.loads += other.loads;
    }
}

/// First reference of a node inside the region.
#[derive(Debug, Clone, Copy)]
struct FirstRef {
    leader: BlockId,
    block: BlockId,
    /// Root of the tree holding the first reference.
    tree: NodeId,
}

/// Repair cross-EBB references among the trees of `region`.
///
/// `region` lists blocks in execution-layout order and must start at an EBB
/// leader. Temporaries come from `temps`.
pub fn fixup_injected_block(body: &mut MethodBody, region: &[BlockId], temps: &mut impl TempSource) -> FixupStats {
    let leaders = Cfg::build(body).ebb_leaders(body);
    let mut stats = FixupStats::default();
    let mut first_refs: FxHashMap<NodeId, FirstRef> = FxHashMap::default();
    let mut stored: FxHashMap<NodeId, SymbolId> = FxHashMap::default();
    // (EBB leader, original node) -> replacement
    let mut replacements: FxHashMap<(BlockId, NodeId), NodeId> = FxHashMap::default();

    for &block in region {
        let leader = leaders.get(block).copied().unwrap_or(block);
        let mut index = 0;
        while index < body.trees(block).len() {
            let tree = body.trees(block)[index];
            first_refs.entry(tree).or_insert(FirstRef { leader, block, tree });

            let mut work: Vec<(NodeId, usize)> = child_slots(body, tree);
            while let Some((parent, slot)) = work.pop() {
                let child = body.node(parent).children[slot];
                match first_refs.get(&child).copied() {
                    None => {
                        first_refs.insert(child, FirstRef { leader, block, tree });
                        work.extend(child_slots(body, child));
                    }
                    Some(first) if first.leader == leader => {}
                    Some(first) => {
                        let replacement = match replacements.get(&(leader, child)) {
                            Some(&r) => r,
                            None => {
                                let r = repair(body, child, first, &mut stored, temps, &mut stats);
                                first_refs.insert(r, FirstRef { leader, block, tree });
                                replacements.insert((leader, child), r);
                                r
                            }
                        };
                        body.replace_child(parent, slot, replacement);
                    }
                }
            }
            index = body
                .trees(block)
                .iter()
                .position(|&t| t == tree)
                .unwrap_or(index)
                + 1;
        }
    }

    if !stats.is_empty() {
        tracing::trace!(
            temps = stats.temps,
            constants = stats.constants,
            loads = stats.loads,
            "repaired cross-EBB references"
        );
    }
    stats
}

fn child_slots(body: &MethodBody, node: NodeId) -> Vec<(NodeId, usize)> {
    (0..body.node(node).children.len()).map(|slot| (node, slot)).collect()
}

/// Build the node that replaces a cross-EBB reference to `node`.
fn repair(
    body: &mut MethodBody,
    node: NodeId,
    first: FirstRef,
    stored: &mut FxHashMap<NodeId, SymbolId>,
    temps: &mut impl TempSource,
    stats: &mut FixupStats,
) -> NodeId {
    let (op, bc) = {
        let n = body.node(node);
        (n.op, n.bc)
    };
    if op.is_load_const() {
        stats.constants += 1;
        return body.create_node(op, &[], bc);
    }

    let temp = match stored.get(&node) {
        Some(&temp) => temp,
        None => {
            let temp = temps.injected_block_temp(&mut body.symbols);
            store_after_first_ref(body, node, temp, first, bc);
            stored.insert(node, temp);
            stats.temps += 1;
            temp
        }
    };
    stats.loads += 1;
    body.create_node(Opcode::Load(temp), &[], bc)
}

fn store_after_first_ref(body: &mut MethodBody, node: NodeId, temp: SymbolId, first: FirstRef, bc: ByteCodeInfo) {
    let trees = body.trees(first.block);
    let position = trees.iter().position(|&t| t == first.tree).unwrap_or(trees.len());
    let op = body.node(first.tree).op;
    // control may leave at the tree itself, so the store has to come first
    let index = if op.is_terminator() || op.is_branch() || position == trees.len() {
        position
    } else {
        position + 1
    };
    let store = body.create_node(Opcode::Store(temp), &[node], bc);
    body.insert_tree(first.block, index, store);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerifyError;
    use crate::ir::{verify, Interpreter, MethodBuilder, Outcome, Value};
    use crate::method::MethodId;
    use crate::services::Program;

    /// `A: treetop n; ifnonzero c -> J`, `M: store y`, `J: return n + 7`
    /// where `n` and the constant 7 are shared between A and J.
    fn split_body() -> (MethodBody, [BlockId; 3]) {
        let mut b = MethodBuilder::new(MethodId(0));
        let x = b.parm("x");
        let y = b.auto("y");
        let a = b.block();
        let lx = b.load(x);
        let seven = b.iconst(7);
        let n = b.add(lx, seven);
        b.anchor(n);
        let cond = b.cmp_lt(lx, seven);
        let m = b.block();
        let j = b.block();
        b.switch_to(a);
        b.if_nonzero(cond, j);
        b.switch_to(m);
        b.store(y, seven);
        b.switch_to(j);
        let sum = b.add(n, seven);
        b.ret(Some(sum));
        (b.finish(), [a, m, j])
    }

    fn run(body: &MethodBody, x: i64) -> Outcome {
        let program = Program::new();
        Interpreter::new(&program, &program).run(body, &[Value::Int(x)]).unwrap()
    }

    #[test]
    fn test_repairs_cross_ebb_references() {
        let (mut body, region) = split_body();
        assert!(matches!(verify(&body), Err(VerifyError::CrossEbbCommoning { .. })));
        let before = [run(&body, 3), run(&body, 30)];

        let mut temps = Vec::<SymbolId>::new();
        let stats = fixup_injected_block(&mut body, &region, &mut temps);
        assert_eq!(stats.temps, 1);
        assert_eq!(stats.loads, 1);
        assert!(stats.constants >= 1);
        assert_eq!(temps.len(), 1);
        assert_eq!(verify(&body), Ok(()));

        // the store follows the anchoring tree, ahead of the branch
        let a = region[0];
        assert_eq!(body.node(body.trees(a)[1]).op, Opcode::Store(temps[0]));
        assert_eq!([run(&body, 3), run(&body, 30)], before);
    }

    #[test]
    fn test_fixup_is_idempotent() {
        let (mut body, region) = split_body();
        let mut temps = Vec::<SymbolId>::new();
        fixup_injected_block(&mut body, &region, &mut temps);
        let slots = body.node_slots();
        let trees: Vec<usize> = region.iter().map(|&b| body.trees(b).len()).collect();

        let again = fixup_injected_block(&mut body, &region, &mut temps);
        assert!(again.is_empty());
        assert_eq!(body.node_slots(), slots);
        assert_eq!(region.iter().map(|&b| body.trees(b).len()).collect::<Vec<_>>(), trees);
        assert_eq!(temps.len(), 1);
    }

    #[test]
    fn test_single_ebb_is_untouched() {
        let mut b = MethodBuilder::new(MethodId(0));
        let x = b.parm("x");
        let a = b.block();
        let lx = b.load(x);
        let sq = b.mul(lx, lx);
        b.anchor(sq);
        let tail = b.block();
        b.ret(Some(sq));
        let mut body = b.finish();

        let stats = fixup_injected_block(&mut body, &[a, tail], &mut Vec::<SymbolId>::new());
        assert!(stats.is_empty());
        assert_eq!(verify(&body), Ok(()));
    }
}
