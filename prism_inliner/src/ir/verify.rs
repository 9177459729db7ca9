//! Structural IR verification.
//!
//! Checked rules:
//! - reference counts equal the number of tree roots and child edges that
//!   point at each node, counting the children of every live node once;
//! - root-only opcodes never appear as children;
//! - terminators are the last tree of their block;
//! - branch targets and handlers are laid out;
//! - no node is referenced from two extended basic blocks.

use super::arena::{BitSet, SecondaryMap};
use super::body::MethodBody;
use super::cfg::Cfg;
use super::block::BlockId;
use super::node::{Node, NodeId, Opcode};
use crate::error::VerifyError;

/// Verify `body`, returning the first defect found.
pub fn verify(body: &MethodBody) -> Result<(), VerifyError> {
    check_block_structure(body)?;
    check_reference_counts(body)?;
    check_ebb_commoning(body)
}

fn check_block_structure(body: &MethodBody) -> Result<(), VerifyError> {
    let mut laid_out = BitSet::with_capacity(body.block_slots());
    for &block in body.layout() {
        laid_out.insert(block.as_usize());
    }

    for &block in body.layout() {
        let trees = body.trees(block);
        for (i, &tree) in trees.iter().enumerate() {
            let node = body.try_node(tree).ok_or(VerifyError::UnknownNode { node: tree })?;
            if node.op.is_terminator() && i + 1 != trees.len() {
                return Err(VerifyError::TerminatorNotLast { block });
            }
            let target = match node.op {
                Opcode::InduceOsr { target, .. } => Some(target),
                op => op.branch_target(),
            };
            if let Some(to) = target {
                if !laid_out.contains(to.as_usize()) {
                    return Err(VerifyError::DanglingBranch { from: block, to });
                }
            }
        }
        if let Some(to) = body.block(block).handler {
            if !laid_out.contains(to.as_usize()) {
                return Err(VerifyError::DanglingBranch { from: block, to });
            }
        }
    }
    Ok(())
}

fn check_reference_counts(body: &MethodBody) -> Result<(), VerifyError> {
    let mut expected: SecondaryMap<Node, u32> = SecondaryMap::with_capacity(body.node_slots());
    let mut visited = BitSet::with_capacity(body.node_slots());
    let mut worklist: Vec<NodeId> = Vec::new();

    for &block in body.layout() {
        for &tree in body.trees(block) {
            *expected.entry(tree) += 1;
            worklist.push(tree);
        }
    }

    while let Some(id) = worklist.pop() {
        if !visited.insert(id.as_usize()) {
            continue;
        }
        let node = body.try_node(id).ok_or(VerifyError::UnknownNode { node: id })?;
        for &child in &node.children {
            let child_node = body
                .try_node(child)
                .ok_or(VerifyError::UnknownNode { node: child })?;
            if child_node.op.is_root_only() {
                return Err(VerifyError::RootOnlyAsChild { node: child });
            }
            *expected.entry(child) += 1;
            worklist.push(child);
        }
    }

    for index in 0..body.node_slots() {
        let id = NodeId::new(index as u32);
        let want = expected.get(id).copied().unwrap_or(0);
        let have = body.node(id).ref_count;
        if want != have {
            return Err(VerifyError::RefCountMismatch {
                node: id,
                expected: want,
                actual: have,
            });
        }
    }
    Ok(())
}

fn check_ebb_commoning(body: &MethodBody) -> Result<(), VerifyError> {
    let cfg = Cfg::build(body);
    let leaders = cfg.ebb_leaders(body);
    let mut owner: SecondaryMap<Node, BlockId> = SecondaryMap::with_capacity(body.node_slots());
    let mut seen_in_ebb = BitSet::new();
    let mut current_leader = None;

    for &block in body.layout() {
        let leader = leaders.get(block).copied().unwrap_or(block);
        if current_leader != Some(leader) {
            current_leader = Some(leader);
            seen_in_ebb = BitSet::new();
        }
        for &tree in body.trees(block) {
            let mut stack = vec![tree];
            while let Some(id) = stack.pop() {
                if !seen_in_ebb.insert(id.as_usize()) {
                    continue;
                }
                let slot = owner.entry(id);
                if !slot.is_valid() {
                    *slot = leader;
                } else if *slot != leader {
                    return Err(VerifyError::CrossEbbCommoning {
                        node: id,
                        first: *slot,
                        second: leader,
                    });
                }
                stack.extend(body.node(id).children.iter().copied());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::ByteCodeInfo;
    use crate::method::MethodId;

    fn bc() -> ByteCodeInfo {
        ByteCodeInfo::top_level(0)
    }

    #[test]
    fn test_well_formed_body_verifies() {
        let mut body = MethodBody::new(MethodId(0));
        let b = body.append_block(-1);
        let one = body.create_node(Opcode::Const(1), &[], bc());
        let sum = body.create_node(Opcode::Add, &[one, one], bc());
        body.append_new_tree(b, Opcode::TreeTop, &[sum], bc());
        body.append_new_tree(b, Opcode::Return, &[sum], bc());
        assert_eq!(verify(&body), Ok(()));
    }

    #[test]
    fn test_terminator_must_be_last() {
        let mut body = MethodBody::new(MethodId(0));
        let b = body.append_block(-1);
        body.append_new_tree(b, Opcode::Return, &[], bc());
        let c = body.create_node(Opcode::Const(0), &[], bc());
        body.append_new_tree(b, Opcode::TreeTop, &[c], bc());
        assert_eq!(verify(&body), Err(VerifyError::TerminatorNotLast { block: b }));
    }

    #[test]
    fn test_orphaned_node_breaks_reference_counts() {
        let mut body = MethodBody::new(MethodId(0));
        let b = body.append_block(-1);
        let c = body.create_node(Opcode::Const(0), &[], bc());
        let _orphan = body.create_node(Opcode::Neg, &[c], bc());
        body.append_new_tree(b, Opcode::Return, &[], bc());
        assert!(matches!(verify(&body), Err(VerifyError::RefCountMismatch { .. })));
    }

    #[test]
    fn test_cross_ebb_commoning_is_rejected() {
        let mut body = MethodBody::new(MethodId(0));
        let a = body.append_block(-1);
        let b = body.append_block(-1);
        let c = body.append_block(-1);
        let v = body.create_node(Opcode::Const(7), &[], bc());
        let cond = body.create_node(Opcode::Const(1), &[], bc());
        body.append_new_tree(a, Opcode::TreeTop, &[v], bc());
        body.append_new_tree(a, Opcode::IfNonZero(c), &[cond], bc());
        body.append_new_tree(b, Opcode::Goto(c), &[], bc());
        body.append_new_tree(c, Opcode::Return, &[v], bc());
        assert!(matches!(
            verify(&body),
            Err(VerifyError::CrossEbbCommoning { node, .. }) if node == v
        ));
    }
}
