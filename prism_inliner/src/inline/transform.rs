//! Tree merge: splicing a callee body into the caller.
//!
//! # Shapes
//!
//! A callee made of one block that ends in its only `return`, protected by
//! no guard, is merged in place: its trees land right before the call's
//! tree and the returned value replaces the call.
//!
//! Everything else goes through the general path:
//!
//! ```text
//!   B:  s1; s2; treetop call; s3        B:    s1; s2; [store parm temps]
//!                                       g*:   guards (if any)
//!                                       c1..: callee blocks
//!                                             return v  =>  store R, v; goto cont
//!                                       cont: s3      (call refs => load R)
//!                                       ...
//!                                       slow: store R, call; goto cont
//! ```
//!
//! When the call's only use is a `return call` or `store s, call` right
//! after it, that tree takes the place of `store R, v` at every exit and on
//! the slow path, and no `R` is created. A returning exit never jumps to
//! the continuation.
//!
//! After the split the injected-block fixup repairs references that now
//! cross an EBB boundary.
//!
//! # Failure
//!
//! All checks that can reject the callee run before the caller is touched,
//! so a failed splice leaves the body exactly as it was.

use super::call_site::{CallSite, CallTarget};
use super::call_stack::CallStack;
use super::fixup::{fixup_injected_block, FixupStats};
use super::guard::{insert_guard, rematerializable_args, CallResult, GuardPlan, GuardRequest, GuardedRegion};
use super::heuristics::InlineThresholds;
use super::mapper::{ParameterMap, ParameterPlan};
use crate::config::InlinerOptions;
use crate::error::FailureReason;
use crate::ir::{
    BitSet, BlockId, ByteCodeInfo, CallDescriptor, Cfg, InlinedSite, MethodBody, NodeId, Opcode, SymbolId, TreePos,
};
use crate::method::{ClassId, ResolvedMethod};
use crate::osr::use_osr_for_slow_path;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

// =============================================================================
// Outcome
// =============================================================================

/// Result of a successful splice.
#[derive(Debug, Clone)]
pub struct SpliceOutcome {
    /// Index of the new entry in the body's inlined-site table.
    pub site_index: i32,
    /// Caller blocks holding the callee's code, in layout order.
    pub blocks: Vec<BlockId>,
    /// Block the inlined code joins, when the caller block was split.
    pub continuation: Option<BlockId>,
    pub guard: Option<GuardedRegion>,
    pub merged_in_place: bool,
    /// Temporary receiving the callee's result. `None` when the value is
    /// unused or was stored or returned directly at each exit.
    pub result: Option<SymbolId>,
    pub fixup: FixupStats,
    /// Callee block to caller block.
    pub block_map: Vec<(BlockId, BlockId)>,
    /// Caller symbols holding callee formals of a known exact class.
    pub known_classes: Vec<(SymbolId, ClassId)>,
}

// =============================================================================
// Splice
// =============================================================================

/// Replace the call of `site` by the body of `target`.
///
/// The call must be the first child of the tree at `site.pos`. Symbols the
/// splice creates go to the current level of `stack`.
pub fn splice_callee(
    body: &mut MethodBody,
    site: &CallSite,
    target: &CallTarget,
    callee_body: &MethodBody,
    stack: &mut CallStack,
    options: &InlinerOptions,
    thresholds: &InlineThresholds,
) -> Result<SpliceOutcome, FailureReason> {
    let callee = &target.callee;

    if options.full_speed_debug && callee.has_breakpoints {
        return Err(FailureReason::DecompilationPointConflict);
    }
    let nodes = body.node_count() + callee_body.node_count();
    if nodes > thresholds.node_count as usize {
        tracing::debug!(nodes, limit = thresholds.node_count, callee = %callee.signature, "node budget exceeded");
        return Err(FailureReason::ExceedsNodeCountThreshold);
    }
    debug_assert_eq!(
        body.trees(site.pos.block)
            .get(site.pos.index)
            .and_then(|&t| body.node(t).first_child()),
        Some(site.call),
        "call must anchor its tree"
    );
    let plan = ParameterPlan::new(body, site.call, callee_body, site.kind.is_indirect())?;
    let guards = GuardPlan::new(&target.guard, options);
    let osr = !guards.is_empty() && options.osr && guards.allows_osr() && {
        let callers: SmallVec<[&ResolvedMethod; 8]> = stack.levels().iter().rev().map(|l| &l.method).collect();
        use_osr_for_slow_path(options, callee, site.kind.is_indirect(), site.bc.caller_index, &callers)
    };

    // Nothing below fails.
    body.inlined_sites.push(InlinedSite {
        method: callee.id,
        call: site.bc,
    });
    let site_index = (body.inlined_sites.len() - 1) as i32;
    let privatized = plan.privatized_count();
    let map = plan.apply(body, site.pos, stack);
    let anchor = TreePos {
        block: site.pos.block,
        index: site.pos.index + privatized,
    };

    let known_classes: Vec<(SymbolId, ClassId)> = map.known_classes().collect();
    let mut copy = CalleeCopy::new(callee_body, &callee.signature, &map, site_index);
    if can_merge_in_place(callee_body, &guards) {
        let mut outcome = merge_in_place(body, site, anchor, &mut copy, stack, site_index);
        outcome.known_classes = known_classes;
        return Ok(outcome);
    }

    let remat = if guards.is_empty() {
        SmallVec::new()
    } else {
        rematerializable_args(body, anchor.block, site.pos.index, anchor.index, &map)
    };

    let block = anchor.block;
    let (frequency, handler) = {
        let b = body.block(block);
        (b.frequency, b.handler)
    };
    let cont = body.split_block(block, anchor.index);
    if is_anchor_of(body, cont, 0, site.call) {
        body.remove_tree(cont, 0);
    }
    let result = if let Some(op) = value_anchor(body, cont, site.call) {
        body.remove_tree(cont, 0);
        CallResult::Anchor(op)
    } else if body.node(site.call).ref_count > 0 {
        let temp = stack.result_temp(&mut body.symbols);
        let load = body.create_node(Opcode::Load(temp), &[], site.bc);
        replace_references(body, site.call, load);
        CallResult::Temp(temp)
    } else {
        CallResult::Unused
    };

    // Callee blocks
    let mut blocks = Vec::with_capacity(callee_body.layout().len());
    for &cb in callee_body.layout() {
        let source = callee_body.block(cb);
        let f = if source.frequency >= 0 { source.frequency } else { frequency };
        let nb = body.create_block(f);
        body.block_mut(nb).is_cold = source.is_cold;
        copy.blocks.insert(cb, nb);
        blocks.push(nb);
    }
    for (&cb, &nb) in callee_body.layout().iter().zip(&blocks) {
        let mapped = callee_body
            .block(cb)
            .handler
            .and_then(|h| copy.blocks.get(&h).copied());
        body.block_mut(nb).handler = mapped.or(handler);
    }

    let exit = blocks.last().copied();
    for (&cb, &nb) in callee_body.layout().iter().zip(&blocks) {
        let trees = callee_body.trees(cb);
        for (i, &tree) in trees.iter().enumerate() {
            let source = callee_body.node(tree);
            if source.op != Opcode::Return {
                let root = copy.node(body, stack, tree);
                body.append_tree(nb, root);
                continue;
            }
            let bc = copy.bc(source.bc);
            let value = source.first_child().map(|v| copy.node(body, stack, v));
            let exit_op = match result {
                CallResult::Unused => Opcode::TreeTop,
                CallResult::Temp(r) => Opcode::Store(r),
                CallResult::Anchor(op) => op,
            };
            match value {
                Some(v) => {
                    body.append_new_tree(nb, exit_op, &[v], bc);
                }
                None if exit_op != Opcode::TreeTop => {
                    let null = body.create_node(Opcode::Null, &[], bc);
                    body.append_new_tree(nb, exit_op, &[null], bc);
                }
                None => {}
            }
            // the last callee block falls through into the continuation
            if !result.returns() && !(Some(nb) == exit && i + 1 == trees.len()) {
                body.append_new_tree(nb, Opcode::Goto(cont), &[], bc);
            }
        }
    }
    body.insert_blocks_after(block, &blocks);

    let guard = insert_guard(
        body,
        &guards,
        &GuardRequest {
            pre: block,
            site: site_index,
            call: CallDescriptor {
                method: site.declared,
                kind: site.kind,
            },
            bc: site.bc,
            callee: callee.id,
            map: &map,
            remat: &remat,
            result,
            continuation: cont,
            frequency,
            handler,
            osr,
        },
    );

    let region = fixup_region(body, block, cont, guard.as_ref().map(|g| g.slow_path));
    let fixup = fixup_injected_block(body, &region, &mut *stack);
    stack.current_mut().info_mut().inherit(block, cont);

    let block_map = copy.block_map();
    tracing::trace!(
        site = site_index,
        callee = %callee.signature,
        blocks = blocks.len(),
        guarded = guard.is_some(),
        "spliced callee"
    );
    Ok(SpliceOutcome {
        site_index,
        blocks,
        continuation: Some(cont),
        guard,
        merged_in_place: false,
        result: result.temp(),
        fixup,
        block_map,
        known_classes,
    })
}

/// Check whether the callee can be merged into the call's block.
fn can_merge_in_place(callee: &MethodBody, guards: &GuardPlan) -> bool {
    let [entry] = callee.layout() else {
        return false;
    };
    if !guards.is_empty() || callee.block(*entry).handler.is_some() {
        return false;
    }
    let Some((&last, rest)) = callee.trees(*entry).split_last() else {
        return false;
    };
    callee.node(last).op == Opcode::Return
        && rest.iter().all(|&t| {
            let op = callee.node(t).op;
            !op.is_branch() && !op.is_terminator() && !matches!(op, Opcode::InduceOsr { .. })
        })
}

fn merge_in_place(
    body: &mut MethodBody,
    site: &CallSite,
    anchor: TreePos,
    copy: &mut CalleeCopy<'_>,
    stack: &mut CallStack,
    site_index: i32,
) -> SpliceOutcome {
    let callee = copy.callee;
    let entry = callee.layout()[0];
    let block = anchor.block;
    let mut index = anchor.index;
    let mut value = None;
    for &tree in callee.trees(entry) {
        let source = callee.node(tree);
        let root = if source.op == Opcode::Return {
            let Some(v) = source.first_child() else {
                continue;
            };
            let v = copy.node(body, stack, v);
            value = Some(v);
            let bc = copy.bc(source.bc);
            body.create_node(Opcode::TreeTop, &[v], bc)
        } else {
            copy.node(body, stack, tree)
        };
        body.insert_tree(block, index, root);
        index += 1;
    }

    if is_anchor_of(body, block, index, site.call) {
        body.remove_tree(block, index);
    }
    if body.node(site.call).ref_count > 0 {
        let replacement = match value {
            Some(v) => v,
            None => body.create_node(Opcode::Null, &[], site.bc),
        };
        replace_references(body, site.call, replacement);
    }
    copy.blocks.insert(entry, block);

    tracing::trace!(site = site_index, trees = index - anchor.index, "merged callee in place");
    SpliceOutcome {
        site_index,
        blocks: vec![block],
        continuation: None,
        guard: None,
        merged_in_place: true,
        result: None,
        fixup: FixupStats::default(),
        block_map: copy.block_map(),
        known_classes: Vec::new(),
    }
}

/// Opcode of the tree at the head of `cont` when it is a `store` or `return`
/// whose only use of the value is `call`.
fn value_anchor(body: &MethodBody, cont: BlockId, call: NodeId) -> Option<Opcode> {
    let &tree = body.trees(cont).first()?;
    let node = body.node(tree);
    let anchors = matches!(node.op, Opcode::Return | Opcode::Store(_));
    (anchors && node.first_child() == Some(call) && body.node(call).ref_count == 1).then_some(node.op)
}

/// Check whether tree `index` of `block` is `treetop call`.
fn is_anchor_of(body: &MethodBody, block: BlockId, index: usize, call: NodeId) -> bool {
    body.trees(block).get(index).is_some_and(|&t| {
        let node = body.node(t);
        node.op == Opcode::TreeTop && node.first_child() == Some(call)
    })
}

/// Point every reference to `old` at `new`.
fn replace_references(body: &mut MethodBody, old: NodeId, new: NodeId) {
    let mut edges: Vec<(NodeId, usize)> = Vec::new();
    let mut visited = BitSet::with_capacity(body.node_slots());
    for &block in body.layout() {
        for &tree in body.trees(block) {
            body.walk_tree(tree, &mut visited, &mut |id, node| {
                for (slot, &child) in node.children.iter().enumerate() {
                    if child == old {
                        edges.push((id, slot));
                    }
                }
            });
        }
    }
    for (parent, slot) in edges {
        body.replace_child(parent, slot, new);
    }
}

/// Blocks the fixup walks: from the EBB leader of the split block through
/// the continuation's EBB, then the slow path.
fn fixup_region(body: &MethodBody, block: BlockId, cont: BlockId, slow: Option<BlockId>) -> Vec<BlockId> {
    let leaders = Cfg::build(body).ebb_leaders(body);
    let leader_of = |b: BlockId| leaders.get(b).copied().unwrap_or(b);
    let layout = body.layout();
    let start = body
        .layout_position(leader_of(block))
        .or_else(|| body.layout_position(block))
        .unwrap_or(0);
    let cont_pos = body.layout_position(cont).unwrap_or(layout.len());
    let cont_leader = leader_of(cont);
    let end = layout[cont_pos.min(layout.len())..]
        .iter()
        .position(|&b| leader_of(b) != cont_leader)
        .map_or(layout.len(), |n| cont_pos + n);

    let mut region: Vec<BlockId> = layout[start..end].to_vec();
    if let Some(slow) = slow {
        if !region.contains(&slow) {
            region.push(slow);
        }
    }
    region
}

// =============================================================================
// Callee Copy
// =============================================================================

/// Copies callee nodes into the caller, rewriting symbols, branch targets
/// and byte-code identities.
struct CalleeCopy<'a> {
    callee: &'a MethodBody,
    signature: &'a str,
    map: &'a ParameterMap,
    site: i32,
    nodes: FxHashMap<NodeId, NodeId>,
    locals: FxHashMap<SymbolId, SymbolId>,
    blocks: FxHashMap<BlockId, BlockId>,
}

impl<'a> CalleeCopy<'a> {
    fn new(callee: &'a MethodBody, signature: &'a str, map: &'a ParameterMap, site: i32) -> Self {
        Self {
            callee,
            signature,
            map,
            site,
            nodes: FxHashMap::default(),
            locals: FxHashMap::default(),
            blocks: FxHashMap::default(),
        }
    }

    fn bc(&self, bc: ByteCodeInfo) -> ByteCodeInfo {
        ByteCodeInfo {
            caller_index: self.site,
            bc_index: bc.bc_index,
        }
    }

    /// Caller automatic standing for callee local `symbol`.
    fn local(&mut self, body: &mut MethodBody, stack: &mut CallStack, symbol: SymbolId) -> SymbolId {
        if let Some(&local) = self.locals.get(&symbol) {
            return local;
        }
        let callee = self.callee;
        let name = callee.symbols.get(symbol).map_or("?", |s| s.name.as_str());
        let local = body
            .symbols
            .new_pending_auto(format!("{}.{}", self.signature, name));
        stack.add_auto(local);
        self.locals.insert(symbol, local);
        local
    }

    /// Copy the callee expression rooted at `id`, sharing what the callee
    /// shares.
    fn node(&mut self, body: &mut MethodBody, stack: &mut CallStack, id: NodeId) -> NodeId {
        if let Some(&copied) = self.nodes.get(&id) {
            return copied;
        }
        let callee = self.callee;
        let source = callee.node(id);
        let children: SmallVec<[NodeId; 4]> = source
            .children
            .iter()
            .map(|&c| self.node(body, stack, c))
            .collect();

        let map = self.map;
        let mut op = match source.op {
            Opcode::Load(symbol) => match map.load_op(symbol) {
                Some(op) => op,
                None => Opcode::Load(self.local(body, stack, symbol)),
            },
            Opcode::Store(symbol) => match map.store_target(symbol) {
                Some(temp) => Opcode::Store(temp),
                None => Opcode::Store(self.local(body, stack, symbol)),
            },
            op => op,
        };
        let target = match op {
            Opcode::InduceOsr { target, .. } => Some(target),
            op => op.branch_target(),
        };
        if let Some(&mapped) = target.and_then(|t| self.blocks.get(&t)) {
            op.set_branch_target(mapped);
        }

        let bc = self.bc(source.bc);
        let copied = body.create_node(op, &children, bc);
        self.nodes.insert(id, copied);
        copied
    }

    fn block_map(&self) -> Vec<(BlockId, BlockId)> {
        self.callee
            .layout()
            .iter()
            .filter_map(|b| self.blocks.get(b).map(|&to| (*b, to)))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
