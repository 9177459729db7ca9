//! Virtual guard insertion.
//!
//! A guarded inline produces the following shape:
//!
//! ```text
//!   pre:   ...                      (privatizing stores end here)
//!   g1:    virtualguard Breakpoint ─────────┐
//!   g2:    virtualguard <primary>  ─────────┤
//!   g3:    virtualguard HCR        ─────────┤
//!   callee blocks ...                       │
//!   cont:  ...                  ◀───────┐   │
//!   ...                                 │   │
//!   slow:  [induceosr]                  │ ◀─┘
//!          store R, call <original>     │
//!          goto cont ───────────────────┘
//! ```
//!
//! Guards fall through to the inlined body when they pass and branch to the
//! slow path otherwise. The slow path re-executes the original call on the
//! privatized (or rematerialized) arguments and joins the continuation.

use super::call_site::VirtualGuardSelection;
use super::mapper::{ParameterMap, ParameterMapping};
use crate::config::InlinerOptions;
use crate::ir::{
    BlockId, ByteCodeInfo, CallDescriptor, GuardKind, GuardNode, GuardTestType, MethodBody, NodeId, Opcode,
    SymbolId, MAX_COLD_BLOCK_COUNT, VERSIONED_COLD_BLOCK_COUNT,
};
use crate::method::{ClassId, MethodId};
use crate::osr::find_or_create_site_block;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// Fast-path frequency divisor for likely-taken slow paths.
pub const SLOW_PATH_SCALE: i32 = 10;

// =============================================================================
// Guard Plan
// =============================================================================

/// One guard tree to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardLayer {
    pub kind: GuardKind,
    pub test: GuardTestType,
    pub class: Option<ClassId>,
    pub merged_with_hcr: bool,
}

impl GuardLayer {
    fn new(kind: GuardKind, test: GuardTestType) -> Self {
        Self {
            kind,
            test,
            class: None,
            merged_with_hcr: false,
        }
    }
}

/// The guards protecting one inlined target, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardPlan {
    pub layers: SmallVec<[GuardLayer; 3]>,
    /// The selection the plan was built from.
    pub primary: Option<VirtualGuardSelection>,
}

impl GuardPlan {
    /// Layer the selected guard with the mode-specific guards.
    ///
    /// A breakpoint guard goes first under full-speed debug. An HCR guard
    /// goes last under hot code replace, unless the back end can fold it
    /// into the primary guard.
    pub fn new(selection: &VirtualGuardSelection, options: &InlinerOptions) -> Self {
        let mut layers: SmallVec<[GuardLayer; 3]> = SmallVec::new();
        if options.full_speed_debug && selection.kind != GuardKind::Breakpoint {
            layers.push(GuardLayer::new(GuardKind::Breakpoint, GuardTestType::Fsd));
        }
        let has_primary = !selection.is_no_guard();
        if has_primary {
            let mut primary = GuardLayer::new(selection.kind, selection.test);
            primary.class = selection.class;
            layers.push(primary);
        }
        if options.hcr && selection.kind != GuardKind::Hcr {
            match layers.last_mut() {
                Some(primary) if has_primary && options.merge_hcr_guards => primary.merged_with_hcr = true,
                _ => layers.push(GuardLayer::new(GuardKind::Hcr, GuardTestType::None)),
            }
        }
        Self {
            layers,
            primary: has_primary.then_some(*selection),
        }
    }

    /// Check whether no guard is emitted at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Frequency and coldness of the slow path given the fast path's.
    ///
    /// Slow paths of likely profiled guards stay warm at a tenth of the fast
    /// path; everything else is versioned cold code.
    pub fn slow_path_frequency(&self, fast: i32) -> (i32, bool) {
        match self.primary {
            Some(p) if p.kind == GuardKind::Profiled && p.high_probability => {
                ((MAX_COLD_BLOCK_COUNT + 1).max(fast / SLOW_PATH_SCALE), false)
            }
            _ => (VERSIONED_COLD_BLOCK_COUNT, true),
        }
    }

    /// Check whether the primary guard kind may bail out through OSR.
    pub fn allows_osr(&self) -> bool {
        !matches!(
            self.primary.map(|p| p.kind),
            Some(GuardKind::Profiled | GuardKind::Hierarchy)
        )
    }
}

// =============================================================================
// Rematerialization
// =============================================================================

/// Decide, per mapped parameter, whether the slow path recomputes the
/// argument instead of loading its temporary.
///
/// `stores` is the position of the first privatizing store in `block` and
/// `guard_at` the position the guards will split at. The original call must
/// still hold its arguments.
pub fn rematerializable_args(
    body: &MethodBody,
    block: BlockId,
    stores: usize,
    guard_at: usize,
    map: &ParameterMap,
) -> SmallVec<[bool; 4]> {
    let trees = body.trees(block);
    let mut store_index = stores;
    map.params()
        .iter()
        .map(|p| {
            let ParameterMapping::Privatized(_) = p.mapping else {
                return false;
            };
            let position = store_index;
            store_index += 1;
            let Some(reads) = expression_reads(body, p.argument) else {
                return false;
            };
            let end = guard_at.min(trees.len());
            let start = (position + 1).min(end);
            trees[start..end]
                .iter()
                .all(|&tree| !clobbers(body, tree, &reads))
        })
        .collect()
}

/// Symbols and memory an expression reads.
#[derive(Debug, Default)]
struct Reads {
    symbols: FxHashSet<SymbolId>,
    memory: bool,
}

/// Collect what `root` reads, or `None` if it cannot be recomputed.
fn expression_reads(body: &MethodBody, root: NodeId) -> Option<Reads> {
    let mut reads = Reads::default();
    let mut work = vec![(root, true)];
    while let Some((id, is_root)) = work.pop() {
        let node = body.node(id);
        // shared subexpressions may hold values from before a later store
        let shared_limit = if is_root { 2 } else { 1 };
        if !node.op.is_load_const() && node.ref_count > shared_limit {
            return None;
        }
        match node.op {
            Opcode::Const(_) | Opcode::Null => {}
            Opcode::Load(symbol) => {
                reads.symbols.insert(symbol);
            }
            Opcode::LoadStatic(_) | Opcode::LoadField(_) => reads.memory = true,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Neg | Opcode::CmpLt | Opcode::CmpEq => {}
            _ => return None,
        }
        work.extend(node.children.iter().map(|&c| (c, false)));
    }
    Some(reads)
}

fn clobbers(body: &MethodBody, tree: NodeId, reads: &Reads) -> bool {
    match body.node(tree).op {
        Opcode::Store(symbol) if reads.symbols.contains(&symbol) => return true,
        Opcode::StoreField(_) | Opcode::StoreStatic(_) if reads.memory => return true,
        _ => {}
    }
    if !reads.memory {
        return false;
    }
    let mut work = vec![tree];
    while let Some(id) = work.pop() {
        let node = body.node(id);
        if node.op.as_call().is_some() {
            return true;
        }
        work.extend(node.children.iter().copied());
    }
    false
}

// =============================================================================
// Insertion
// =============================================================================

/// Destination of a call's value after inlining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    /// The value is never read.
    Unused,
    /// The value is stored to a temporary the continuation loads.
    Temp(SymbolId),
    /// The call fed a `store` or `return` that now ends every exit path,
    /// so no temporary is needed.
    Anchor(Opcode),
}

impl CallResult {
    /// Temporary holding the value, if any.
    #[inline]
    pub fn temp(self) -> Option<SymbolId> {
        match self {
            CallResult::Temp(temp) => Some(temp),
            _ => None,
        }
    }

    /// Check whether paths ending here return from the method.
    #[inline]
    pub fn returns(self) -> bool {
        self == CallResult::Anchor(Opcode::Return)
    }
}

/// Everything the guard and slow path need to know about the call.
#[derive(Debug, Clone, Copy)]
pub struct GuardRequest<'a> {
    /// Block the guards follow; it keeps the privatizing stores.
    pub pre: BlockId,
    /// Inlined-site index of the callee.
    pub site: i32,
    /// The original call's descriptor and byte-code identity.
    pub call: CallDescriptor,
    pub bc: ByteCodeInfo,
    pub callee: MethodId,
    pub map: &'a ParameterMap,
    /// Per-parameter rematerialization decisions.
    pub remat: &'a [bool],
    /// Where the call's value goes.
    pub result: CallResult,
    pub continuation: BlockId,
    /// Frequency of the call's block.
    pub frequency: i32,
    pub handler: Option<BlockId>,
    /// Bail out through OSR before the slow call.
    pub osr: bool,
}

/// Blocks and nodes created for a guarded inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedRegion {
    /// Guard blocks in layout order.
    pub guard_blocks: SmallVec<[BlockId; 3]>,
    /// Kinds of the emitted guards, in the same order.
    pub kinds: SmallVec<[GuardKind; 3]>,
    pub slow_path: BlockId,
    /// The re-executed original call.
    pub slow_call: NodeId,
    pub osr_attached: bool,
    /// Arguments recomputed on the slow path.
    pub rematerialized: u32,
}

/// Emit the guard blocks right after `req.pre` and the slow path at the end
/// of the layout. Returns `None` when the plan has no guard.
pub fn insert_guard(body: &mut MethodBody, plan: &GuardPlan, req: &GuardRequest<'_>) -> Option<GuardedRegion> {
    if plan.is_empty() {
        return None;
    }

    let (frequency, is_cold) = plan.slow_path_frequency(req.frequency);
    let slow = body.create_block(frequency);
    {
        let b = body.block_mut(slow);
        b.is_cold = is_cold;
        b.handler = req.handler;
    }

    if req.osr {
        let target = find_or_create_site_block(body, req.site, req.callee);
        body.append_new_tree(
            slow,
            Opcode::InduceOsr {
                site: req.site,
                target,
            },
            &[],
            req.bc,
        );
    }

    let mut rematerialized = 0;
    let mut args: SmallVec<[NodeId; 4]> = SmallVec::new();
    for (index, p) in req.map.params().iter().enumerate() {
        let arg = match p.mapping {
            ParameterMapping::Privatized(_) if req.remat.get(index).copied().unwrap_or(false) => {
                rematerialized += 1;
                body.deep_copy(p.argument)
            }
            ParameterMapping::Privatized(symbol) | ParameterMapping::Direct(symbol) => {
                body.create_node(Opcode::Load(symbol), &[], req.bc)
            }
            ParameterMapping::Constant(op) => body.create_node(op, &[], req.bc),
        };
        args.push(arg);
    }
    let slow_call = body.create_node(Opcode::Call(req.call), &args, req.bc);
    let anchor = match req.result {
        CallResult::Unused => Opcode::TreeTop,
        CallResult::Temp(result) => Opcode::Store(result),
        CallResult::Anchor(op) => op,
    };
    body.append_new_tree(slow, anchor, &[slow_call], req.bc);
    if !req.result.returns() {
        body.append_new_tree(slow, Opcode::Goto(req.continuation), &[], req.bc);
    }
    body.push_layout(slow);

    let mut guard_blocks: SmallVec<[BlockId; 3]> = SmallVec::new();
    let mut kinds: SmallVec<[GuardKind; 3]> = SmallVec::new();
    for layer in &plan.layers {
        let block = body.create_block(req.frequency);
        body.block_mut(block).handler = req.handler;
        let receiver: SmallVec<[NodeId; 1]> = match req.map.receiver_symbol() {
            Some(symbol) if layer.test.reads_receiver() => {
                SmallVec::from_elem(body.create_node(Opcode::Load(symbol), &[], req.bc), 1)
            }
            _ => SmallVec::new(),
        };
        let guard = GuardNode {
            kind: layer.kind,
            test: layer.test,
            declared: req.call.method,
            inlined: req.callee,
            class: layer.class,
            slow_path: slow,
            site: req.site,
            merged_with_hcr: layer.merged_with_hcr,
        };
        body.append_new_tree(block, Opcode::VirtualGuard(guard), &receiver, req.bc);
        tracing::trace!(kind = %layer.kind, site = req.site, block = %block, "emitted guard");
        guard_blocks.push(block);
        kinds.push(layer.kind);
    }
    body.insert_blocks_after(req.pre, &guard_blocks);

    Some(GuardedRegion {
        guard_blocks,
        kinds,
        slow_path: slow,
        slow_call,
        osr_attached: req.osr,
        rematerialized,
    })
}

// =============================================================================
// Tests
// =============================================================================
