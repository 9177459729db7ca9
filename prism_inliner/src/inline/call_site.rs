//! Call sites, call targets and guard selections.
//!
//! A [`CallSite`] is created the first time the driver visits a call. Target
//! discovery fills its target list, the policy chain narrows it, and the
//! surviving target is spliced. Dropped targets stay on the site with their
//! [`FailureReason`] so the call graph can be dumped afterwards.
//!
//! ```text
//! CallSite (call m7, virtual)
//!   ├── CallTarget m9  [MethodTestGuard]  inlined
//!   │     └── CallSite (call m11, direct) ...
//!   └── dropped: m12  exceeds_bytecode_threshold
//! ```

use super::call_stack::CallStack;
use crate::error::FailureReason;
use crate::ir::{
    ByteCodeInfo, CallKind, GuardKind, GuardTestType, MethodBody, NodeId, Opcode, TreePos,
};
use crate::method::{ClassId, MethodId, ResolvedMethod};

// =============================================================================
// Guard Selection
// =============================================================================

/// The guard chosen to protect one call target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualGuardSelection {
    pub kind: GuardKind,
    pub test: GuardTestType,
    /// Class compared against by VFT tests.
    pub class: Option<ClassId>,
    /// Receiver profile probability (percent) the selection was based on.
    pub profiled_probability: Option<u32>,
    /// The guard is expected to pass almost always.
    pub high_probability: bool,
}

impl VirtualGuardSelection {
    /// Target proven correct; no guard is emitted.
    pub const fn no_guard() -> Self {
        Self {
            kind: GuardKind::NoGuard,
            test: GuardTestType::None,
            class: None,
            profiled_probability: None,
            high_probability: true,
        }
    }

    /// Create a selection of `kind` evaluating `test`.
    pub fn new(kind: GuardKind, test: GuardTestType) -> Self {
        debug_assert!(kind != GuardKind::Inner, "inner guards are never selected for a call target");
        Self {
            kind,
            test,
            class: None,
            profiled_probability: None,
            high_probability: false,
        }
    }

    /// Attach the class a VFT test compares against.
    pub fn with_class(mut self, class: ClassId) -> Self {
        self.class = Some(class);
        self
    }

    #[inline]
    pub fn is_no_guard(&self) -> bool {
        self.kind == GuardKind::NoGuard
    }

    /// Check whether the guard inspects the receiver at runtime.
    #[inline]
    pub fn needs_receiver(&self) -> bool {
        self.test.reads_receiver()
    }
}

// =============================================================================
// Call Target
// =============================================================================

/// How policy treated a target before the size checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecisionTag {
    #[default]
    Default,
    /// Matched a try-to-inline pattern; size checks are skipped.
    TryToInline,
    /// Must-inline or always-worth-inlining; size checks are skipped.
    OverrideInline,
}

impl DecisionTag {
    /// Check whether the numeric size checks are bypassed.
    #[inline]
    pub fn bypasses_size_checks(self) -> bool {
        self != DecisionTag::Default
    }
}

/// One candidate implementation for a call site.
#[derive(Debug, Clone)]
pub struct CallTarget {
    pub callee: ResolvedMethod,
    pub guard: VirtualGuardSelection,
    /// Receiver class the target was resolved against, if any.
    pub receiver_class: Option<ClassId>,
    /// Byte-code size estimate of the whole callee.
    pub full_size: u32,
    /// Estimate of the callee without its cold blocks, known once IL exists.
    pub partial_size: u32,
    pub already_inlined: bool,
    pub tag: DecisionTag,
    pub failure: Option<FailureReason>,
    /// Call sites found in the inlined body.
    pub children: Vec<CallSite>,
}

impl CallTarget {
    /// Create a target for `callee` protected by `guard`.
    pub fn new(callee: ResolvedMethod, guard: VirtualGuardSelection) -> Self {
        let size = callee.bytecode_size;
        Self {
            callee,
            guard,
            receiver_class: None,
            full_size: size,
            partial_size: size,
            already_inlined: false,
            tag: DecisionTag::Default,
            failure: None,
            children: Vec::new(),
        }
    }

    /// Estimate the partial size from the callee's IL: the full size scaled
    /// by the share of nodes living in non-cold blocks.
    pub fn estimate_partial_size(&mut self, callee_body: &MethodBody) {
        let mut total = 0u64;
        let mut warm = 0u64;
        for &block in callee_body.layout() {
            let trees = callee_body.trees(block).len() as u64;
            total += trees;
            if !callee_body.block(block).is_cold_by_frequency() {
                warm += trees;
            }
        }
        if total > 0 {
            self.partial_size = ((self.full_size as u64 * warm) / total) as u32;
        }
    }
}

// =============================================================================
// Call Site
// =============================================================================

/// A call instruction under consideration.
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Position of the anchoring tree when the site was created.
    pub pos: TreePos,
    pub call: NodeId,
    /// Statically declared target.
    pub declared: MethodId,
    pub kind: CallKind,
    /// Receiver class proven from the receiver expression.
    pub receiver_hint: Option<ClassId>,
    pub bc: ByteCodeInfo,
    /// Block frequency, or the profiled call count when unknown.
    pub frequency: i32,
    /// Number of constant arguments, receiver excluded.
    pub const_args: u32,
    /// Inlining depth of the enclosing level (0 for the compiled method).
    pub depth: u32,
    pub in_loop: bool,
    pub always_called: bool,
    pub targets: Vec<CallTarget>,
    /// Targets removed by discovery, policy or the transform.
    pub dropped: Vec<CallTarget>,
    pub failure: Option<FailureReason>,
}

impl CallSite {
    /// Build a site for the call anchored at `pos`. Returns `None` if the
    /// node is not a call.
    pub fn from_call(body: &MethodBody, pos: TreePos, call: NodeId, depth: u32) -> Option<Self> {
        let node = body.node(call);
        let desc = node.op.as_call()?;

        let receiver_hint = match desc.kind {
            CallKind::Direct => None,
            CallKind::Virtual | CallKind::Interface => node
                .first_child()
                .and_then(|r| match body.node(r).op {
                    Opcode::New(class) => Some(class),
                    _ => None,
                }),
        };
        // The receiver of a dispatched call is never counted.
        let first_arg = usize::from(desc.kind.is_indirect());
        let const_args = node
            .children
            .iter()
            .skip(first_arg)
            .filter(|&&c| body.node(c).op.is_load_const())
            .count() as u32;

        Some(Self {
            pos,
            call,
            declared: desc.method,
            kind: desc.kind,
            receiver_hint,
            bc: node.bc,
            frequency: body.block(pos.block).frequency,
            const_args,
            depth,
            in_loop: false,
            always_called: false,
            targets: Vec::new(),
            dropped: Vec::new(),
            failure: None,
        })
    }

    /// Check whether the site has no candidate left.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.targets.is_empty()
    }

    /// Drop target `index` for `reason`. When the last target goes, the
    /// site takes the reason as its own.
    pub fn drop_target(&mut self, index: usize, reason: FailureReason) {
        let mut target = self.targets.remove(index);
        target.failure = Some(reason);
        self.dropped.push(target);
        if self.targets.is_empty() {
            self.failure = Some(reason);
        }
    }

    /// Abandon the site before any target was found.
    pub fn fail(&mut self, reason: FailureReason) {
        let targets = std::mem::take(&mut self.targets);
        for mut target in targets {
            target.failure = Some(reason);
            self.dropped.push(target);
        }
        self.failure = Some(reason);
    }

    /// Take the receiver's class from the call stack when the receiver is
    /// loaded from a symbol whose exact class an enclosing inline knows.
    pub fn narrow_receiver(&mut self, body: &MethodBody, stack: &CallStack) {
        if self.receiver_hint.is_some() || !self.kind.is_indirect() {
            return;
        }
        let receiver = body.node(self.call).first_child().map(|r| body.node(r).op);
        if let Some(Opcode::Load(symbol)) = receiver {
            self.receiver_hint = stack.known_class(symbol);
        }
    }

    /// The target that was spliced, if any.
    pub fn inlined_target(&self) -> Option<&CallTarget> {
        self.targets.iter().find(|t| t.already_inlined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MethodBuilder;

    #[test]
    fn test_from_call_reads_receiver_and_constants() {
        let mut b = MethodBuilder::new(MethodId(0));
        let block = b.block_with_frequency(300);
        let recv = b.new_object(ClassId(4));
        let seven = b.iconst(7);
        let call = b.call(MethodId(9), CallKind::Virtual, &[recv, seven]);
        b.anchor(call);
        let body = b.finish();

        let site = CallSite::from_call(&body, TreePos { block, index: 0 }, call, 0).unwrap();
        assert_eq!(site.receiver_hint, Some(ClassId(4)));
        assert_eq!(site.const_args, 1);
        assert_eq!(site.frequency, 300);
        assert!(site.is_dead());
    }

    #[test]
    fn test_receiver_class_from_enclosing_level() {
        use crate::inline::call_stack::{CallStackLevel, ControlFlowInfo};
        use crate::osr::TOP_LEVEL_SITE;

        let mut b = MethodBuilder::new(MethodId(0));
        let o = b.parm("o");
        let block = b.block();
        let lo = b.load(o);
        let call = b.call(MethodId(9), CallKind::Virtual, &[lo]);
        b.anchor(call);
        let body = b.finish();

        let root = ResolvedMethod::new(MethodId(0), ClassId(0), "A.run", 10);
        let mut stack = CallStack::new(CallStackLevel::new(root, TOP_LEVEL_SITE, 100, ControlFlowInfo::default()));
        let pos = TreePos { block, index: 0 };

        let mut site = CallSite::from_call(&body, pos, call, 0).unwrap();
        site.narrow_receiver(&body, &stack);
        assert_eq!(site.receiver_hint, None);

        let callee = ResolvedMethod::new(MethodId(1), ClassId(0), "A.f", 10);
        stack.push(CallStackLevel::new(callee, 0, 50, ControlFlowInfo::default()).with_known_classes([(o, ClassId(6))]));
        let mut site = CallSite::from_call(&body, pos, call, 1).unwrap();
        site.narrow_receiver(&body, &stack);
        assert_eq!(site.receiver_hint, Some(ClassId(6)));
    }

    #[test]
    fn test_dropping_last_target_fails_site() {
        let mut b = MethodBuilder::new(MethodId(0));
        let block = b.block();
        let call = b.call(MethodId(1), CallKind::Direct, &[]);
        b.anchor(call);
        let body = b.finish();

        let mut site = CallSite::from_call(&body, TreePos { block, index: 0 }, call, 0).unwrap();
        let callee = ResolvedMethod::new(MethodId(1), ClassId(0), "A.f", 10);
        site.targets.push(CallTarget::new(callee, VirtualGuardSelection::no_guard()));
        site.drop_target(0, FailureReason::RecursiveCallee);

        assert!(site.is_dead());
        assert_eq!(site.failure, Some(FailureReason::RecursiveCallee));
        assert_eq!(site.dropped[0].failure, Some(FailureReason::RecursiveCallee));
    }

    #[test]
    fn test_partial_size_ignores_cold_blocks() {
        let mut b = MethodBuilder::new(MethodId(1));
        b.block();
        let one = b.iconst(1);
        b.anchor(one);
        let cold = b.block();
        b.set_cold(cold);
        let two = b.iconst(2);
        b.ret(Some(two));
        let body = b.finish();

        let callee = ResolvedMethod::new(MethodId(1), ClassId(0), "A.f", 40);
        let mut target = CallTarget::new(callee, VirtualGuardSelection::no_guard());
        target.estimate_partial_size(&body);
        assert_eq!(target.partial_size, 20);
    }
}
