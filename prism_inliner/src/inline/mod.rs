//! Method Inlining
//!
//! This module drives inlining over the tree IR of one compiled method.
//! Inlining replaces a call with the body of its target, protected by
//! virtual guards where the target is only speculated.
//!
//! # Architecture
//!
//! - **Hotness** (`hotness.rs`): compilation levels that scale thresholds
//! - **Heuristics** (`heuristics.rs`): weight limits and size checks
//! - **Call Sites** (`call_site.rs`): calls, candidate targets and guards
//! - **Call Stack** (`call_stack.rs`): nesting levels and their symbol pools
//! - **Discovery** (`discovery.rs`): devirtualization and the policy chain
//! - **Mapper** (`mapper.rs`): binding callee formals to caller values
//! - **Guards** (`guard.rs`): guard layering, slow paths, OSR bailouts
//! - **Transform** (`transform.rs`): splicing the callee into the caller
//! - **Fixup** (`fixup.rs`): repair of commoning across new EBB boundaries
//!
//! # Inlining Process
//!
//! 1. **Scan**: find the next unvisited call of the current level
//! 2. **Discovery**: resolve the targets the call may dispatch to
//! 3. **Policy**: drop targets that fail a check, recording why
//! 4. **Transformation**: generate the callee's IL and splice it
//! 5. **Recursion**: push a level for the callee and scan its calls
//!
//! Inlining is bounded by [`MAX_INLINE_COUNT`], the call-site threshold,
//! per-level budgets that shrink with every nested callee, the recursion
//! limit, the caller weight limit and the node-count threshold.

pub mod call_site;
pub mod call_stack;
pub mod discovery;
pub mod fixup;
pub mod guard;
pub mod heuristics;
pub mod hotness;
pub mod mapper;
pub mod transform;

pub use call_site::{CallSite, CallTarget, DecisionTag, VirtualGuardSelection};
pub use call_stack::{CallStack, CallStackLevel, ControlFlowInfo};
pub use fixup::{fixup_injected_block, FixupStats, TempSource};
pub use guard::{CallResult, GuardPlan, GuardedRegion};
pub use heuristics::{compute_thresholds, exceeds_threshold, InlineThresholds, ThresholdQuery};
pub use hotness::Hotness;
pub use mapper::{ParameterMap, ParameterMapping};
pub use transform::{splice_callee, SpliceOutcome};

use crate::config::InlinerOptions;
use crate::diagnostics::{DiagnosticsSink, InlineEvent, NullSink};
use crate::error::{FailureReason, InlineError};
use crate::ir::{verify, BitSet, ByteCodeInfo, Cfg, GuardKind, MethodBody, NodeId, Opcode, TreePos, MAX_BLOCK_COUNT};
use crate::method::{ClassId, MethodId, ResolvedMethod};
use crate::osr::{link_osr_code_blocks, TOP_LEVEL_SITE};
use crate::services::{ClassHierarchy, IlProvider, ProfileInfo, Program};
use discovery::{apply_policy_to_targets, discover_targets, PolicyContext};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Absolute cap on inlines per compilation.
pub const MAX_INLINE_COUNT: u32 = 1000;

// =============================================================================
// Services
// =============================================================================

/// The collaborators one compilation consults.
#[derive(Clone, Copy)]
pub struct InlinerServices<'a> {
    pub il: &'a dyn IlProvider,
    pub hierarchy: &'a dyn ClassHierarchy,
    pub profile: &'a dyn ProfileInfo,
}

impl<'a> InlinerServices<'a> {
    pub fn new(il: &'a dyn IlProvider, hierarchy: &'a dyn ClassHierarchy, profile: &'a dyn ProfileInfo) -> Self {
        Self { il, hierarchy, profile }
    }

    /// Use an in-memory program for all three services.
    pub fn from_program(program: &'a Program) -> Self {
        Self::new(program, program, program)
    }
}

impl fmt::Debug for InlinerServices<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlinerServices").finish_non_exhaustive()
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Shared flag that stops an inlining pass between call sites.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Inlining Statistics
// =============================================================================

/// Statistics from the inlining pass.
#[derive(Debug, Clone, Default)]
pub struct InlineStats {
    /// Number of call sites examined.
    pub sites_examined: usize,
    /// Number of call sites inlined.
    pub sites_inlined: usize,
    /// Number of inlines protected by a profiled guard.
    pub speculative_inlines: usize,
    /// Nodes added by inlining.
    pub nodes_added: usize,
    /// Live nodes before inlining.
    pub initial_size: usize,
    /// Live nodes after inlining.
    pub final_size: usize,
    /// Sites rejected by a size or budget check.
    pub rejected_size: usize,
    /// Levels not scanned because their budget ran out.
    pub rejected_depth: usize,
    /// Sites rejected as recursive.
    pub rejected_recursive: usize,
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of one inlining pass: the call graph and its counters.
#[derive(Debug, Clone)]
pub struct InlineReport {
    /// Call sites of the compiled method, each holding its inlined callees'
    /// sites in turn.
    pub sites: Vec<CallSite>,
    pub stats: InlineStats,
    pub thresholds: InlineThresholds,
    pub hotness: Hotness,
}

impl InlineReport {
    /// Every site of the call graph, depth first.
    pub fn all_sites(&self) -> Vec<&CallSite> {
        fn collect<'s>(sites: &'s [CallSite], out: &mut Vec<&'s CallSite>) {
            for site in sites {
                out.push(site);
                for target in &site.targets {
                    collect(&target.children, out);
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.sites, &mut out);
        out
    }
}

impl fmt::Display for InlineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "inlining report ({}): {} of {} sites inlined, {} -> {} nodes",
            self.hotness,
            self.stats.sites_inlined,
            self.stats.sites_examined,
            self.stats.initial_size,
            self.stats.final_size
        )?;
        fmt_sites(f, &self.sites, 1)
    }
}

fn fmt_sites(f: &mut fmt::Formatter<'_>, sites: &[CallSite], indent: usize) -> fmt::Result {
    for site in sites {
        write!(f, "{:width$}call {} @{}", "", site.declared, site.bc, width = indent * 2)?;
        match site.inlined_target() {
            Some(target) => {
                writeln!(f, " -> {} [{}] inlined", target.callee.id, target.guard.kind)?;
                fmt_sites(f, &target.children, indent + 1)?;
            }
            None => match site.failure {
                Some(reason) => writeln!(f, " not inlined: {}", reason)?,
                None => writeln!(f, " not inlined")?,
            },
        }
        for dropped in &site.dropped {
            if let Some(reason) = dropped.failure {
                writeln!(
                    f,
                    "{:width$}dropped {}: {}",
                    "",
                    dropped.callee.id,
                    reason,
                    width = (indent + 1) * 2
                )?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Inliner
// =============================================================================

/// Mutable state of one pass.
struct Pass {
    thresholds: InlineThresholds,
    stats: InlineStats,
    /// Calls already considered, by node index.
    visited: BitSet,
    inline_count: u32,
    /// Callee byte-code inlined so far.
    inlined_size: u32,
}

/// The inlining pass over one compiled method.
pub struct Inliner<'a> {
    services: InlinerServices<'a>,
    options: InlinerOptions,
    hotness: Hotness,
    sink: Arc<dyn DiagnosticsSink>,
    cancellation: Option<CancellationToken>,
}

impl<'a> Inliner<'a> {
    /// Create an inliner at [`Hotness::Warm`] that reports to no one.
    pub fn new(services: InlinerServices<'a>, options: InlinerOptions) -> Self {
        Self {
            services,
            options,
            hotness: Hotness::default(),
            sink: Arc::new(NullSink),
            cancellation: None,
        }
    }

    pub fn with_hotness(mut self, hotness: Hotness) -> Self {
        self.hotness = hotness;
        self
    }

    /// Report events to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Options of this pass.
    #[inline]
    pub fn options(&self) -> &InlinerOptions {
        &self.options
    }

    /// Inline calls of `body`, recursively.
    ///
    /// Individual call sites fail locally and are listed in the report. An
    /// error means the input was malformed or the pass was cancelled; after
    /// a cancellation `body` may hold completed inlines and must be dropped.
    pub fn perform_inlining(&self, body: &mut MethodBody) -> Result<InlineReport, InlineError> {
        self.run_pass(body, |inliner, body, stack, pass| inliner.inline_level(body, stack, pass))
    }

    /// Inline only the call anchored by the tree at `pos`, together with
    /// the calls nested in its callee.
    ///
    /// The call must belong to the compiled method itself, not to code an
    /// earlier pass inlined. Thresholds and budgets are those of a full pass.
    pub fn inline_call(&self, body: &mut MethodBody, pos: TreePos) -> Result<InlineReport, InlineError> {
        let call = body
            .layout_position(pos.block)
            .and_then(|_| body.trees(pos.block).get(pos.index).copied())
            .and_then(|tree| anchored_call(body, tree))
            .filter(|&call| body.node(call).bc.caller_index == TOP_LEVEL_SITE)
            .ok_or(InlineError::NoCallAt {
                block: pos.block,
                index: pos.index,
            })?;
        self.run_pass(body, |inliner, body, stack, pass| {
            pass.visited.insert(call.as_usize());
            let Some(mut site) = CallSite::from_call(body, pos, call, 0) else {
                return Ok(Vec::new());
            };
            site.narrow_receiver(body, stack);
            pass.stats.sites_examined += 1;
            inliner.inline_site(body, stack, pass, &mut site)?;
            Ok(vec![site])
        })
    }

    /// Set up a pass over `body`, let `inline` walk it, then commit the
    /// compiled method's symbols and link OSR blocks.
    fn run_pass<F>(&self, body: &mut MethodBody, inline: F) -> Result<InlineReport, InlineError>
    where
        F: FnOnce(&Self, &mut MethodBody, &mut CallStack, &mut Pass) -> Result<Vec<CallSite>, InlineError>,
    {
        verify(body)?;

        let root = self
            .services
            .hierarchy
            .resolve_method(body.method)
            .unwrap_or_else(|| {
                let size = body.node_count() as u32;
                ResolvedMethod::new(body.method, ClassId(0), body.method.to_string(), size)
            });
        let initial_size = body.node_count();
        let thresholds = compute_thresholds(&self.options, self.hotness, root.bytecode_size, initial_size as u32);
        let budget = self.initial_budget(root.bytecode_size);
        tracing::debug!(
            method = %root.signature,
            hotness = %self.hotness,
            weight_limit = thresholds.callee_weight_limit,
            budget,
            "inlining started"
        );

        let mut pass = Pass {
            thresholds,
            stats: InlineStats {
                initial_size,
                ..Default::default()
            },
            visited: BitSet::with_capacity(body.node_slots()),
            inline_count: 0,
            inlined_size: 0,
        };
        let info = ControlFlowInfo::compute(body);
        let mut stack = CallStack::new(CallStackLevel::new(root, TOP_LEVEL_SITE, budget, info));

        let sites = inline(self, body, &mut stack, &mut pass)?;
        stack.commit(&mut body.symbols);
        let linked = link_osr_code_blocks(body);
        debug_assert_eq!(verify(body), Ok(()), "inlining produced malformed IR");

        pass.stats.final_size = body.node_count();
        pass.stats.nodes_added = pass.stats.final_size.saturating_sub(initial_size);
        tracing::debug!(
            inlined = pass.stats.sites_inlined,
            examined = pass.stats.sites_examined,
            nodes = pass.stats.final_size,
            osr_blocks_linked = linked,
            "inlining finished"
        );
        Ok(InlineReport {
            sites,
            stats: pass.stats,
            thresholds,
            hotness: self.hotness,
        })
    }

    /// Budget of the compiled method's level, shrinking linearly with its
    /// size down to zero at the cutoff.
    fn initial_budget(&self, size: u32) -> i32 {
        let initial = self.options.initial_budget as i64;
        let cutoff = self.options.budget_size_cutoff.max(1) as i64;
        (initial - size as i64 * initial / cutoff) as i32
    }

    fn check_cancelled(&self) -> Result<(), InlineError> {
        match &self.cancellation {
            Some(token) if token.is_cancelled() => Err(InlineError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Inline the calls of the current level, in layout order.
    fn inline_level(
        &self,
        body: &mut MethodBody,
        stack: &mut CallStack,
        pass: &mut Pass,
    ) -> Result<Vec<CallSite>, InlineError> {
        let level_site = stack.current().site_index;
        let depth = stack.depth();
        let mut sites = Vec::new();
        while let Some((pos, call)) = next_call(body, level_site, &mut pass.visited) {
            self.check_cancelled()?;
            let Some(mut site) = CallSite::from_call(body, pos, call, depth) else {
                continue;
            };
            site.narrow_receiver(body, stack);
            pass.stats.sites_examined += 1;
            self.inline_site(body, stack, pass, &mut site)?;
            sites.push(site);
        }
        Ok(sites)
    }

    fn inline_site(
        &self,
        body: &mut MethodBody,
        stack: &mut CallStack,
        pass: &mut Pass,
        site: &mut CallSite,
    ) -> Result<(), InlineError> {
        if pass.inline_count >= MAX_INLINE_COUNT || pass.stats.sites_inlined >= pass.thresholds.max_call_sites as usize {
            return Ok(self.fail_site(site, FailureReason::MaxInlineCountReached, pass));
        }
        let always_worth = self
            .services
            .hierarchy
            .resolve_method(site.declared)
            .is_some_and(|m| m.always_worth_inlining());
        if !always_worth && self.is_cold_call(body, site.pos) {
            return Ok(self.fail_site(site, FailureReason::ColdBlock, pass));
        }

        if site.frequency < 0 {
            let bc = ByteCodeInfo::top_level(site.bc.bc_index);
            if let Some(count) = self.services.profile.call_count(stack.current().method.id, bc) {
                site.frequency = count.min(MAX_BLOCK_COUNT as u32) as i32;
            }
        }
        stack.update_state(site.pos.block);
        site.in_loop = stack.current().in_a_loop;
        site.always_called = stack.current().always_called;
        if self.options.trace_level >= 1 {
            tracing::debug!(
                site = %site.bc,
                declared = %site.declared,
                frequency = site.frequency,
                in_loop = site.in_loop,
                depth = site.depth,
                "examining call"
            );
        }

        discover_targets(site, stack, &self.services, &self.options);
        if !site.is_dead() {
            let ctx = PolicyContext {
                options: &self.options,
                thresholds: &pass.thresholds,
                inlined_size: pass.inlined_size,
            };
            apply_policy_to_targets(site, body, stack, &ctx);
        }
        let Some(target) = site.targets.first() else {
            let reason = site.failure.unwrap_or(FailureReason::NoInlineableTargets);
            return Ok(self.fail_site(site, reason, pass));
        };

        let callee_body = match self.services.il.generate_il(&target.callee) {
            Ok(callee_body) => callee_body,
            Err(err) => {
                tracing::debug!(site = %site.bc, error = %err, "il generation failed");
                return Ok(self.fail_target(site, FailureReason::IlGenFailure, pass));
            }
        };
        let nodes_before = body.node_count();
        let outcome = match splice_callee(
            body,
            site,
            target,
            &callee_body,
            stack,
            &self.options,
            &pass.thresholds,
        ) {
            Ok(outcome) => outcome,
            Err(reason) => return Ok(self.fail_target(site, reason, pass)),
        };

        let target = &mut site.targets[0];
        target.estimate_partial_size(&callee_body);
        target.already_inlined = true;
        let callee = target.callee.clone();
        let guard_kind = target.guard.kind;
        self.record_success(site.bc, &callee, guard_kind, stack.depth(), &outcome, pass);
        pass.stats.nodes_added += body.node_count().saturating_sub(nodes_before);
        if let Some(region) = &outcome.guard {
            pass.visited.insert(region.slow_call.as_usize());
        }

        // Nested level
        let divisor = self.options.budget_divisor.max(1);
        let budget = stack.current().max_call_size - callee.bytecode_size as i32 / divisor;
        let info = ControlFlowInfo::compute(&callee_body).remap(&outcome.block_map);
        let level = CallStackLevel::new(callee, outcome.site_index, budget, info)
            .with_known_classes(outcome.known_classes.iter().copied());
        stack.push(level);
        let children = if budget > 0 {
            self.inline_level(body, stack, pass)
        } else {
            tracing::debug!(site = outcome.site_index, budget, "level budget exhausted");
            pass.stats.rejected_depth += 1;
            Ok(Vec::new())
        };
        stack.pop(&mut body.symbols);
        site.targets[0].children = children?;
        Ok(())
    }

    /// Check whether the call's block is too cold to inline into.
    fn is_cold_call(&self, body: &MethodBody, pos: TreePos) -> bool {
        let block = body.block(pos.block);
        if block.is_cold_by_frequency() {
            return true;
        }
        if self.hotness == Hotness::Cold
            && block.frequency >= 0
            && block.frequency < self.options.very_cold_border_frequency
        {
            return true;
        }
        Cfg::build(body).has_exception_predecessors(pos.block)
    }

    fn record_success(
        &self,
        bc: ByteCodeInfo,
        callee: &ResolvedMethod,
        guard: GuardKind,
        depth: u32,
        outcome: &SpliceOutcome,
        pass: &mut Pass,
    ) {
        pass.inline_count += 1;
        pass.inlined_size = pass.inlined_size.saturating_add(callee.bytecode_size);
        pass.stats.sites_inlined += 1;
        if guard == GuardKind::Profiled {
            pass.stats.speculative_inlines += 1;
        }

        self.sink.record(&InlineEvent::Inlined {
            site: bc,
            callee: callee.id,
            guard,
            depth,
        });
        if let Some(region) = &outcome.guard {
            for &kind in &region.kinds {
                self.sink.record(&InlineEvent::GuardInserted {
                    kind,
                    site: outcome.site_index,
                });
            }
            if region.osr_attached {
                self.sink.record(&InlineEvent::OsrTransitionAttached {
                    site: outcome.site_index,
                });
            }
        }
        if !outcome.fixup.is_empty() {
            self.sink.record(&InlineEvent::FixupApplied {
                temps: outcome.fixup.temps,
                constants: outcome.fixup.constants,
                loads: outcome.fixup.loads,
            });
        }
        tracing::debug!(
            site = %bc,
            callee = %callee.signature,
            guard = %guard,
            depth,
            in_place = outcome.merged_in_place,
            "inlined"
        );
    }

    /// Abandon the whole site.
    fn fail_site(&self, site: &mut CallSite, reason: FailureReason, pass: &mut Pass) {
        site.fail(reason);
        self.record_failure(site, None, reason, pass);
    }

    /// Drop the site's first target after policy approved it.
    fn fail_target(&self, site: &mut CallSite, reason: FailureReason, pass: &mut Pass) {
        let callee = site.targets.first().map(|t| t.callee.id);
        site.drop_target(0, reason);
        self.record_failure(site, callee, reason, pass);
    }

    fn record_failure(
        &self,
        site: &CallSite,
        callee: Option<MethodId>,
        reason: FailureReason,
        pass: &mut Pass,
    ) {
        match reason {
            FailureReason::ExceedsByteCodeThreshold
            | FailureReason::ExceedsNodeCountThreshold
            | FailureReason::CalleeBudgetExhausted => pass.stats.rejected_size += 1,
            FailureReason::RecursiveCallee => pass.stats.rejected_recursive += 1,
            _ => {}
        }
        let callee = callee.or_else(|| site.dropped.last().map(|t| t.callee.id));
        self.sink.record(&InlineEvent::Failed {
            site: site.bc,
            callee,
            reason,
            depth: site.depth,
        });
        tracing::debug!(site = %site.bc, callee = ?callee, reason = %reason, "not inlined");
    }
}

/// Find the next unvisited call of inlined site `level_site` that anchors
/// its tree. Calls of the level seen first anywhere else are marked visited
/// and never inlined.
fn next_call(body: &MethodBody, level_site: i32, visited: &mut BitSet) -> Option<(TreePos, NodeId)> {
    for &block in body.layout() {
        for (index, &tree) in body.trees(block).iter().enumerate() {
            let anchored = anchored_call(body, tree);
            let mut found = None;
            let mut seen = BitSet::new();
            body.walk_tree(tree, &mut seen, &mut |id, node| {
                if found.is_some() || node.op.as_call().is_none() || node.bc.caller_index != level_site {
                    return;
                }
                if visited.insert(id.as_usize()) && anchored == Some(id) {
                    found = Some(id);
                }
            });
            if let Some(call) = found {
                return Some((TreePos { block, index }, call));
            }
        }
    }
    None
}

/// The call `tree` anchors as its first child, if any.
fn anchored_call(body: &MethodBody, tree: NodeId) -> Option<NodeId> {
    let root = body.node(tree);
    let child = match root.op {
        Opcode::TreeTop
        | Opcode::Store(_)
        | Opcode::StoreStatic(_)
        | Opcode::StoreField(_)
        | Opcode::Return
        | Opcode::IfNonZero(_)
        | Opcode::Throw => root.first_child()?,
        _ => return None,
    };
    body.node(child).op.as_call().map(|_| child)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CounterSink;
    use crate::ir::{CallKind, MethodBuilder};

    const MAIN: MethodId = MethodId(0);
    const GET: MethodId = MethodId(1);
    const BIG: MethodId = MethodId(2);

    fn getter() -> MethodBody {
        let mut b = MethodBuilder::new(GET);
        let this = b.parm("this");
        b.block();
        let lt = b.load(this);
        let field = b.load_field(lt, 0);
        b.ret(Some(field));
        b.finish()
    }

    fn program() -> Program {
        let program = Program::new();
        program.add_class(ClassId(1), None);
        program.add_method(ResolvedMethod::new(MAIN, ClassId(1), "Main.run", 20).as_static(), None);
        program.add_method(ResolvedMethod::new(GET, ClassId(1), "Box.get", 5).as_final(), Some(getter()));
        program.add_method(
            ResolvedMethod::new(BIG, ClassId(1), "Box.big", 5000).as_static(),
            Some(getter()),
        );
        program
    }

    /// `return get(new Box) + big(new Box)`
    fn main_body() -> MethodBody {
        let mut b = MethodBuilder::new(MAIN);
        b.block();
        let o = b.new_object(ClassId(1));
        let got = b.call(GET, CallKind::Virtual, &[o]);
        b.anchor(got);
        let p = b.new_object(ClassId(1));
        let big = b.call(BIG, CallKind::Direct, &[p]);
        b.anchor(big);
        let sum = b.add(got, big);
        b.ret(Some(sum));
        b.finish()
    }

    #[test]
    fn test_report_lists_inlined_and_rejected_sites() {
        let program = program();
        let sink = Arc::new(CounterSink::new());
        let inliner = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default())
            .with_sink(sink.clone());
        let mut body = main_body();
        let report = inliner.perform_inlining(&mut body).unwrap();

        assert_eq!(report.stats.sites_examined, 2);
        assert_eq!(report.stats.sites_inlined, 1);
        assert_eq!(report.stats.rejected_size, 1);
        assert_eq!(sink.inlined(), 1);
        assert_eq!(sink.failures(FailureReason::ExceedsByteCodeThreshold), 1);
        assert_eq!(report.all_sites().len(), 2);

        let dump = report.to_string();
        assert!(dump.contains("-> m1 [NoGuard] inlined"), "{}", dump);
        assert!(dump.contains("not inlined: exceeds_bytecode_threshold"), "{}", dump);
    }

    #[test]
    fn test_cancelled_pass_returns_error() {
        let program = program();
        let token = CancellationToken::new();
        token.cancel();
        let inliner = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default())
            .with_cancellation(token);
        let mut body = main_body();
        assert!(matches!(inliner.perform_inlining(&mut body), Err(InlineError::Cancelled)));
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        let program = program();
        let inliner = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default());
        let mut body = main_body();
        let entry = body.entry().unwrap();
        let stray = body.create_node(Opcode::Return, &[], ByteCodeInfo::top_level(99));
        body.insert_tree(entry, 0, stray);
        assert!(matches!(inliner.perform_inlining(&mut body), Err(InlineError::MalformedIr(_))));
    }

    #[test]
    fn test_initial_budget_shrinks_with_caller_size() {
        let program = program();
        let inliner = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default());
        assert_eq!(inliner.initial_budget(0), 400);
        assert_eq!(inliner.initial_budget(2000), 200);
        assert!(inliner.initial_budget(4000) <= 0);
    }

    #[test]
    fn test_inline_call_touches_only_the_named_site() {
        let program = program();
        let inliner = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default());
        let mut body = main_body();
        let entry = body.entry().unwrap();

        let report = inliner.inline_call(&mut body, TreePos { block: entry, index: 0 }).unwrap();
        assert_eq!(report.stats.sites_examined, 1);
        assert_eq!(report.stats.sites_inlined, 1);
        assert_eq!(report.sites.len(), 1);
        assert_eq!(verify(&body), Ok(()));

        let calls: Vec<MethodId> = body
            .layout()
            .iter()
            .flat_map(|&b| body.trees(b).iter().copied())
            .filter_map(|t| anchored_call(&body, t))
            .filter_map(|c| body.node(c).op.as_call().map(|d| d.method))
            .collect();
        assert_eq!(calls, [BIG]);
    }

    #[test]
    fn test_inline_call_requires_an_anchored_call() {
        let program = program();
        let inliner = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default());
        let mut body = main_body();
        let entry = body.entry().unwrap();
        let at_return = TreePos { block: entry, index: 2 };
        assert!(matches!(
            inliner.inline_call(&mut body, at_return),
            Err(InlineError::NoCallAt { index: 2, .. })
        ));
        let past_end = TreePos { block: entry, index: 9 };
        assert!(matches!(
            inliner.inline_call(&mut body, past_end),
            Err(InlineError::NoCallAt { .. })
        ));
    }

    #[test]
    fn test_cold_block_is_skipped() {
        let program = program();
        let mut b = MethodBuilder::new(MAIN);
        let block = b.block();
        b.set_cold(block);
        let o = b.new_object(ClassId(1));
        let got = b.call(GET, CallKind::Virtual, &[o]);
        b.ret(Some(got));
        let mut body = b.finish();

        let inliner = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default());
        let report = inliner.perform_inlining(&mut body).unwrap();
        assert_eq!(report.sites[0].failure, Some(FailureReason::ColdBlock));
        assert_eq!(report.stats.sites_inlined, 0);
    }
}
