//! Call target discovery and the policy filter chain.
//!
//! # Devirtualization Strategies
//!
//! Indirect calls try, in order:
//!
//! 1. **Not overridden**: nothing overrides the declared method. Final and
//!    static methods are proven and need no guard; others get a patchable
//!    nonoverridden guard.
//! 2. **Hierarchy**: the receiver's class is proven and nothing below it
//!    overrides the resolved method.
//! 3. **Single implementer**: exactly one concrete implementation exists;
//!    a method test compares the dispatched method at runtime.
//! 4. **Receiver class**: a proven or profiled receiver class resolves the
//!    call; a VFT test compares the receiver's class at runtime.
//!
//! # Policy Chain
//!
//! Every target then runs through the filters in a fixed order. The first
//! filter that rejects it drops it with a [`FailureReason`].

use super::call_site::{CallSite, CallTarget, DecisionTag, VirtualGuardSelection};
use super::call_stack::CallStack;
use super::heuristics::{exceeds_threshold, InlineThresholds, ThresholdQuery};
use super::InlinerServices;
use crate::config::{matches_any, InlinerOptions};
use crate::error::FailureReason;
use crate::ir::{ByteCodeInfo, CallKind, GuardKind, GuardTestType, MethodBody};
use crate::method::ResolvedMethod;

// =============================================================================
// Discovery
// =============================================================================

/// Populate `site.targets`. A site left without targets carries its
/// failure reason.
pub fn discover_targets(
    site: &mut CallSite,
    stack: &CallStack,
    services: &InlinerServices<'_>,
    options: &InlinerOptions,
) {
    let Some(declared) = services.hierarchy.resolve_method(site.declared) else {
        site.fail(FailureReason::UnresolvedCallee);
        return;
    };

    let target = match site.kind {
        CallKind::Direct => Some(direct_target(declared, options)),
        CallKind::Virtual | CallKind::Interface => indirect_target(site, declared, stack, services, options),
    };

    match target {
        Some(target) => {
            tracing::trace!(
                site = %site.bc,
                callee = %target.callee.id,
                guard = %target.guard.kind,
                "found call target"
            );
            site.targets.push(target);
        }
        None => site.fail(FailureReason::NoInlineableTargets),
    }
}

fn direct_target(callee: ResolvedMethod, options: &InlinerOptions) -> CallTarget {
    let guard = if options.hcr {
        VirtualGuardSelection::new(GuardKind::Hcr, GuardTestType::None)
    } else if options.full_speed_debug {
        VirtualGuardSelection::new(GuardKind::Breakpoint, GuardTestType::Fsd)
    } else if options.aot {
        VirtualGuardSelection::new(GuardKind::DirectMethod, GuardTestType::None)
    } else {
        VirtualGuardSelection::no_guard()
    };
    CallTarget::new(callee, guard)
}

fn indirect_target(
    site: &CallSite,
    declared: ResolvedMethod,
    stack: &CallStack,
    services: &InlinerServices<'_>,
    options: &InlinerOptions,
) -> Option<CallTarget> {
    let hierarchy = services.hierarchy;

    // 1. not overridden
    if !declared.is_abstract && !hierarchy.is_overridden(declared.id) {
        let guard = if declared.is_unconditionally_bound() {
            VirtualGuardSelection::no_guard()
        } else {
            VirtualGuardSelection::new(GuardKind::NonOverridden, GuardTestType::Nonoverridden)
        };
        return Some(CallTarget::new(declared, guard));
    }

    // 2. proven receiver class with no override below it
    if let Some(class) = site.receiver_hint {
        if let Some(resolved) = hierarchy.resolve_virtual(class, declared.id) {
            if !hierarchy.is_overridden_in_hierarchy(class, resolved) {
                if let Some(callee) = hierarchy.resolve_method(resolved) {
                    let kind = if site.kind == CallKind::Interface {
                        GuardKind::Interface
                    } else {
                        GuardKind::Hierarchy
                    };
                    let mut target =
                        CallTarget::new(callee, VirtualGuardSelection::new(kind, GuardTestType::Nonoverridden));
                    target.receiver_class = Some(class);
                    return Some(target);
                }
            }
        }
    }

    // 3. single implementer
    if let Some(callee) = hierarchy
        .single_implementer(declared.id)
        .and_then(|m| hierarchy.resolve_method(m))
    {
        let guard = VirtualGuardSelection::new(GuardKind::MethodTest, GuardTestType::Method);
        return Some(CallTarget::new(callee, guard));
    }

    // 4. proven or profiled receiver class
    let profile_bc = ByteCodeInfo::top_level(site.bc.bc_index);
    let profile = services
        .profile
        .receiver_profile(stack.current().method.id, profile_bc);
    let (class, probability, proven) = match (site.receiver_hint, profile) {
        (Some(class), _) => (class, 100, true),
        (None, Some(p)) if p.total > 0 => (p.class, p.probability_percent(), false),
        _ => return None,
    };
    let callee = hierarchy
        .resolve_virtual(class, declared.id)
        .and_then(|m| hierarchy.resolve_method(m))?;

    let mut guard = VirtualGuardSelection::new(GuardKind::Profiled, GuardTestType::Vft).with_class(class);
    guard.profiled_probability = (!proven).then_some(probability);
    guard.high_probability = proven || probability >= options.profiled_guard_cutoff;
    let mut target = CallTarget::new(callee, guard);
    target.receiver_class = Some(class);
    Some(target)
}

// =============================================================================
// Policy
// =============================================================================

/// Compilation-wide inputs of the policy chain.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub options: &'a InlinerOptions,
    pub thresholds: &'a InlineThresholds,
    /// Callee byte-code already inlined into the compilation.
    pub inlined_size: u32,
}

/// Run every target of `site` through the policy chain, dropping the ones
/// that fail.
pub fn apply_policy_to_targets(site: &mut CallSite, body: &MethodBody, stack: &CallStack, ctx: &PolicyContext<'_>) {
    let mut index = 0;
    while index < site.targets.len() {
        match check_target(site, index, body, stack, ctx) {
            Ok(tag) => {
                site.targets[index].tag = tag;
                index += 1;
            }
            Err(reason) => {
                tracing::debug!(
                    site = %site.bc,
                    callee = %site.targets[index].callee.id,
                    reason = %reason,
                    "target rejected"
                );
                site.drop_target(index, reason);
            }
        }
    }
}

fn check_target(
    site: &CallSite,
    index: usize,
    body: &MethodBody,
    stack: &CallStack,
    ctx: &PolicyContext<'_>,
) -> Result<DecisionTag, FailureReason> {
    let options = ctx.options;
    let target = &site.targets[index];
    let callee = &target.callee;

    if callee.is_abstract {
        return Err(FailureReason::UnresolvedCallee);
    }
    if callee
        .recognized
        .is_some_and(|r| r.will_be_inlined_in_codegen())
    {
        return Err(FailureReason::RecognizedCallee);
    }

    let tag = if callee.always_worth_inlining() {
        DecisionTag::OverrideInline
    } else if matches_any(&options.try_to_inline, &callee.signature) {
        DecisionTag::TryToInline
    } else {
        DecisionTag::Default
    };

    if !tag.bypasses_size_checks() {
        let query = ThresholdQuery {
            size: callee.bytecode_size,
            block_frequency: site.frequency,
            const_args: site.const_args,
            always_worth_inlining: false,
        };
        if exceeds_threshold(ctx.thresholds, options, &query) {
            return Err(FailureReason::ExceedsByteCodeThreshold);
        }
        if callee.bytecode_size as i64 > stack.current().max_call_size as i64 {
            return Err(FailureReason::ExceedsByteCodeThreshold);
        }
        let chain: u64 = stack
            .levels()
            .iter()
            .skip(1)
            .map(|l| l.method.bytecode_size as u64)
            .sum::<u64>()
            + callee.bytecode_size as u64;
        if chain > ctx.thresholds.max_recursive_call_graph_size as u64 {
            return Err(FailureReason::ExceedsByteCodeThreshold);
        }
    }
    if tag != DecisionTag::OverrideInline
        && ctx.inlined_size as i64 + callee.bytecode_size as i64 > ctx.thresholds.callee_weight_limit as i64
    {
        return Err(FailureReason::CalleeBudgetExhausted);
    }

    let limit = options.effective_recursion_limit();
    if stack.is_anywhere_on_the_stack(body, site.bc.caller_index, callee.id, limit) {
        return Err(FailureReason::RecursiveCallee);
    }

    if site.kind.is_indirect() && options.disable_virtual_inlining {
        return Err(FailureReason::VirtualInliningDisabled);
    }
    if !site.kind.is_indirect() && options.disable_nonvirtual_inlining {
        return Err(FailureReason::NonVirtualInliningDisabled);
    }
    if callee.is_synchronized && !options.inline_synchronized {
        return Err(FailureReason::SyncMethodInliningDisabled);
    }
    if callee.exception_handlers > 0 && !options.inline_eh_aware {
        return Err(FailureReason::EhAwareCallee);
    }
    if callee.is_strict_fp && !stack.root().method.is_strict_fp {
        return Err(FailureReason::StrictFpCallee);
    }
    if matches_any(&options.dont_inline, &callee.signature) {
        return Err(FailureReason::DontInlineCallee);
    }
    if !options.only_inline.is_empty() && !matches_any(&options.only_inline, &callee.signature) {
        return Err(FailureReason::NotInlineOnlyCallee);
    }
    Ok(tag)
}

// =============================================================================
// Tests
// =============================================================================
