//! Properties that hold for every inlining pass.

use prism_inliner::diagnostics::{DiagnosticsSink, InlineEvent};
use prism_inliner::inline::{compute_thresholds, fixup_injected_block, Hotness};
use prism_inliner::ir::{verify, CallKind, GuardKind, MethodBody, MethodBuilder, SymbolKind, Value};
use prism_inliner::services::{Program, ReceiverProfile};
use prism_inliner::{
    CancellationToken, ClassId, FailureReason, InlineError, InlineReport, Inliner, InlinerOptions, InlinerServices,
    MethodId, ResolvedMethod,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;

const MAIN: MethodId = MethodId(1);
const MAIN_CLASS: ClassId = ClassId(100);

fn main_method(program: &Program) {
    program.add_method(ResolvedMethod::new(MAIN, MAIN_CLASS, "Main.run", 30).as_static(), None);
}

/// One-parameter method returning `value`.
fn constant_method(id: MethodId, value: i64) -> MethodBody {
    let mut b = MethodBuilder::new(id);
    b.parm("p");
    b.block();
    let v = b.iconst(value);
    b.ret(Some(v));
    b.finish()
}

/// `if (p < 0) return -p; return p * 3` with a local.
fn branchy_method(id: MethodId) -> MethodBody {
    let mut b = MethodBuilder::new(id);
    let p = b.parm("p");
    let t = b.auto("t");
    let entry = b.block();
    let positive = b.block();
    let negative = b.block();
    b.switch_to(entry);
    let lp = b.load(p);
    let zero = b.iconst(0);
    let c = b.cmp_lt(lp, zero);
    b.if_nonzero(c, negative);
    b.switch_to(positive);
    let three = b.iconst(3);
    let m = b.mul(lp, three);
    b.store(t, m);
    let lt = b.load(t);
    b.ret(Some(lt));
    b.switch_to(negative);
    let lp2 = b.load(p);
    let n = b.neg(lp2);
    b.ret(Some(n));
    b.finish()
}

fn inline(program: &Program, body: &mut MethodBody, options: InlinerOptions) -> InlineReport {
    Inliner::new(InlinerServices::from_program(program), options)
        .perform_inlining(body)
        .expect("inlining failed")
}

/// `return callee(arg)` for the given call kind and receiver.
fn single_call(method: MethodId, kind: CallKind, receiver: Option<ClassId>) -> MethodBody {
    let mut b = MethodBuilder::new(MAIN);
    let p = b.parm("p");
    b.block();
    let arg = match receiver {
        Some(class) => b.new_object(class),
        None => b.load(p),
    };
    let call = b.call(method, kind, &[arg]);
    b.ret(Some(call));
    b.finish()
}

// =============================================================================
// Guard Necessity
// =============================================================================

#[test]
fn test_guard_only_when_target_is_speculative() {
    const A: ClassId = ClassId(1);
    const B: ClassId = ClassId(2);
    const STATIC: MethodId = MethodId(10);
    const FINAL: MethodId = MethodId(11);
    const PLAIN: MethodId = MethodId(12);
    const OVER: MethodId = MethodId(13);
    const B_OVER: MethodId = MethodId(14);

    let program = Program::new();
    main_method(&program);
    program.add_class(A, None);
    program.add_class(B, Some(A));
    program.add_method(
        ResolvedMethod::new(STATIC, A, "A.s", 4).as_static(),
        Some(constant_method(STATIC, 1)),
    );
    program.add_method(ResolvedMethod::new(FINAL, A, "A.f", 4).as_final(), Some(constant_method(FINAL, 2)));
    program.add_method(ResolvedMethod::new(PLAIN, A, "A.plain", 4), Some(constant_method(PLAIN, 3)));
    program.add_method(ResolvedMethod::new(OVER, A, "A.over", 4), Some(constant_method(OVER, 4)));
    program.add_method(ResolvedMethod::new(B_OVER, B, "B.over", 4), Some(constant_method(B_OVER, 5)));
    program.add_override(B_OVER, OVER);

    let profiled = single_call(OVER, CallKind::Virtual, None);
    let call = profiled
        .layout()
        .iter()
        .flat_map(|&b| profiled.trees(b).iter())
        .find_map(|&t| profiled.node(t).first_child())
        .unwrap();
    program.set_receiver_profile(
        MAIN,
        profiled.node(call).bc,
        ReceiverProfile {
            class: B,
            frequency: 9,
            total: 10,
        },
    );

    let cases = [
        (single_call(STATIC, CallKind::Direct, None), GuardKind::NoGuard),
        (single_call(FINAL, CallKind::Virtual, None), GuardKind::NoGuard),
        (single_call(PLAIN, CallKind::Virtual, None), GuardKind::NonOverridden),
        (single_call(OVER, CallKind::Virtual, Some(B)), GuardKind::Hierarchy),
        (profiled, GuardKind::Profiled),
    ];
    for (mut body, expected) in cases {
        let report = inline(&program, &mut body, InlinerOptions::default());
        let target = report.sites[0].inlined_target().expect("call not inlined");
        assert_eq!(target.guard.kind, expected, "{}", report);
        let proven = target.callee.is_unconditionally_bound();
        assert_eq!(target.guard.kind == GuardKind::NoGuard, proven);
        assert_eq!(verify(&body), Ok(()));
    }
}

// =============================================================================
// Threshold Monotonicity
// =============================================================================

#[test]
fn test_thresholds_never_shrink_with_hotness() {
    let options = InlinerOptions::default();
    for caller_size in [10, 124, 400, 900, 5000] {
        let thresholds: Vec<_> = Hotness::ALL
            .iter()
            .map(|&h| compute_thresholds(&options, h, caller_size, 100))
            .collect();
        for pair in thresholds.windows(2) {
            assert!(pair[0].method_bytecode_size <= pair[1].method_bytecode_size);
            assert!(pair[0].callee_weight_limit <= pair[1].callee_weight_limit);
        }
    }
}

#[test]
fn test_hotter_compilations_inline_at_least_as_much() {
    const MEDIUM: MethodId = MethodId(2);
    let program = Program::new();
    main_method(&program);
    program.add_method(
        ResolvedMethod::new(MEDIUM, MAIN_CLASS, "Main.medium", 180).as_static(),
        Some(branchy_method(MEDIUM)),
    );

    let inlined: Vec<usize> = Hotness::ALL
        .iter()
        .map(|&hotness| {
            let mut body = single_call(MEDIUM, CallKind::Direct, None);
            Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default())
                .with_hotness(hotness)
                .perform_inlining(&mut body)
                .unwrap()
                .stats
                .sites_inlined
        })
        .collect();
    assert!(inlined.windows(2).all(|w| w[0] <= w[1]), "{:?}", inlined);
    assert_eq!(inlined[Hotness::Warm.index()], 0);
    assert_eq!(inlined[Hotness::Hot.index()], 1);
}

// =============================================================================
// Temporary Pools
// =============================================================================

#[test]
fn test_every_temporary_is_committed_exactly_once() {
    const OUTER: MethodId = MethodId(2);
    const INNER: MethodId = MethodId(3);
    let program = Program::new();
    main_method(&program);

    // outer(p) = inner(p + 1) * inner(p)
    let mut b = MethodBuilder::new(OUTER);
    let p = b.parm("p");
    b.block();
    let lp = b.load(p);
    let one = b.iconst(1);
    let next = b.add(lp, one);
    let first = b.call(INNER, CallKind::Direct, &[next]);
    b.anchor(first);
    let second = b.call(INNER, CallKind::Direct, &[lp]);
    b.anchor(second);
    let product = b.mul(first, second);
    b.ret(Some(product));
    program.add_method(
        ResolvedMethod::new(OUTER, MAIN_CLASS, "Main.outer", 20).as_static(),
        Some(b.finish()),
    );
    program.add_method(
        ResolvedMethod::new(INNER, MAIN_CLASS, "Main.inner", 20).as_static(),
        Some(branchy_method(INNER)),
    );

    let original = single_call(OUTER, CallKind::Direct, None);
    let mut body = original.clone();
    let report = inline(&program, &mut body, InlinerOptions::default());
    assert_eq!(report.stats.sites_inlined, 3, "{}", report);

    let mut counts: FxHashMap<_, usize> = FxHashMap::default();
    for &symbol in body.symbols.automatics() {
        *counts.entry(symbol).or_default() += 1;
    }
    let mut locals = 0;
    for (id, symbol) in body.symbols.iter() {
        if matches!(symbol.kind, SymbolKind::Parm(_)) {
            continue;
        }
        locals += 1;
        assert_eq!(counts.get(&id), Some(&1), "{} committed {:?} times", symbol.name, counts.get(&id));
    }
    assert!(locals > 0);
    assert_eq!(counts.len(), body.symbols.automatics().len());

    // the first inner call's argument temporary is free again by the time
    // the second inner call needs a temporary
    let named = |prefix: &str| body.symbols.iter().filter(|(_, s)| s.name.starts_with(prefix)).count();
    assert_eq!(named("parm") + named("ret"), 2);

    let interpreter = |body: &MethodBody, p: i64| {
        prism_inliner::ir::Interpreter::new(&program, &program)
            .run(body, &[Value::Int(p)])
            .unwrap()
    };
    for p in [-3, -1, 0, 2] {
        assert_eq!(interpreter(&body, p), interpreter(&original, p));
    }
}

// =============================================================================
// Fixup Idempotence
// =============================================================================

#[test]
fn test_fixup_finds_nothing_after_inlining() {
    const CALLEE: MethodId = MethodId(2);
    let program = Program::new();
    main_method(&program);
    program.add_method(
        ResolvedMethod::new(CALLEE, MAIN_CLASS, "Main.callee", 20).as_static(),
        Some(branchy_method(CALLEE)),
    );

    // return callee(p) + p, with the load of p commoned across the call
    let mut b = MethodBuilder::new(MAIN);
    let p = b.parm("p");
    b.block();
    let lp = b.load(p);
    let call = b.call(CALLEE, CallKind::Direct, &[lp]);
    b.anchor(call);
    let sum = b.add(call, lp);
    b.ret(Some(sum));
    let mut body = b.finish();

    inline(&program, &mut body, InlinerOptions::default());
    let slots = body.node_slots();
    let layout = body.layout().to_vec();
    let mut temps = Vec::<prism_inliner::ir::SymbolId>::new();
    let again = fixup_injected_block(&mut body, &layout, &mut temps);
    assert!(again.is_empty());
    assert!(temps.is_empty());
    assert_eq!(body.node_slots(), slots);
}

// =============================================================================
// Local Failures
// =============================================================================

#[test]
fn test_il_failure_leaves_caller_unmodified() {
    const CALLEE: MethodId = MethodId(2);
    let program = Program::new();
    main_method(&program);
    program.add_method(
        ResolvedMethod::new(CALLEE, MAIN_CLASS, "Main.callee", 20).as_static(),
        Some(branchy_method(CALLEE)),
    );
    program.fail_il_for(CALLEE);

    let original = single_call(CALLEE, CallKind::Direct, None);
    let mut body = original.clone();
    let report = inline(&program, &mut body, InlinerOptions::default());
    assert_eq!(report.sites[0].failure, Some(FailureReason::IlGenFailure));
    assert_eq!(body.node_count(), original.node_count());
    assert_eq!(body.layout(), original.layout());
    assert_eq!(body.symbols.len(), original.symbols.len());
}

#[test]
fn test_call_site_threshold_stops_inlining() {
    const CALLEE: MethodId = MethodId(2);
    let program = Program::new();
    main_method(&program);
    program.add_method(
        ResolvedMethod::new(CALLEE, MAIN_CLASS, "Main.callee", 4).as_static(),
        Some(constant_method(CALLEE, 7)),
    );

    let mut b = MethodBuilder::new(MAIN);
    b.block();
    for i in 0..3 {
        let arg = b.iconst(i);
        let call = b.call(CALLEE, CallKind::Direct, &[arg]);
        b.anchor(call);
    }
    b.ret(None);
    let mut body = b.finish();

    let options = InlinerOptions {
        max_inlining_call_sites: 2,
        ..Default::default()
    };
    let report = inline(&program, &mut body, options);
    assert_eq!(report.stats.sites_inlined, 2);
    assert_eq!(report.sites[2].failure, Some(FailureReason::MaxInlineCountReached));
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cancels the pass as soon as anything is inlined.
struct CancelOnInline(CancellationToken);

impl DiagnosticsSink for CancelOnInline {
    fn record(&self, event: &InlineEvent) {
        if matches!(event, InlineEvent::Inlined { .. }) {
            self.0.cancel();
        }
    }
}

#[test]
fn test_cancellation_is_observed_between_sites() {
    const CALLEE: MethodId = MethodId(2);
    let program = Program::new();
    main_method(&program);
    program.add_method(
        ResolvedMethod::new(CALLEE, MAIN_CLASS, "Main.callee", 4).as_static(),
        Some(constant_method(CALLEE, 7)),
    );

    let mut b = MethodBuilder::new(MAIN);
    b.block();
    for i in 0..2 {
        let arg = b.iconst(i);
        let call = b.call(CALLEE, CallKind::Direct, &[arg]);
        b.anchor(call);
    }
    b.ret(None);
    let mut body = b.finish();

    let token = CancellationToken::new();
    let result = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::default())
        .with_sink(Arc::new(CancelOnInline(token.clone())))
        .with_cancellation(token.clone())
        .perform_inlining(&mut body);
    assert!(matches!(result, Err(InlineError::Cancelled)));
    assert!(token.is_cancelled());
    // the first site completed before the flag was seen
    assert_eq!(body.inlined_sites.len(), 1);
}
