//! Inliner Performance Benchmarks
//!
//! Measures whole inlining passes over synthetic call graphs.
//!
//! # Benchmark Categories
//!
//! 1. **Fan-out**: one method calling many small direct callees
//! 2. **Depth**: chains of nested calls, each level split by a branchy callee
//! 3. **Guards**: virtual calls that need guards and slow paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use prism_inliner::ir::{CallKind, MethodBody, MethodBuilder};
use prism_inliner::services::{Program, ReceiverProfile};
use prism_inliner::{ClassId, Hotness, Inliner, InlinerOptions, InlinerServices, MethodId, ResolvedMethod};

const UTIL: ClassId = ClassId(1);
const MAIN: MethodId = MethodId(0);

// =============================================================================
// Benchmark Helpers
// =============================================================================

/// `if (p < 0) return -p; return p + k`
fn branchy(id: MethodId, k: i64, next: Option<MethodId>) -> MethodBody {
    let mut b = MethodBuilder::new(id);
    let p = b.parm("p");
    let entry = b.block();
    let positive = b.block();
    let negative = b.block();

    b.switch_to(entry);
    let lp = b.load(p);
    let zero = b.iconst(0);
    let c = b.cmp_lt(lp, zero);
    b.if_nonzero(c, negative);

    b.switch_to(positive);
    let kc = b.iconst(k);
    let mut value = b.add(lp, kc);
    if let Some(next) = next {
        let call = b.call(next, CallKind::Direct, &[value]);
        b.anchor(call);
        value = call;
    }
    b.ret(Some(value));

    b.switch_to(negative);
    let reload = b.load(p);
    let n = b.neg(reload);
    b.ret(Some(n));
    b.finish()
}

/// Main method calling `callees` in sequence, summing the results.
fn fan_out(program: &Program, callees: u32) -> MethodBody {
    program.add_method(ResolvedMethod::new(MAIN, UTIL, "Util.main", 40).as_static(), None);
    let mut b = MethodBuilder::new(MAIN);
    let p = b.parm("p");
    b.block();
    let mut acc = b.iconst(0);
    for i in 0..callees {
        let id = MethodId(i + 1);
        program.add_method(
            ResolvedMethod::new(id, UTIL, format!("Util.f{}", i), 12).as_static(),
            Some(branchy(id, i as i64, None)),
        );
        let lp = b.load(p);
        let call = b.call(id, CallKind::Direct, &[lp]);
        b.anchor(call);
        acc = b.add(acc, call);
    }
    b.ret(Some(acc));
    b.finish()
}

/// Main method calling the head of a chain of `depth` nested callees.
fn chain(program: &Program, depth: u32) -> MethodBody {
    program.add_method(ResolvedMethod::new(MAIN, UTIL, "Util.main", 40).as_static(), None);
    for i in 0..depth {
        let id = MethodId(i + 1);
        let next = (i + 1 < depth).then(|| MethodId(i + 2));
        program.add_method(
            ResolvedMethod::new(id, UTIL, format!("Util.g{}", i), 10).as_static(),
            Some(branchy(id, i as i64, next)),
        );
    }
    let mut b = MethodBuilder::new(MAIN);
    let p = b.parm("p");
    b.block();
    let lp = b.load(p);
    let call = b.call(MethodId(1), CallKind::Direct, &[lp]);
    b.ret(Some(call));
    b.finish()
}

/// Main method making `calls` profiled virtual calls.
fn guarded(program: &Program, calls: u32) -> MethodBody {
    const BASE: ClassId = ClassId(10);
    const DERIVED: ClassId = ClassId(11);
    const GET: MethodId = MethodId(1);
    const DERIVED_GET: MethodId = MethodId(2);

    program.add_method(ResolvedMethod::new(MAIN, UTIL, "Util.main", 40).as_static(), None);
    program.add_class(BASE, None);
    program.add_class(DERIVED, Some(BASE));
    program.add_method(ResolvedMethod::new(GET, BASE, "Base.get", 10), Some(branchy(GET, 1, None)));
    program.add_method(
        ResolvedMethod::new(DERIVED_GET, DERIVED, "Derived.get", 10),
        Some(branchy(DERIVED_GET, 2, None)),
    );
    program.add_override(DERIVED_GET, GET);

    let mut b = MethodBuilder::new(MAIN);
    let o = b.parm("o");
    b.block();
    let mut acc = b.iconst(0);
    for _ in 0..calls {
        let lo = b.load(o);
        let call = b.call(GET, CallKind::Virtual, &[lo]);
        program.set_receiver_profile(
            MAIN,
            b.bc_of(call),
            ReceiverProfile {
                class: DERIVED,
                frequency: 99,
                total: 100,
            },
        );
        b.anchor(call);
        acc = b.add(acc, call);
    }
    b.ret(Some(acc));
    b.finish()
}

fn bench_pass(c: &mut Criterion, group: &str, sizes: &[u32], build: fn(&Program, u32) -> MethodBody) {
    let mut group = c.benchmark_group(group);
    for &n in sizes {
        let program = Program::new();
        let body = build(&program, n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &body, |b, body| {
            let inliner = Inliner::new(InlinerServices::from_program(&program), InlinerOptions::aggressive())
                .with_hotness(Hotness::Hot);
            b.iter(|| {
                let mut body = body.clone();
                black_box(inliner.perform_inlining(&mut body).ok())
            });
        });
    }
    group.finish();
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_fan_out(c: &mut Criterion) {
    bench_pass(c, "fan_out", &[4, 16, 64], fan_out);
}

fn bench_depth(c: &mut Criterion) {
    bench_pass(c, "depth", &[2, 4, 8], chain);
}

fn bench_guards(c: &mut Criterion) {
    bench_pass(c, "guards", &[4, 16], guarded);
}

criterion_group!(benches, bench_fan_out, bench_depth, bench_guards);
criterion_main!(benches);
