//! Diagnostics sinks.
//!
//! The inliner reports every decision and structural change as an
//! [`InlineEvent`]. Sinks are append-only observers: nothing they record
//! feeds back into a decision.

use crate::error::FailureReason;
use crate::ir::{ByteCodeInfo, GuardKind};
use crate::method::MethodId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Events recorded during an inlining pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineEvent {
    /// A callee body replaced a call.
    Inlined {
        site: ByteCodeInfo,
        callee: MethodId,
        guard: GuardKind,
        depth: u32,
    },
    /// A call site or target was abandoned.
    Failed {
        site: ByteCodeInfo,
        callee: Option<MethodId>,
        reason: FailureReason,
        depth: u32,
    },
    /// A guard tree was emitted for an inlined site.
    GuardInserted { kind: GuardKind, site: i32 },
    /// A slow path was given an OSR transition.
    OsrTransitionAttached { site: i32 },
    /// The injected-block fixup repaired cross-EBB references.
    FixupApplied {
        temps: u32,
        constants: u32,
        loads: u32,
    },
}

/// Receiver of inlining events.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: &InlineEvent);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn record(&self, _event: &InlineEvent) {}
}

/// Sink that forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, event: &InlineEvent) {
        match event {
            InlineEvent::Inlined {
                site,
                callee,
                guard,
                depth,
            } => tracing::debug!(site = %site, callee = %callee, guard = %guard, depth, "inlined"),
            InlineEvent::Failed {
                site,
                callee,
                reason,
                depth,
            } => tracing::debug!(site = %site, callee = ?callee, reason = %reason, depth, "not inlined"),
            InlineEvent::GuardInserted { kind, site } => {
                tracing::debug!(kind = %kind, site, "guard inserted")
            }
            InlineEvent::OsrTransitionAttached { site } => {
                tracing::debug!(site, "osr transition attached")
            }
            InlineEvent::FixupApplied {
                temps,
                constants,
                loads,
            } => tracing::debug!(temps, constants, loads, "injected block fixup"),
        }
    }
}

// =============================================================================
// Counter Sink
// =============================================================================

const TRACE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Counters {
    inlined: u64,
    failures: [u64; FailureReason::ALL.len()],
    guards: FxHashMap<GuardKind, u64>,
    osr_transitions: u64,
    trace: VecDeque<InlineEvent>,
}

/// Sink that counts events by kind and keeps the most recent ones.
#[derive(Debug, Default)]
pub struct CounterSink {
    counters: Mutex<Counters>,
}

impl CounterSink {
    /// Create an empty counter sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful inlines.
    pub fn inlined(&self) -> u64 {
        self.counters.lock().inlined
    }

    /// Number of failures recorded for `reason`.
    pub fn failures(&self, reason: FailureReason) -> u64 {
        self.counters.lock().failures[reason.index()]
    }

    /// Number of guards emitted of `kind`.
    pub fn guards(&self, kind: GuardKind) -> u64 {
        self.counters.lock().guards.get(&kind).copied().unwrap_or(0)
    }

    /// Number of OSR transitions attached.
    pub fn osr_transitions(&self) -> u64 {
        self.counters.lock().osr_transitions
    }

    /// Most recent events, oldest first.
    pub fn trace(&self) -> Vec<InlineEvent> {
        self.counters.lock().trace.iter().cloned().collect()
    }
}

impl DiagnosticsSink for CounterSink {
    fn record(&self, event: &InlineEvent) {
        let mut counters = self.counters.lock();
        match event {
            InlineEvent::Inlined { .. } => counters.inlined += 1,
            InlineEvent::Failed { reason, .. } => counters.failures[reason.index()] += 1,
            InlineEvent::GuardInserted { kind, .. } => *counters.guards.entry(*kind).or_insert(0) += 1,
            InlineEvent::OsrTransitionAttached { .. } => counters.osr_transitions += 1,
            InlineEvent::FixupApplied { .. } => {}
        }
        if counters.trace.len() == TRACE_CAPACITY {
            counters.trace.pop_front();
        }
        counters.trace.push_back(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_sink_counts_by_kind() {
        let sink = CounterSink::new();
        let site = ByteCodeInfo::top_level(3);
        sink.record(&InlineEvent::Failed {
            site,
            callee: Some(MethodId(1)),
            reason: FailureReason::RecursiveCallee,
            depth: 2,
        });
        sink.record(&InlineEvent::GuardInserted {
            kind: GuardKind::Profiled,
            site: 0,
        });
        sink.record(&InlineEvent::Inlined {
            site,
            callee: MethodId(1),
            guard: GuardKind::Profiled,
            depth: 1,
        });

        assert_eq!(sink.inlined(), 1);
        assert_eq!(sink.failures(FailureReason::RecursiveCallee), 1);
        assert_eq!(sink.failures(FailureReason::ColdBlock), 0);
        assert_eq!(sink.guards(GuardKind::Profiled), 1);
        assert_eq!(sink.trace().len(), 3);
    }

    #[test]
    fn test_trace_is_bounded() {
        let sink = CounterSink::new();
        for i in 0..(TRACE_CAPACITY as i32 + 10) {
            sink.record(&InlineEvent::OsrTransitionAttached { site: i });
        }
        let trace = sink.trace();
        assert_eq!(trace.len(), TRACE_CAPACITY);
        assert_eq!(trace[0], InlineEvent::OsrTransitionAttached { site: 10 });
        assert_eq!(sink.osr_transitions(), TRACE_CAPACITY as u64 + 10);
    }

    /// Shared buffer the fmt subscriber writes into.
    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tracing_sink_records_under_subscriber() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            TracingSink.record(&InlineEvent::FixupApplied {
                temps: 1,
                constants: 2,
                loads: 3,
            });
            TracingSink.record(&InlineEvent::GuardInserted {
                kind: GuardKind::Hcr,
                site: 0,
            });
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("injected block fixup"), "{}", output);
        assert!(output.contains("temps=1"), "{}", output);
        assert!(output.contains("guard inserted"), "{}", output);
        assert!(output.contains("kind=HCRGuard"), "{}", output);
        assert_eq!(output.lines().count(), 2, "{}", output);
    }
}
