//! Error types for the inliner.
//!
//! Two layers exist. [`FailureReason`] is the closed set of local outcomes
//! that drop one call target or call site; it never aborts a compilation.
//! The `thiserror` enums below are engine-level errors: cancellation,
//! malformed input IR, IL generation and option parsing.

use crate::ir::{BlockId, NodeId};
use crate::method::MethodId;
use std::fmt;
use thiserror::Error;

// =============================================================================
// Failure Reasons
// =============================================================================

/// Why a call target or call site was not inlined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureReason {
    NoInlineableTargets,
    UnresolvedCallee,
    ExceedsByteCodeThreshold,
    ExceedsNodeCountThreshold,
    RecursiveCallee,
    SyncMethodInliningDisabled,
    StrictFpCallee,
    EhAwareCallee,
    VirtualInliningDisabled,
    NonVirtualInliningDisabled,
    RecognizedCallee,
    DecompilationPointConflict,
    MaxInlineCountReached,
    ColdBlock,
    IlGenFailure,
    DontInlineCallee,
    NotInlineOnlyCallee,
    CalleeBudgetExhausted,
}

impl FailureReason {
    /// All reasons, in declaration order.
    pub const ALL: [FailureReason; 18] = [
        FailureReason::NoInlineableTargets,
        FailureReason::UnresolvedCallee,
        FailureReason::ExceedsByteCodeThreshold,
        FailureReason::ExceedsNodeCountThreshold,
        FailureReason::RecursiveCallee,
        FailureReason::SyncMethodInliningDisabled,
        FailureReason::StrictFpCallee,
        FailureReason::EhAwareCallee,
        FailureReason::VirtualInliningDisabled,
        FailureReason::NonVirtualInliningDisabled,
        FailureReason::RecognizedCallee,
        FailureReason::DecompilationPointConflict,
        FailureReason::MaxInlineCountReached,
        FailureReason::ColdBlock,
        FailureReason::IlGenFailure,
        FailureReason::DontInlineCallee,
        FailureReason::NotInlineOnlyCallee,
        FailureReason::CalleeBudgetExhausted,
    ];

    /// Stable counter name.
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoInlineableTargets => "no_inlineable_targets",
            FailureReason::UnresolvedCallee => "unresolved_callee",
            FailureReason::ExceedsByteCodeThreshold => "exceeds_bytecode_threshold",
            FailureReason::ExceedsNodeCountThreshold => "exceeds_node_count_threshold",
            FailureReason::RecursiveCallee => "recursive_callee",
            FailureReason::SyncMethodInliningDisabled => "sync_method_inlining_disabled",
            FailureReason::StrictFpCallee => "strictfp_callee",
            FailureReason::EhAwareCallee => "eh_aware_callee",
            FailureReason::VirtualInliningDisabled => "virtual_inlining_disabled",
            FailureReason::NonVirtualInliningDisabled => "nonvirtual_inlining_disabled",
            FailureReason::RecognizedCallee => "recognized_callee",
            FailureReason::DecompilationPointConflict => "decompilation_point_conflict",
            FailureReason::MaxInlineCountReached => "max_inline_count_reached",
            FailureReason::ColdBlock => "cold_block",
            FailureReason::IlGenFailure => "ilgen_failure",
            FailureReason::DontInlineCallee => "dont_inline_callee",
            FailureReason::NotInlineOnlyCallee => "not_inline_only_callee",
            FailureReason::CalleeBudgetExhausted => "callee_budget_exhausted",
        }
    }

    /// Position in [`FailureReason::ALL`], for counter arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Engine Errors
// =============================================================================

/// Errors that end an inlining pass.
#[derive(Debug, Error)]
pub enum InlineError {
    /// The compilation was cancelled between call sites. The body may hold
    /// completed inlines and must be discarded by the caller.
    #[error("inlining cancelled")]
    Cancelled,

    /// The input body failed verification before any transformation ran.
    #[error("malformed input IR: {0}")]
    MalformedIr(#[from] VerifyError),

    /// The tree named for a single-call inline does not anchor a call of
    /// the compiled method.
    #[error("no call anchored at tree {index} of {block}")]
    NoCallAt { block: BlockId, index: usize },
}

/// IL generation failure reported by an [`crate::services::IlProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IlGenError {
    #[error("no bytecode available for {0}")]
    NoBytecode(MethodId),

    #[error("IL generation for {method} failed: {message}")]
    Failed { method: MethodId, message: String },
}

/// Option parsing failure.
#[derive(Debug, Error)]
pub enum OptionError {
    #[error("unknown option `{0}`")]
    UnknownKey(String),

    #[error("option `{key}` expects {expected}, got `{value}`")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("option `{key}` has an invalid pattern: {source}")]
    InvalidPattern {
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// Structural IR defect found by [`crate::ir::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("node n{} has reference count {actual}, expected {expected}", .node.index())]
    RefCountMismatch {
        node: NodeId,
        expected: u32,
        actual: u32,
    },

    #[error("node n{} is out of range", .node.index())]
    UnknownNode { node: NodeId },

    #[error("block_{} has a terminator before its last tree", .block.index())]
    TerminatorNotLast { block: BlockId },

    #[error("node n{} is only legal as a tree root", .node.index())]
    RootOnlyAsChild { node: NodeId },

    #[error("node n{} is referenced from EBBs led by block_{} and block_{}", .node.index(), .first.index(), .second.index())]
    CrossEbbCommoning {
        node: NodeId,
        first: BlockId,
        second: BlockId,
    },

    #[error("block_{} branches to block_{}, which is not laid out", .from.index(), .to.index())]
    DanglingBranch { from: BlockId, to: BlockId },
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, InlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_index_matches_table() {
        for (i, reason) in FailureReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
        assert_eq!(FailureReason::RecursiveCallee.to_string(), "recursive_callee");
    }

    #[test]
    fn test_verify_error_converts_into_inline_error() {
        let err: InlineError = VerifyError::TerminatorNotLast {
            block: BlockId::new(2),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "malformed input IR: block_2 has a terminator before its last tree"
        );
    }
}
