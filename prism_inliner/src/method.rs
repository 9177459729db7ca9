//! Method and class identities as seen by the inliner.
//!
//! These are snapshots handed out by the resolution service. The inliner
//! never mutates them; anything it learns about a method (budget, occurrence
//! counts, OSR data) lives in its own per-compilation structures.

use std::fmt;

/// Identifier of a resolved or declared method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// Identifier of a loaded class or interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Identifier of a static field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StaticId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Inlining hint attached to a method by the front end or by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InlineHint {
    /// Use the size heuristics.
    #[default]
    Default,
    /// Small enough that inlining always pays off; skips size checks.
    AlwaysWorth,
    /// Must be inlined for correctness or performance contracts.
    MustInline,
}

/// Methods the code generator expands itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecognizedMethod {
    MathAbs,
    MathMin,
    MathMax,
    ArrayCopy,
    ObjectHashCode,
    /// Recognized for analysis only; still inlineable.
    StringLength,
}

impl RecognizedMethod {
    /// Check whether the code generator special-cases this method, in which
    /// case inlining its body would hide the intrinsic.
    pub const fn will_be_inlined_in_codegen(self) -> bool {
        !matches!(self, RecognizedMethod::StringLength)
    }
}

/// A method resolved by the class-hierarchy service.
#[derive(Debug, Clone)]
pub struct ResolvedMethod {
    pub id: MethodId,
    /// Declaring class.
    pub class: ClassId,
    /// `Class.method` signature used by pattern filters and traces.
    pub signature: String,
    pub bytecode_size: u32,
    /// Parameter slots including the receiver.
    pub param_count: u16,
    /// Parameter, local and pending-push slots, for OSR heuristics.
    pub stack_slots: u16,
    pub returns_value: bool,
    pub is_static: bool,
    /// Final or private: can never be overridden, whatever gets loaded later.
    pub is_final: bool,
    pub is_abstract: bool,
    pub is_synchronized: bool,
    pub is_strict_fp: bool,
    pub exception_handlers: u16,
    /// Breakpoints are set in this method (full-speed debug).
    pub has_breakpoints: bool,
    pub recognized: Option<RecognizedMethod>,
    pub hint: InlineHint,
}

impl ResolvedMethod {
    /// Create a concrete, non-final instance method with default flags.
    pub fn new(id: MethodId, class: ClassId, signature: impl Into<String>, bytecode_size: u32) -> Self {
        Self {
            id,
            class,
            signature: signature.into(),
            bytecode_size,
            param_count: 1,
            stack_slots: 4,
            returns_value: true,
            is_static: false,
            is_final: false,
            is_abstract: false,
            is_synchronized: false,
            is_strict_fp: false,
            exception_handlers: 0,
            has_breakpoints: false,
            recognized: None,
            hint: InlineHint::Default,
        }
    }

    /// Set the parameter count (including the receiver).
    pub fn with_params(mut self, count: u16) -> Self {
        self.param_count = count;
        self
    }

    /// Mark the method static.
    pub fn as_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Mark the method final.
    pub fn as_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Mark the method abstract.
    pub fn as_abstract(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Mark the method as returning no value.
    pub fn as_void(mut self) -> Self {
        self.returns_value = false;
        self
    }

    /// Attach an inlining hint.
    pub fn with_hint(mut self, hint: InlineHint) -> Self {
        self.hint = hint;
        self
    }

    /// Mark as a recognized method.
    pub fn recognized_as(mut self, method: RecognizedMethod) -> Self {
        self.recognized = Some(method);
        self
    }

    /// Check whether policy bypasses size checks for this method.
    #[inline]
    pub fn always_worth_inlining(&self) -> bool {
        matches!(self.hint, InlineHint::AlwaysWorth | InlineHint::MustInline)
    }

    /// Check whether the method can never be overridden by a later class load.
    #[inline]
    pub fn is_unconditionally_bound(&self) -> bool {
        self.is_final || self.is_static
    }
}
