//! Method inliner for the Prism JIT.
//!
//! Replaces calls in a method's tree IR with the bodies of their targets:
//! - Size and frequency heuristics scaled by compilation hotness
//! - Devirtualization protected by layered virtual guards
//! - Parameter mapping, tree merging and block splitting
//! - Injected-block fixup of commoning across new EBB boundaries
//! - OSR bailouts on guarded slow paths
//!
//! The entry point is [`Inliner::perform_inlining`]. Method resolution, IL
//! generation and profiling are supplied through the traits in
//! [`services`]; [`services::Program`] implements all of them in memory.
//!
//! ```ignore
//! let services = InlinerServices::from_program(&program);
//! let report = Inliner::new(services, InlinerOptions::default())
//!     .with_hotness(Hotness::Hot)
//!     .perform_inlining(&mut body)?;
//! println!("{report}");
//! ```
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod inline;
pub mod ir;
pub mod method;
pub mod osr;
pub mod services;

pub use config::InlinerOptions;
pub use diagnostics::{CounterSink, DiagnosticsSink, InlineEvent, NullSink, TracingSink};
pub use error::{FailureReason, IlGenError, InlineError, VerifyError};
pub use inline::{
    CancellationToken, Hotness, InlineReport, InlineStats, Inliner, InlinerServices, MAX_INLINE_COUNT,
};
pub use method::{ClassId, MethodId, ResolvedMethod};
