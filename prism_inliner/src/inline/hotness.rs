//! Compilation hotness levels.
//!
//! The hotness of the method being compiled scales every size threshold the
//! inliner uses: hotter compilations may grow the caller further.

use std::fmt;

// =============================================================================
// Hotness
// =============================================================================

/// Optimization level of the compilation, coldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Hotness {
    /// First compilation or rarely executed code.
    Cold,
    /// Default level.
    #[default]
    Warm,
    /// Frequently executed.
    Hot,
    VeryHot,
    /// Dominates the profile; the largest budgets apply.
    Scorching,
}

impl Hotness {
    /// All levels, coldest first.
    pub const ALL: [Hotness; 5] = [
        Hotness::Cold,
        Hotness::Warm,
        Hotness::Hot,
        Hotness::VeryHot,
        Hotness::Scorching,
    ];

    /// Position in [`Hotness::ALL`], for per-level tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Check if this level gets the enlarged hot-caller weight limit.
    #[inline]
    pub const fn is_hot(self) -> bool {
        matches!(self, Hotness::Hot | Hotness::VeryHot)
    }

    #[inline]
    pub const fn is_cold(self) -> bool {
        matches!(self, Hotness::Cold)
    }
}

impl fmt::Display for Hotness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hotness::Cold => "cold",
            Hotness::Warm => "warm",
            Hotness::Hot => "hot",
            Hotness::VeryHot => "veryHot",
            Hotness::Scorching => "scorching",
        };
        f.write_str(name)
    }
}
