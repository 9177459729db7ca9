//! Size thresholds.
//!
//! Thresholds are computed once per compilation from the options, the
//! compilation's [`Hotness`] and the size of the compiled method. Both
//! functions here are pure: the same inputs always give the same answer,
//! randomized mode included (its generator is seeded from the options).
//!
//! # Caller Weight Limit
//!
//! ```text
//!   scorching        max(1500, 2s)
//!   hot, very hot    max(1500, s + s/4)
//!   s < 125          250
//!   s < 700          max(700, s + s/4)
//!   otherwise        s + s/8
//! ```
//!
//! The caller size `s` is subtracted afterwards, so the limit is the total
//! byte-code size that may be inlined into the method.

use super::hotness::Hotness;
use crate::config::InlinerOptions;
use crate::ir::MAX_BLOCK_COUNT;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Node count limit drawn from in randomized mode.
const RANDOM_NODE_COUNT_LIMIT: u32 = 32_000;

/// Method size threshold limit drawn from in randomized mode.
const RANDOM_METHOD_THRESHOLD_LIMIT: u32 = 500;

// =============================================================================
// Thresholds
// =============================================================================

/// Thresholds of one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineThresholds {
    /// Total callee byte-code size that may be inlined.
    pub callee_weight_limit: i32,
    /// Maximum node count of the compiled method after inlining.
    pub node_count: u32,
    /// Callee byte-code threshold in warm blocks.
    pub method_bytecode_size: u32,
    /// Callee byte-code threshold in cold blocks.
    pub cold_block_bytecode_size: u32,
    pub max_call_sites: u32,
    /// Cap on the summed size of a nested inline chain.
    pub max_recursive_call_graph_size: u32,
}

/// Compute the thresholds of a compilation.
pub fn compute_thresholds(
    options: &InlinerOptions,
    hotness: Hotness,
    caller_size: u32,
    caller_node_count: u32,
) -> InlineThresholds {
    let size = caller_size.min(i32::MAX as u32) as i32;
    let weight_limit = match hotness {
        Hotness::Scorching => 1500.max(size.saturating_mul(2)),
        Hotness::Hot | Hotness::VeryHot => 1500.max(size.saturating_add(size >> 2)),
        Hotness::Cold | Hotness::Warm if size < 125 => 250,
        Hotness::Cold | Hotness::Warm if size < 700 => 700.max(size.saturating_add(size >> 2)),
        Hotness::Cold | Hotness::Warm => size.saturating_add(size >> 3),
    };

    let mut node_count = options.node_count_threshold;
    if caller_node_count > node_count {
        // leave room for a little inlining into already large methods
        node_count = (caller_node_count as u64 * 105 / 100) as u32;
    }
    if options.osr {
        node_count = node_count.saturating_mul(2);
    }

    let percent = options.hotness_size_percent[hotness.index()];
    let mut method_bytecode_size =
        (options.method_bytecode_size_threshold as u64 * percent as u64 / 100) as u32;

    if let Some(seed) = options.randomize_seed {
        let mut rng = StdRng::seed_from_u64(seed ^ u64::from(caller_size));
        node_count = rng.gen_range(0..RANDOM_NODE_COUNT_LIMIT);
        method_bytecode_size = rng.gen_range(0..RANDOM_METHOD_THRESHOLD_LIMIT);
    }

    let mut thresholds = InlineThresholds {
        callee_weight_limit: weight_limit - size,
        node_count,
        method_bytecode_size,
        cold_block_bytecode_size: options.cold_block_threshold,
        max_call_sites: options.max_inlining_call_sites,
        max_recursive_call_graph_size: options.max_recursive_call_graph_size,
    };

    if let Some(v) = options.method_threshold_override {
        thresholds.method_bytecode_size = v;
    }
    if let Some(v) = options.node_count_threshold_override {
        thresholds.node_count = v;
    }
    if let Some(v) = options.weight_limit_override {
        thresholds.callee_weight_limit = v;
    }
    thresholds
}

// =============================================================================
// Size Check
// =============================================================================

/// Inputs of one size check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdQuery {
    /// Callee byte-code size.
    pub size: u32,
    /// Frequency of the call's block, or a negative value when unknown.
    pub block_frequency: i32,
    /// Constant arguments at the call.
    pub const_args: u32,
    pub always_worth_inlining: bool,
}

/// Size estimate after frequency scaling and constant-argument decay.
///
/// Above the border frequency the estimate shrinks linearly from 100% at the
/// border to 50% at [`MAX_BLOCK_COUNT`]. Each constant argument then removes
/// `const_arg_decay_percent` of what is left.
pub fn scaled_size(options: &InlinerOptions, query: &ThresholdQuery) -> u32 {
    let mut size = query.size as u64;

    let border = options.border_frequency;
    if query.block_frequency > border && border < MAX_BLOCK_COUNT {
        let frequency = query.block_frequency.min(MAX_BLOCK_COUNT);
        let span = (MAX_BLOCK_COUNT - border) as u64;
        let over = (frequency - border) as u64;
        let percent = 100 - (50 * over) / span;
        size = size * percent / 100;
    }

    let decay = options.const_arg_decay_percent.min(100) as u64;
    for _ in 0..query.const_args {
        size -= size * decay / 100;
    }
    size as u32
}

/// Check whether a callee is too big for the call's block.
pub fn exceeds_threshold(thresholds: &InlineThresholds, options: &InlinerOptions, query: &ThresholdQuery) -> bool {
    if query.always_worth_inlining {
        return false;
    }
    let size = scaled_size(options, query);
    let cold = query.block_frequency >= 0 && query.block_frequency < options.cold_border_frequency;
    let threshold = if cold {
        thresholds.cold_block_bytecode_size
    } else {
        thresholds.method_bytecode_size
    };
    size > threshold
}

// =============================================================================
// Tests
// =============================================================================
