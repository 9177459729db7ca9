//! Inliner options.
//!
//! One immutable [`InlinerOptions`] value drives a compilation. It can be
//! built from a preset or resolved once from a flat key/value
//! [`OptionSource`]. Keys carry the `inliner.` prefix, booleans accept
//! `true`/`false`/`1`/`0`, and pattern lists are comma-separated regular
//! expressions matched against `Class.method` signatures.

use crate::error::OptionError;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::str::FromStr;

// =============================================================================
// Options
// =============================================================================

/// Configuration of the inliner.
#[derive(Debug, Clone)]
pub struct InlinerOptions {
    // Compilation modes
    /// Hot code replace: direct inlines are protected by HCR guards.
    pub hcr: bool,
    /// Full-speed debug: breakpoint guards and decompilation checks.
    pub full_speed_debug: bool,
    /// Ahead-of-time compilation: direct inlines get direct-method guards.
    pub aot: bool,
    /// OSR bailout paths may replace slow-path calls.
    pub osr: bool,
    /// The back end folds HCR guards into the primary guard.
    pub merge_hcr_guards: bool,

    // Policy
    /// Occurrences of a method on the inline stack before it is refused.
    pub recursion_limit: u32,
    /// Refuse any recursive inline.
    pub reduced_recursion: bool,
    pub disable_virtual_inlining: bool,
    pub disable_nonvirtual_inlining: bool,
    pub inline_synchronized: bool,
    /// Allow callees that contain exception handlers.
    pub inline_eh_aware: bool,
    pub try_to_inline: Vec<Regex>,
    pub dont_inline: Vec<Regex>,
    /// When non-empty, only matching callees are inlined.
    pub only_inline: Vec<Regex>,

    // Thresholds
    /// Base callee byte-code threshold before hotness scaling.
    pub method_bytecode_size_threshold: u32,
    /// Percentage applied to the base threshold per hotness level, coldest first.
    pub hotness_size_percent: [u32; 5],
    /// Callee byte-code threshold for call sites in cold blocks.
    pub cold_block_threshold: u32,
    pub node_count_threshold: u32,
    pub max_inlining_call_sites: u32,
    /// Cap on the summed byte-code size of a nested inline chain.
    pub max_recursive_call_graph_size: u32,
    /// Callee estimate reduction per constant argument, in percent.
    pub const_arg_decay_percent: u32,
    /// Above this block frequency callee estimates are scaled down.
    pub border_frequency: i32,
    /// Below this block frequency the cold-block threshold applies.
    pub cold_border_frequency: i32,
    /// At cold hotness, blocks below this frequency are not inlined into.
    pub very_cold_border_frequency: i32,
    pub method_threshold_override: Option<u32>,
    pub node_count_threshold_override: Option<u32>,
    pub weight_limit_override: Option<i32>,
    /// Seed for randomized thresholds; `None` disables randomization.
    pub randomize_seed: Option<u64>,

    // Per-level budget
    pub initial_budget: i32,
    /// Caller size at which the initial budget reaches zero.
    pub budget_size_cutoff: i32,
    /// Nested budgets shrink by `callee size / budget_divisor`.
    pub budget_divisor: i32,

    // Guards and OSR
    /// Receiver profile probability (percent) for a high-probability guard.
    pub profiled_guard_cutoff: u32,
    pub disallow_nested_osr: bool,
    pub osr_max_depth: u32,
    pub osr_callee_size_threshold: u32,
    pub osr_indirect_callee_size_threshold: u32,
    pub osr_callee_stack_threshold: u32,
    pub osr_caller_size_threshold: u32,
    pub osr_caller_stack_threshold: u32,

    // Diagnostics
    /// 0 = decisions only, 1 = per call site, 2 = per transform step.
    pub trace_level: u8,
}

impl Default for InlinerOptions {
    fn default() -> Self {
        Self {
            hcr: false,
            full_speed_debug: false,
            aot: false,
            osr: false,
            merge_hcr_guards: false,
            recursion_limit: 3,
            reduced_recursion: false,
            disable_virtual_inlining: false,
            disable_nonvirtual_inlining: false,
            inline_synchronized: false,
            inline_eh_aware: true,
            try_to_inline: Vec::new(),
            dont_inline: Vec::new(),
            only_inline: Vec::new(),
            method_bytecode_size_threshold: 155,
            hotness_size_percent: [100, 100, 130, 160, 200],
            cold_block_threshold: 30,
            node_count_threshold: 16_000,
            max_inlining_call_sites: 4095,
            max_recursive_call_graph_size: 1024,
            const_arg_decay_percent: 10,
            border_frequency: 2500,
            cold_border_frequency: 10,
            very_cold_border_frequency: 1500,
            method_threshold_override: None,
            node_count_threshold_override: None,
            weight_limit_override: None,
            randomize_seed: None,
            initial_budget: 400,
            budget_size_cutoff: 4000,
            budget_divisor: 4,
            profiled_guard_cutoff: 70,
            disallow_nested_osr: false,
            osr_max_depth: 100_000,
            osr_callee_size_threshold: 100_000,
            osr_indirect_callee_size_threshold: 100_000,
            osr_callee_stack_threshold: 100_000,
            osr_caller_size_threshold: 100_000,
            osr_caller_stack_threshold: 100_000,
            trace_level: 0,
        }
    }
}

impl InlinerOptions {
    /// Smaller thresholds and no recursive inlining, for fast compiles.
    pub fn conservative() -> Self {
        Self {
            method_bytecode_size_threshold: 80,
            reduced_recursion: true,
            max_inlining_call_sites: 1000,
            initial_budget: 200,
            ..Default::default()
        }
    }

    /// Larger thresholds for peak-performance compiles.
    pub fn aggressive() -> Self {
        Self {
            method_bytecode_size_threshold: 300,
            initial_budget: 800,
            profiled_guard_cutoff: 50,
            inline_synchronized: true,
            ..Default::default()
        }
    }

    /// Full-speed debug with verbose tracing.
    pub fn debug() -> Self {
        Self {
            full_speed_debug: true,
            trace_level: 2,
            ..Default::default()
        }
    }

    /// Effective recursion occurrence limit.
    #[inline]
    pub fn effective_recursion_limit(&self) -> u32 {
        if self.reduced_recursion {
            1
        } else {
            self.recursion_limit
        }
    }

    /// Resolve options from `source`, starting from the defaults.
    pub fn from_source(source: &dyn OptionSource) -> Result<Self, OptionError> {
        let mut options = Self::default();
        options.apply(source)?;
        Ok(options)
    }

    /// Apply every key of `source` on top of `self`.
    pub fn apply(&mut self, source: &dyn OptionSource) -> Result<(), OptionError> {
        for key in source.keys() {
            let Some(value) = source.get(&key) else {
                continue;
            };
            let value = value.trim();
            match key.strip_prefix("inliner.") {
                Some("hcr") => self.hcr = parse_bool(&key, value)?,
                Some("full_speed_debug") => self.full_speed_debug = parse_bool(&key, value)?,
                Some("aot") => self.aot = parse_bool(&key, value)?,
                Some("osr") => self.osr = parse_bool(&key, value)?,
                Some("merge_hcr_guards") => self.merge_hcr_guards = parse_bool(&key, value)?,
                Some("recursion_limit") => self.recursion_limit = parse_num(&key, value)?,
                Some("reduced_recursion") => self.reduced_recursion = parse_bool(&key, value)?,
                Some("disable_virtual_inlining") => {
                    self.disable_virtual_inlining = parse_bool(&key, value)?
                }
                Some("disable_nonvirtual_inlining") => {
                    self.disable_nonvirtual_inlining = parse_bool(&key, value)?
                }
                Some("inline_synchronized") => self.inline_synchronized = parse_bool(&key, value)?,
                Some("inline_eh_aware") => self.inline_eh_aware = parse_bool(&key, value)?,
                Some("try_to_inline") => self.try_to_inline = parse_patterns(&key, value)?,
                Some("dont_inline") => self.dont_inline = parse_patterns(&key, value)?,
                Some("only_inline") => self.only_inline = parse_patterns(&key, value)?,
                Some("method_bytecode_size_threshold") => {
                    self.method_bytecode_size_threshold = parse_num(&key, value)?
                }
                Some("cold_block_threshold") => self.cold_block_threshold = parse_num(&key, value)?,
                Some("node_count_threshold") => self.node_count_threshold = parse_num(&key, value)?,
                Some("max_inlining_call_sites") => {
                    self.max_inlining_call_sites = parse_num(&key, value)?
                }
                Some("max_recursive_call_graph_size") => {
                    self.max_recursive_call_graph_size = parse_num(&key, value)?
                }
                Some("const_arg_decay_percent") => {
                    self.const_arg_decay_percent = parse_num::<u32>(&key, value)?.min(100)
                }
                Some("border_frequency") => self.border_frequency = parse_num(&key, value)?,
                Some("cold_border_frequency") => self.cold_border_frequency = parse_num(&key, value)?,
                Some("very_cold_border_frequency") => {
                    self.very_cold_border_frequency = parse_num(&key, value)?
                }
                Some("method_threshold_override") => {
                    self.method_threshold_override = Some(parse_num(&key, value)?)
                }
                Some("node_count_threshold_override") => {
                    self.node_count_threshold_override = Some(parse_num(&key, value)?)
                }
                Some("weight_limit_override") => {
                    self.weight_limit_override = Some(parse_num(&key, value)?)
                }
                Some("randomize_seed") => self.randomize_seed = Some(parse_num(&key, value)?),
                Some("initial_budget") => self.initial_budget = parse_num(&key, value)?,
                Some("budget_size_cutoff") => {
                    self.budget_size_cutoff = parse_positive(&key, value)?
                }
                Some("budget_divisor") => self.budget_divisor = parse_positive(&key, value)?,
                Some("profiled_guard_cutoff") => self.profiled_guard_cutoff = parse_num(&key, value)?,
                Some("disallow_nested_osr") => self.disallow_nested_osr = parse_bool(&key, value)?,
                Some("osr_max_depth") => self.osr_max_depth = parse_num(&key, value)?,
                Some("osr_callee_size_threshold") => {
                    self.osr_callee_size_threshold = parse_num(&key, value)?
                }
                Some("osr_indirect_callee_size_threshold") => {
                    self.osr_indirect_callee_size_threshold = parse_num(&key, value)?
                }
                Some("osr_callee_stack_threshold") => {
                    self.osr_callee_stack_threshold = parse_num(&key, value)?
                }
                Some("osr_caller_size_threshold") => {
                    self.osr_caller_size_threshold = parse_num(&key, value)?
                }
                Some("osr_caller_stack_threshold") => {
                    self.osr_caller_stack_threshold = parse_num(&key, value)?
                }
                Some("trace_level") => self.trace_level = parse_num::<u8>(&key, value)?.min(2),
                _ => return Err(OptionError::UnknownKey(key)),
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, OptionError> {
    match value {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "a boolean")),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, OptionError> {
    value.parse().map_err(|_| invalid(key, value, "a number"))
}

fn parse_positive(key: &str, value: &str) -> Result<i32, OptionError> {
    match value.parse::<i32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(invalid(key, value, "a positive number")),
    }
}

fn parse_patterns(key: &str, value: &str) -> Result<Vec<Regex>, OptionError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            Regex::new(p).map_err(|source| OptionError::InvalidPattern {
                key: key.to_string(),
                source,
            })
        })
        .collect()
}

fn invalid(key: &str, value: &str, expected: &'static str) -> OptionError {
    OptionError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

/// Check whether any pattern matches `signature`.
pub fn matches_any(patterns: &[Regex], signature: &str) -> bool {
    patterns.iter().any(|p| p.is_match(signature))
}

// =============================================================================
// Option Sources
// =============================================================================

/// A flat key/value option source.
pub trait OptionSource {
    /// Value of `key`, if set.
    fn get(&self, key: &str) -> Option<&str>;

    /// Every key that is set.
    fn keys(&self) -> Vec<String>;
}

/// Option source backed by a hash map.
#[derive(Debug, Clone, Default)]
pub struct MapOptionSource {
    values: FxHashMap<String, String>,
}

impl MapOptionSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Set a key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl OptionSource for MapOptionSource {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }
}

// =============================================================================
// Tests
// =============================================================================
