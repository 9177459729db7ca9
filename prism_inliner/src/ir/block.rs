//! Basic blocks.

use super::arena::Id;
use super::node::NodeId;

/// Identifier of a block in a method body's block arena.
pub type BlockId = Id<Block>;

/// Frequency value meaning "no profile data".
pub const UNKNOWN_FREQUENCY: i32 = -1;

/// Highest frequency a profiled block can carry.
pub const MAX_BLOCK_COUNT: i32 = 10_000;

/// Blocks at or below this frequency are treated as cold.
pub const MAX_COLD_BLOCK_COUNT: i32 = 5;

/// Frequency assigned to slow paths of versioned code.
pub const VERSIONED_COLD_BLOCK_COUNT: i32 = 4;

/// A basic block: an ordered list of trees with a single entry.
///
/// Control leaves through the last tree (a goto, return or throw), through a
/// conditional branch or guard anywhere in the list, or by falling through to
/// the next block in the body's layout. Successor and predecessor edges are
/// derived from the trees; see [`crate::ir::Cfg`].
#[derive(Debug, Clone)]
pub struct Block {
    pub trees: Vec<NodeId>,
    /// Execution frequency, or [`UNKNOWN_FREQUENCY`].
    pub frequency: i32,
    pub is_cold: bool,
    /// Exception successor.
    pub handler: Option<BlockId>,
    /// Bailout block that transfers to the non-optimized execution mode.
    pub is_osr_code_block: bool,
}

impl Block {
    /// Create an empty block.
    pub fn new(frequency: i32) -> Self {
        Self {
            trees: Vec::new(),
            frequency,
            is_cold: false,
            handler: None,
            is_osr_code_block: false,
        }
    }

    /// Check whether the block is cold either by flag or by frequency.
    #[inline]
    pub fn is_cold_by_frequency(&self) -> bool {
        self.is_cold || (self.frequency >= 0 && self.frequency <= MAX_COLD_BLOCK_COUNT)
    }

    /// Last tree root, if any.
    #[inline]
    pub fn last_tree(&self) -> Option<NodeId> {
        self.trees.last().copied()
    }
}
