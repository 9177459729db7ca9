//! The inlining call stack.
//!
//! One [`CallStackLevel`] exists per nesting depth: the compiled method at
//! the bottom, then every callee currently being inlined into it. A level
//! owns the symbols created while it was current, split into three pools:
//!
//! - `temps`: privatized arguments and result temporaries;
//! - `injected_block_temps`: temporaries created by the injected-block fixup;
//! - `autos`: locals copied from inlined callees.
//!
//! [`CallStack::commit`] hands a level's pools to its parent. At the bottom
//! they become permanent automatics of the compiled method. Levels are owned
//! top-down in a vector; the current level is the last one.
//!
//! # Temporary Reuse
//!
//! A privatized argument is only read inside the inlined body it feeds, so
//! once that level is popped its temporaries join the stack's available
//! list. Later privatizations, result temporaries and fixup temporaries take
//! from that list before creating new symbols. A reused symbol stays in the
//! pool it was first recorded in; only argument temporaries are ever
//! released.

use super::fixup::TempSource;
use crate::ir::{BitSet, BlockId, Cfg, MethodBody, SymbolId, SymbolTable};
use crate::method::{ClassId, MethodId, ResolvedMethod};
use crate::osr::TOP_LEVEL_SITE;

// =============================================================================
// Control Flow Info
// =============================================================================

/// Per-block loop and always-reached facts of one level's blocks.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowInfo {
    in_loop: BitSet,
    always_reached: BitSet,
}

impl ControlFlowInfo {
    /// Compute the facts for every block of `body`.
    pub fn compute(body: &MethodBody) -> Self {
        let cfg = Cfg::build(body);
        Self {
            in_loop: cfg.looping_blocks(),
            always_reached: cfg.always_reached_blocks(body),
        }
    }

    /// Translate facts computed on a callee body to the caller blocks its
    /// blocks were copied to.
    pub fn remap(&self, block_map: &[(BlockId, BlockId)]) -> Self {
        let mut mapped = Self::default();
        for &(from, to) in block_map {
            if self.in_loop.contains(from.as_usize()) {
                mapped.in_loop.insert(to.as_usize());
            }
            if self.always_reached.contains(from.as_usize()) {
                mapped.always_reached.insert(to.as_usize());
            }
        }
        mapped
    }

    /// Give `to` the facts of `from`, used when a block is split.
    pub fn inherit(&mut self, from: BlockId, to: BlockId) {
        if self.in_loop.contains(from.as_usize()) {
            self.in_loop.insert(to.as_usize());
        }
        if self.always_reached.contains(from.as_usize()) {
            self.always_reached.insert(to.as_usize());
        }
    }

    #[inline]
    pub fn in_loop(&self, block: BlockId) -> bool {
        self.in_loop.contains(block.as_usize())
    }

    #[inline]
    pub fn always_reached(&self, block: BlockId) -> bool {
        self.always_reached.contains(block.as_usize())
    }
}

// =============================================================================
// Call Stack Level
// =============================================================================

/// One nesting level of the inliner.
#[derive(Debug)]
pub struct CallStackLevel {
    pub method: ResolvedMethod,
    /// Inlined-site index of this level's code, or [`TOP_LEVEL_SITE`].
    pub site_index: i32,
    /// Byte-code budget for callees inlined at this level.
    pub max_call_size: i32,
    /// The call currently being inlined lies in a loop.
    pub in_a_loop: bool,
    /// The call currently being inlined executes on every invocation.
    pub always_called: bool,
    info: ControlFlowInfo,
    temps: Vec<SymbolId>,
    injected_block_temps: Vec<SymbolId>,
    autos: Vec<SymbolId>,
    /// Argument temporaries of this level's call, released when it is popped.
    reusable: Vec<SymbolId>,
    /// Exact classes of symbols that keep their value for this level.
    known_classes: Vec<(SymbolId, ClassId)>,
}

impl CallStackLevel {
    /// Create a level with empty pools.
    pub fn new(method: ResolvedMethod, site_index: i32, max_call_size: i32, info: ControlFlowInfo) -> Self {
        Self {
            method,
            site_index,
            max_call_size,
            in_a_loop: false,
            always_called: false,
            info,
            temps: Vec::new(),
            injected_block_temps: Vec::new(),
            autos: Vec::new(),
            reusable: Vec::new(),
            known_classes: Vec::new(),
        }
    }

    /// Record classes the level's code may rely on.
    pub fn with_known_classes(mut self, classes: impl IntoIterator<Item = (SymbolId, ClassId)>) -> Self {
        self.known_classes.extend(classes);
        self
    }

    pub fn known_classes(&self) -> &[(SymbolId, ClassId)] {
        &self.known_classes
    }

    pub fn temps(&self) -> &[SymbolId] {
        &self.temps
    }

    pub fn injected_block_temps(&self) -> &[SymbolId] {
        &self.injected_block_temps
    }

    pub fn autos(&self) -> &[SymbolId] {
        &self.autos
    }

    /// Check whether every pool is empty.
    pub fn is_empty(&self) -> bool {
        self.temps.is_empty() && self.injected_block_temps.is_empty() && self.autos.is_empty()
    }

    /// Control flow facts of this level's blocks.
    pub fn info(&self) -> &ControlFlowInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut ControlFlowInfo {
        &mut self.info
    }
}

// =============================================================================
// Call Stack
// =============================================================================

/// Stack of [`CallStackLevel`]s, bottom first.
#[derive(Debug)]
pub struct CallStack {
    levels: Vec<CallStackLevel>,
    /// Released temporaries, most recent last.
    available: Vec<SymbolId>,
    /// Argument temporaries handed out since the last push; the next pushed
    /// level releases them.
    unreleased: Vec<SymbolId>,
}

impl CallStack {
    /// Create a stack whose bottom level is the compiled method.
    pub fn new(root: CallStackLevel) -> Self {
        debug_assert_eq!(root.site_index, TOP_LEVEL_SITE);
        Self {
            levels: vec![root],
            available: Vec::new(),
            unreleased: Vec::new(),
        }
    }

    /// Enter a callee. The new level starts with its parent's loop and
    /// always-called state.
    pub fn push(&mut self, mut level: CallStackLevel) {
        let parent = self.current();
        level.in_a_loop = parent.in_a_loop;
        level.always_called = parent.always_called;
        level.reusable.append(&mut self.unreleased);
        self.levels.push(level);
    }

    /// Leave the current callee, committing its pools into the parent.
    /// The bottom level is never popped; commit it with [`CallStack::commit`].
    pub fn pop(&mut self, symbols: &mut SymbolTable) {
        debug_assert!(self.levels.len() > 1, "cannot pop the compiled method's level");
        self.commit(symbols);
        if self.levels.len() > 1 {
            self.levels.pop();
        }
    }

    /// Move the current level's pools into its parent, or into the method's
    /// permanent automatics at the bottom. The level is left empty.
    pub fn commit(&mut self, symbols: &mut SymbolTable) {
        let Some(level) = self.levels.last_mut() else {
            return;
        };
        let temps = std::mem::take(&mut level.temps);
        let injected = std::mem::take(&mut level.injected_block_temps);
        let autos = std::mem::take(&mut level.autos);
        let reusable = std::mem::take(&mut level.reusable);
        debug_assert!(level.is_empty());

        let depth = self.levels.len();
        if depth > 1 {
            self.available.extend(reusable);
            let parent = &mut self.levels[depth - 2];
            parent.temps.extend(temps);
            parent.injected_block_temps.extend(injected);
            parent.autos.extend(autos);
        } else {
            for symbol in autos.into_iter().chain(temps).chain(injected) {
                symbols.add_automatic(symbol);
            }
        }
    }

    /// The innermost level.
    #[inline]
    pub fn current(&self) -> &CallStackLevel {
        // The bottom level is never popped.
        &self.levels[self.levels.len() - 1]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut CallStackLevel {
        let last = self.levels.len() - 1;
        &mut self.levels[last]
    }

    /// The compiled method's level.
    #[inline]
    pub fn root(&self) -> &CallStackLevel {
        &self.levels[0]
    }

    /// Levels bottom first.
    #[inline]
    pub fn levels(&self) -> &[CallStackLevel] {
        &self.levels
    }

    /// Inlining depth of the current level (0 for the compiled method).
    #[inline]
    pub fn depth(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    pub fn add_temp(&mut self, symbol: SymbolId) {
        self.current_mut().temps.push(symbol);
    }

    pub fn add_injected_block_temp(&mut self, symbol: SymbolId) {
        self.current_mut().injected_block_temps.push(symbol);
    }

    pub fn add_auto(&mut self, symbol: SymbolId) {
        self.current_mut().autos.push(symbol);
    }

    /// Temporaries released by popped levels and not yet reused.
    pub fn available_temps(&self) -> &[SymbolId] {
        &self.available
    }

    /// Temporary for a privatized argument of the call being inlined. It is
    /// released when the callee's level is popped.
    pub fn parm_temp(&mut self, symbols: &mut SymbolTable) -> SymbolId {
        let temp = match self.available.pop() {
            Some(temp) => temp,
            None => {
                let temp = symbols.new_temp("parm");
                self.add_temp(temp);
                temp
            }
        };
        self.unreleased.push(temp);
        temp
    }

    /// Temporary receiving the value of an inlined call.
    pub fn result_temp(&mut self, symbols: &mut SymbolTable) -> SymbolId {
        if let Some(temp) = self.available.pop() {
            return temp;
        }
        let temp = symbols.new_temp("ret");
        self.add_temp(temp);
        temp
    }

    /// Exact class of `symbol` known to the current level or an enclosing one.
    pub fn known_class(&self, symbol: SymbolId) -> Option<ClassId> {
        self.levels
            .iter()
            .rev()
            .flat_map(|l| l.known_classes.iter())
            .find(|&&(s, _)| s == symbol)
            .map(|&(_, class)| class)
    }

    /// Number of levels currently inlining `method`.
    pub fn occurrences(&self, method: MethodId) -> u32 {
        self.levels.iter().filter(|l| l.method.id == method).count() as u32
    }

    /// Check whether `method` occurs at least `occurrences` times among the
    /// stack levels and the inlined frames enclosing `site_index`.
    ///
    /// Frames inlined earlier (and already popped) still count when the call
    /// sits inside them, which catches recursion through previously merged
    /// code.
    pub fn is_anywhere_on_the_stack(
        &self,
        body: &MethodBody,
        site_index: i32,
        method: MethodId,
        occurrences: u32,
    ) -> bool {
        if occurrences == 0 {
            return true;
        }
        let mut counter = 0;
        let mut on_stack = Vec::with_capacity(self.levels.len());
        for level in self.levels.iter().rev() {
            if level.method.id == method {
                counter += 1;
                if counter >= occurrences {
                    return true;
                }
            }
            on_stack.push(level.site_index);
        }

        // Frames enclosing the call that are not stack levels.
        let mut index = site_index;
        while index >= 0 {
            let Some(site) = body.inlined_sites.get(index as usize) else {
                break;
            };
            if !on_stack.contains(&index) && site.method == method {
                counter += 1;
                if counter >= occurrences {
                    return true;
                }
            }
            index = site.call.caller_index;
        }
        false
    }

    /// Refresh the current level's loop and always-called state for a call
    /// in `block`. A level inside a loop stays in a loop; a level that is
    /// not always called never becomes so.
    pub fn update_state(&mut self, block: BlockId) {
        let depth = self.levels.len();
        let (parent_in_loop, parent_always) = if depth > 1 {
            let parent = &self.levels[depth - 2];
            (Some(parent.in_a_loop), Some(parent.always_called))
        } else {
            (None, None)
        };
        let level = self.current_mut();
        if parent_in_loop != Some(true) {
            level.in_a_loop = level.info.in_loop(block);
        }
        if parent_always != Some(false) {
            level.always_called = level.info.always_reached(block);
        }
    }
}

impl TempSource for CallStack {
    fn injected_block_temp(&mut self, symbols: &mut SymbolTable) -> SymbolId {
        if let Some(temp) = self.available.pop() {
            return temp;
        }
        let temp = symbols.new_temp("ibt");
        self.add_injected_block_temp(temp);
        temp
    }
}

// =============================================================================
// Tests
// =============================================================================
