//! On-stack replacement metadata for inlined code.
//!
//! When a guarded slow path bails out to the non-optimized execution mode,
//! every inlined frame active at that point has to be reconstructed. Each
//! inlined site that can reach a bailout owns an *OSR code block* that
//! rebuilds its frame; the blocks are chained callee to caller and end in the
//! outermost method's block, which exits compiled code.
//!
//! ```text
//!   slow path ──InduceOsr──▶ osr(site 2) ──▶ osr(site 0) ──▶ osr(top) : OsrExit
//!                              callee         its caller      outermost
//! ```

use crate::config::InlinerOptions;
use crate::ir::{BlockId, ByteCodeInfo, Cfg, MethodBody, Opcode, MAX_COLD_BLOCK_COUNT};
use crate::method::{MethodId, ResolvedMethod};

/// Inlined-site index of the outermost method.
pub const TOP_LEVEL_SITE: i32 = -1;

// =============================================================================
// OSR Compilation Data
// =============================================================================

/// OSR information for one method frame (the outermost method or an inlined
/// site).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsrMethodData {
    /// Inlined-site index, or [`TOP_LEVEL_SITE`].
    pub inlined_site: i32,
    pub method: MethodId,
    /// Block that rebuilds this frame.
    pub code_block: BlockId,
    /// Set once the code block continues into its caller's code block.
    pub linked_to_caller: bool,
}

/// OSR information for a whole compilation.
#[derive(Debug, Clone, Default)]
pub struct OsrCompilationData {
    entries: Vec<OsrMethodData>,
}

impl OsrCompilationData {
    /// Entry of `inlined_site`.
    pub fn find(&self, inlined_site: i32) -> Option<&OsrMethodData> {
        self.entries.iter().find(|e| e.inlined_site == inlined_site)
    }

    /// All entries, in creation order.
    pub fn entries(&self) -> &[OsrMethodData] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether no OSR data exists.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, data: OsrMethodData) {
        self.entries.push(data);
    }
}

fn new_osr_block(body: &mut MethodBody, terminator: Opcode, site: i32) -> BlockId {
    let block = body.append_block(MAX_COLD_BLOCK_COUNT);
    {
        let b = body.block_mut(block);
        b.is_cold = true;
        b.is_osr_code_block = true;
    }
    body.append_new_tree(
        block,
        terminator,
        &[],
        ByteCodeInfo {
            caller_index: site,
            bc_index: 0,
        },
    );
    block
}

/// OSR code block of the outermost method, created on first use.
pub fn find_or_create_top_level_block(body: &mut MethodBody) -> BlockId {
    if let Some(data) = body.osr.find(TOP_LEVEL_SITE) {
        return data.code_block;
    }
    let block = new_osr_block(body, Opcode::OsrExit, TOP_LEVEL_SITE);
    let method = body.method;
    body.osr.push(OsrMethodData {
        inlined_site: TOP_LEVEL_SITE,
        method,
        code_block: block,
        linked_to_caller: false,
    });
    block
}

/// OSR code block of `inlined_site`, created on first use. The outermost
/// method's block is created alongside so the chain always has an end.
pub fn find_or_create_site_block(body: &mut MethodBody, inlined_site: i32, method: MethodId) -> BlockId {
    find_or_create_top_level_block(body);
    if let Some(data) = body.osr.find(inlined_site) {
        return data.code_block;
    }
    let block = new_osr_block(body, Opcode::Return, inlined_site);
    body.osr.push(OsrMethodData {
        inlined_site,
        method,
        code_block: block,
        linked_to_caller: false,
    });
    block
}

/// OSR data of the nearest enclosing frame of `inlined_site` that has any,
/// falling back to the outermost method.
pub fn caller_osr_data(body: &MethodBody, inlined_site: i32) -> Option<&OsrMethodData> {
    let mut site = inlined_site;
    while site >= 0 {
        let caller = body.inlined_sites.get(site as usize)?.call.caller_index;
        if caller < 0 {
            break;
        }
        if let Some(data) = body.osr.find(caller) {
            return Some(data);
        }
        site = caller;
    }
    body.osr.find(TOP_LEVEL_SITE)
}

/// Chain every reachable inlined-site OSR code block to its caller's block.
///
/// The final `Return` or `Goto` of the block is replaced by a `Goto` to the
/// caller's OSR code block. Top-level, unreachable and already linked entries
/// are skipped, so running this twice changes nothing. Linking can make a
/// caller's block reachable, so the pass repeats until nothing changes.
/// Returns the number of blocks linked.
pub fn link_osr_code_blocks(body: &mut MethodBody) -> usize {
    let mut linked = 0;
    loop {
        let cfg = Cfg::build(body);
        let mut changed = false;
        for index in 0..body.osr.entries.len() {
            let entry = body.osr.entries[index].clone();
            if entry.inlined_site == TOP_LEVEL_SITE
                || entry.linked_to_caller
                || !cfg.is_reachable(entry.code_block)
            {
                continue;
            }
            let Some(target) = caller_osr_data(body, entry.inlined_site).map(|d| d.code_block) else {
                continue;
            };

            let block = entry.code_block;
            if let Some(last) = body.block(block).last_tree() {
                if matches!(body.node(last).op, Opcode::Return | Opcode::Goto(_)) {
                    let last_index = body.trees(block).len() - 1;
                    body.remove_tree(block, last_index);
                }
            }
            let bc = ByteCodeInfo {
                caller_index: entry.inlined_site,
                bc_index: 0,
            };
            body.append_new_tree(block, Opcode::Goto(target), &[], bc);
            body.osr.entries[index].linked_to_caller = true;
            tracing::trace!(site = entry.inlined_site, target = %target, "linked osr code block");
            linked += 1;
            changed = true;
        }
        if !changed {
            return linked;
        }
    }
}

// =============================================================================
// OSR Heuristic
// =============================================================================

/// Decide whether the slow path of an inlined call may bail out through OSR
/// instead of calling the original target.
///
/// `callers` lists the methods of the enclosing frames, innermost first.
pub fn use_osr_for_slow_path(
    options: &InlinerOptions,
    callee: &ResolvedMethod,
    is_indirect: bool,
    call_site_caller_index: i32,
    callers: &[&ResolvedMethod],
) -> bool {
    if callee.stack_slots as u32 > options.osr_callee_stack_threshold {
        return false;
    }
    let size_threshold = if is_indirect {
        options.osr_indirect_callee_size_threshold
    } else {
        options.osr_callee_size_threshold
    };
    if callee.bytecode_size > size_threshold {
        return false;
    }
    if options.disallow_nested_osr && call_site_caller_index != TOP_LEVEL_SITE {
        return false;
    }

    let mut total_size = 0u32;
    let mut total_slots = 0u32;
    for (depth, caller) in callers.iter().enumerate() {
        if depth as u32 + 1 > options.osr_max_depth {
            return false;
        }
        total_size = total_size.saturating_add(caller.bytecode_size);
        total_slots = total_slots.saturating_add(caller.stack_slots as u32);
    }
    total_size <= options.osr_caller_size_threshold && total_slots <= options.osr_caller_stack_threshold
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InlinedSite;
    use crate::method::ClassId;

    fn body_with_sites() -> MethodBody {
        let mut body = MethodBody::new(MethodId(0));
        let entry = body.append_block(-1);
        body.append_new_tree(entry, Opcode::Return, &[], ByteCodeInfo::top_level(0));
        body.inlined_sites.push(InlinedSite {
            method: MethodId(1),
            call: ByteCodeInfo::top_level(3),
        });
        body.inlined_sites.push(InlinedSite {
            method: MethodId(2),
            call: ByteCodeInfo {
                caller_index: 0,
                bc_index: 5,
            },
        });
        body
    }

    #[test]
    fn test_site_block_creates_top_level_block() {
        let mut body = body_with_sites();
        let block = find_or_create_site_block(&mut body, 1, MethodId(2));
        assert_eq!(body.osr.len(), 2);
        assert!(body.block(block).is_osr_code_block);
        assert_eq!(find_or_create_site_block(&mut body, 1, MethodId(2)), block);
        let top = body.osr.find(TOP_LEVEL_SITE).map(|d| d.code_block).unwrap();
        let last = body.block(top).last_tree().unwrap();
        assert_eq!(body.node(last).op, Opcode::OsrExit);
    }

    #[test]
    fn test_caller_osr_data_skips_frames_without_data() {
        let mut body = body_with_sites();
        find_or_create_site_block(&mut body, 1, MethodId(2));
        // site 0 has no data, so site 1 falls back to the outermost method
        let caller = caller_osr_data(&body, 1).unwrap();
        assert_eq!(caller.inlined_site, TOP_LEVEL_SITE);

        find_or_create_site_block(&mut body, 0, MethodId(1));
        assert_eq!(caller_osr_data(&body, 1).unwrap().inlined_site, 0);
    }

    #[test]
    fn test_link_skips_unreachable_and_is_idempotent() {
        let mut body = body_with_sites();
        let site_block = find_or_create_site_block(&mut body, 1, MethodId(2));
        // nothing branches to the OSR block yet
        assert_eq!(link_osr_code_blocks(&mut body), 0);

        let entry = body.entry().unwrap();
        let induce = body.create_node(
            Opcode::InduceOsr {
                site: 1,
                target: site_block,
            },
            &[],
            ByteCodeInfo::top_level(1),
        );
        body.insert_tree(entry, 0, induce);
        assert_eq!(link_osr_code_blocks(&mut body), 1);
        let top = body.osr.find(TOP_LEVEL_SITE).unwrap().code_block;
        let last = body.block(site_block).last_tree().unwrap();
        assert_eq!(body.node(last).op, Opcode::Goto(top));
        assert!(body.osr.find(1).unwrap().linked_to_caller);

        assert_eq!(link_osr_code_blocks(&mut body), 0);
        assert!(crate::ir::verify(&body).is_ok());
    }

    #[test]
    fn test_osr_heuristic_limits() {
        let options = InlinerOptions {
            osr_callee_size_threshold: 50,
            osr_indirect_callee_size_threshold: 20,
            osr_caller_size_threshold: 100,
            disallow_nested_osr: true,
            ..Default::default()
        };
        let callee = ResolvedMethod::new(MethodId(1), ClassId(1), "A.f", 30);
        let caller = ResolvedMethod::new(MethodId(2), ClassId(1), "A.g", 60);

        assert!(use_osr_for_slow_path(&options, &callee, false, TOP_LEVEL_SITE, &[&caller]));
        assert!(!use_osr_for_slow_path(&options, &callee, true, TOP_LEVEL_SITE, &[&caller]));
        assert!(!use_osr_for_slow_path(&options, &callee, false, 0, &[&caller]));
        assert!(!use_osr_for_slow_path(&options, &callee, false, TOP_LEVEL_SITE, &[&caller, &caller]));
    }
}
