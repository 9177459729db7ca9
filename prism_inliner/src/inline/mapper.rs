//! Parameter mapping.
//!
//! Each callee formal is bound to the caller in one of three ways:
//!
//! | Mapping         | When                                              | Callee `load p` becomes |
//! |-----------------|---------------------------------------------------|-------------------------|
//! | `Direct(s)`     | argument is an unshared `load s`, `p` never stored | `load s`                |
//! | `Constant(c)`   | argument is a constant, `p` never stored          | a fresh `c`             |
//! | `Privatized(t)` | anything else                                     | `load t`                |
//!
//! Privatized arguments are stored to a fresh temporary right before the
//! call's tree, which keeps their evaluation order and places the stores
//! ahead of any guard. The receiver of a dispatched call is never mapped to
//! a constant, since guards and the slow path need to read it.
//!
//! Planning is separate from application: [`ParameterPlan::new`] only reads
//! the IR, so a failed plan leaves the caller untouched.
//!
//! An argument whose exact class is known (a fresh `new C`, or a symbol the
//! call stack already knows the class of) keeps that class inside the
//! callee as long as the callee never reassigns the formal.

use super::call_stack::CallStack;
use crate::error::FailureReason;
use crate::ir::{MethodBody, NodeId, Opcode, SymbolId, TreePos};
use crate::method::ClassId;
use smallvec::SmallVec;

// =============================================================================
// Mapping
// =============================================================================

/// How one callee formal is bound in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMapping {
    /// Loads read the caller symbol.
    Direct(SymbolId),
    /// Loads become copies of the constant opcode.
    Constant(Opcode),
    /// Loads read a temporary stored before the call.
    Privatized(SymbolId),
}

/// A callee formal and its binding.
#[derive(Debug, Clone, Copy)]
pub struct MappedParameter {
    /// Callee formal.
    pub parm: SymbolId,
    /// Argument node of the original call.
    pub argument: NodeId,
    pub mapping: ParameterMapping,
    /// Exact class of the argument, when known and the formal is never
    /// reassigned.
    pub class: Option<ClassId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Planned {
    Direct(SymbolId),
    Constant(Opcode),
    Privatize,
}

// =============================================================================
// Plan
// =============================================================================

/// Mapping decisions computed without touching the caller.
#[derive(Debug, Clone)]
pub struct ParameterPlan {
    entries: SmallVec<[PlannedParameter; 4]>,
}

#[derive(Debug, Clone, Copy)]
struct PlannedParameter {
    parm: SymbolId,
    argument: NodeId,
    planned: Planned,
    reassigned: bool,
}

impl ParameterPlan {
    /// Plan the mapping of `call`'s arguments onto `callee`'s formals.
    ///
    /// Fails with [`FailureReason::IlGenFailure`] when the callee's formals
    /// do not match the call's arguments.
    pub fn new(body: &MethodBody, call: NodeId, callee: &MethodBody, is_indirect: bool) -> Result<Self, FailureReason> {
        let args = &body.node(call).children;
        let parms = callee.symbols.parms();
        if args.len() != parms.len() {
            tracing::debug!(
                args = args.len(),
                parms = parms.len(),
                "callee formals do not match the call"
            );
            return Err(FailureReason::IlGenFailure);
        }

        let entries = parms
            .iter()
            .zip(args.iter())
            .enumerate()
            .map(|(slot, (&parm, &arg))| {
                let is_receiver = is_indirect && slot == 0;
                let reassigned = callee.stores_to(parm);
                let planned = if reassigned {
                    Planned::Privatize
                } else {
                    let node = body.node(arg);
                    match node.op {
                        Opcode::Load(symbol) if node.ref_count == 1 => Planned::Direct(symbol),
                        op @ (Opcode::Const(_) | Opcode::Null) if !is_receiver => Planned::Constant(op),
                        _ => Planned::Privatize,
                    }
                };
                PlannedParameter {
                    parm,
                    argument: arg,
                    planned,
                    reassigned,
                }
            })
            .collect();
        Ok(Self { entries })
    }

    /// Number of temporaries [`ParameterPlan::apply`] will create.
    pub fn privatized_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.planned == Planned::Privatize)
            .count()
    }

    /// Create the privatization temporaries and insert their stores before
    /// the tree at `anchor`, in argument order. The anchoring tree moves down
    /// by [`ParameterPlan::privatized_count`] positions.
    pub fn apply(self, body: &mut MethodBody, anchor: TreePos, stack: &mut CallStack) -> ParameterMap {
        let bc = body.node(body.trees(anchor.block)[anchor.index]).bc;
        let mut index = anchor.index;
        let params = self
            .entries
            .into_iter()
            .map(|entry| {
                let PlannedParameter {
                    parm,
                    argument,
                    planned,
                    reassigned,
                } = entry;
                let class = match body.node(argument).op {
                    _ if reassigned => None,
                    Opcode::New(class) => Some(class),
                    Opcode::Load(symbol) => stack.known_class(symbol),
                    _ => None,
                };
                let mapping = match planned {
                    Planned::Direct(symbol) => ParameterMapping::Direct(symbol),
                    Planned::Constant(op) => ParameterMapping::Constant(op),
                    Planned::Privatize => {
                        let temp = stack.parm_temp(&mut body.symbols);
                        let store = body.create_node(Opcode::Store(temp), &[argument], bc);
                        body.insert_tree(anchor.block, index, store);
                        index += 1;
                        ParameterMapping::Privatized(temp)
                    }
                };
                MappedParameter {
                    parm,
                    argument,
                    mapping,
                    class,
                }
            })
            .collect();
        ParameterMap { params }
    }
}

// =============================================================================
// Applied Map
// =============================================================================

/// The applied mapping of one inline attempt.
#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    params: SmallVec<[MappedParameter; 4]>,
}

impl ParameterMap {
    /// Binding of callee formal `parm`.
    pub fn get(&self, parm: SymbolId) -> Option<&MappedParameter> {
        self.params.iter().find(|p| p.parm == parm)
    }

    /// Bindings in slot order.
    pub fn params(&self) -> &[MappedParameter] {
        &self.params
    }

    /// Binding of slot 0.
    pub fn receiver(&self) -> Option<&MappedParameter> {
        self.params.first()
    }

    /// Symbol a callee store to `parm` must write instead.
    pub fn store_target(&self, parm: SymbolId) -> Option<SymbolId> {
        match self.get(parm)?.mapping {
            ParameterMapping::Privatized(temp) => Some(temp),
            _ => None,
        }
    }

    /// Opcode a callee `load parm` becomes in the caller.
    pub fn load_op(&self, parm: SymbolId) -> Option<Opcode> {
        Some(match self.get(parm)?.mapping {
            ParameterMapping::Direct(symbol) | ParameterMapping::Privatized(symbol) => Opcode::Load(symbol),
            ParameterMapping::Constant(op) => op,
        })
    }

    /// Caller symbol holding the receiver, if it lives in one.
    pub fn receiver_symbol(&self) -> Option<SymbolId> {
        match self.receiver()?.mapping {
            ParameterMapping::Direct(symbol) | ParameterMapping::Privatized(symbol) => Some(symbol),
            ParameterMapping::Constant(_) => None,
        }
    }

    /// Caller symbols standing for callee formals whose exact class is known.
    pub fn known_classes(&self) -> impl Iterator<Item = (SymbolId, ClassId)> + '_ {
        self.params.iter().filter_map(|p| match (p.mapping, p.class) {
            (ParameterMapping::Direct(symbol) | ParameterMapping::Privatized(symbol), Some(class)) => {
                Some((symbol, class))
            }
            _ => None,
        })
    }

    /// Privatization temporaries in slot order.
    pub fn temps(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.params.iter().filter_map(|p| match p.mapping {
            ParameterMapping::Privatized(temp) => Some(temp),
            _ => None,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inline::call_stack::{CallStackLevel, ControlFlowInfo};
    use crate::ir::{verify, CallKind, MethodBuilder};
    use crate::method::{ClassId, MethodId, ResolvedMethod};
    use crate::osr::TOP_LEVEL_SITE;

    fn stack() -> CallStack {
        let root = ResolvedMethod::new(MethodId(0), ClassId(0), "Main.run", 40);
        CallStack::new(CallStackLevel::new(root, TOP_LEVEL_SITE, 400, ControlFlowInfo::default()))
    }

    /// Callee with formals `a, b, c`; `c` is reassigned.
    fn callee() -> MethodBody {
        let mut b = MethodBuilder::new(MethodId(1));
        let a = b.parm("a");
        let p = b.parm("b");
        let c = b.parm("c");
        b.block();
        let one = b.iconst(1);
        b.store(c, one);
        let la = b.load(a);
        let lb = b.load(p);
        let sum = b.add(la, lb);
        b.ret(Some(sum));
        b.finish()
    }

    #[test]
    fn test_mapping_kinds() {
        let mut b = MethodBuilder::new(MethodId(0));
        let x = b.parm("x");
        let block = b.block();
        let lx = b.load(x);
        let seven = b.iconst(7);
        let ly = b.load(x);
        let call = b.call(MethodId(1), CallKind::Direct, &[lx, seven, ly]);
        b.anchor(call);
        let mut body = b.finish();
        let callee = callee();

        let plan = ParameterPlan::new(&body, call, &callee, false).unwrap();
        assert_eq!(plan.privatized_count(), 1);

        let mut stack = stack();
        let map = plan.apply(&mut body, TreePos { block, index: 0 }, &mut stack);
        let parms = callee.symbols.parms();
        assert_eq!(map.get(parms[0]).unwrap().mapping, ParameterMapping::Direct(x));
        assert_eq!(map.get(parms[1]).unwrap().mapping, ParameterMapping::Constant(Opcode::Const(7)));
        let temp = map.store_target(parms[2]).unwrap();
        assert_eq!(stack.current().temps(), &[temp]);

        // the store lands before the call's tree
        assert_eq!(body.trees(block).len(), 2);
        assert_eq!(body.node(body.trees(block)[0]).op, Opcode::Store(temp));
        assert!(verify(&body).is_ok());
    }

    #[test]
    fn test_commoned_load_and_receiver_constant_are_privatized() {
        let mut b = MethodBuilder::new(MethodId(0));
        let x = b.parm("x");
        b.block();
        let lx = b.load(x);
        b.anchor(lx);
        let null = b.null();
        let call = b.call(MethodId(1), CallKind::Virtual, &[null, lx]);
        b.anchor(call);
        let body = b.finish();

        let mut cb = MethodBuilder::new(MethodId(1));
        cb.parm("this");
        cb.parm("v");
        cb.block();
        cb.ret(None);
        let callee = cb.finish();

        let plan = ParameterPlan::new(&body, call, &callee, true).unwrap();
        assert_eq!(plan.privatized_count(), 2);
    }

    #[test]
    fn test_arity_mismatch_fails_planning() {
        let mut b = MethodBuilder::new(MethodId(0));
        b.block();
        let call = b.call(MethodId(1), CallKind::Direct, &[]);
        b.anchor(call);
        let body = b.finish();
        assert_eq!(
            ParameterPlan::new(&body, call, &callee(), false).unwrap_err(),
            FailureReason::IlGenFailure
        );
    }
}
