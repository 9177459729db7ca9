//! Reference interpreter for the tree IR.
//!
//! The interpreter defines what a body *means*, which is how inlining is
//! checked for semantic conservation: run the caller before and after the
//! transformation and compare the [`Outcome`] and the final [`Heap`].
//!
//! # Evaluation Model
//!
//! - Trees of a block run in order. A node referenced by several trees is
//!   evaluated at its first reference and the value is reused for the rest
//!   of the extended basic block; the value cache is cleared whenever
//!   control enters an EBB leader.
//! - Calls that are still present dispatch through [`ClassHierarchy`] and
//!   run the callee's IL from [`IlProvider`].
//! - Exceptions are plain values. They transfer control to the current
//!   block's handler or propagate out of the frame.
//! - Guards with a class or method test inspect the receiver. Patchable
//!   guards pass while assumptions are valid; [`Interpreter::invalidate_assumptions`]
//!   models a class load that patches them all to their slow paths.

use super::arena::SecondaryMap;
use super::block::{Block, BlockId};
use super::body::MethodBody;
use super::cfg::Cfg;
use super::node::{CallDescriptor, CallKind, GuardNode, GuardTestType, NodeId, Opcode};
use super::symbol::SymbolId;
use crate::error::IlGenError;
use crate::method::{ClassId, MethodId, StaticId};
use crate::services::{ClassHierarchy, IlProvider};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::rc::Rc;
use thiserror::Error;

/// Exception value thrown by a division by zero.
pub const ARITHMETIC_EXCEPTION: i64 = -1_000_001;

/// Exception value thrown by a field access or dispatch on null.
pub const NULL_POINTER_EXCEPTION: i64 = -1_000_002;

const DEFAULT_STEP_LIMIT: u64 = 1_000_000;
const MAX_FRAME_DEPTH: u32 = 256;

// =============================================================================
// Values and Heap
// =============================================================================

/// A runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Int(i64),
    Null,
    /// Index into [`Heap::objects`].
    Ref(u32),
}

impl Value {
    /// Integer payload, if any.
    #[inline]
    pub fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }
}

/// A heap object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub class: ClassId,
    pub fields: FxHashMap<u16, Value>,
}

/// Static fields and objects. Two heaps compare equal when every static and
/// every object (in allocation order) matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heap {
    pub statics: FxHashMap<StaticId, Value>,
    pub objects: Vec<Object>,
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an object of `class` with all fields zero.
    pub fn alloc(&mut self, class: ClassId) -> Value {
        let index = self.objects.len() as u32;
        self.objects.push(Object {
            class,
            fields: FxHashMap::default(),
        });
        Value::Ref(index)
    }

    /// Class of the object `value` refers to.
    pub fn class_of(&self, value: Value) -> Option<ClassId> {
        match value {
            Value::Ref(r) => self.objects.get(r as usize).map(|o| o.class),
            _ => None,
        }
    }
}

/// How a method invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Returned(Option<Value>),
    Threw(Value),
}

/// Interpreter failure. These indicate malformed IR or a runaway program,
/// never a Java-level exception.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpError {
    #[error("step limit of {0} exceeded")]
    StepLimitExceeded(u64),

    #[error("call depth limit exceeded")]
    StackOverflow,

    #[error("method {0} cannot be resolved")]
    UnknownMethod(MethodId),

    #[error("no implementation of {method} for class {class}")]
    UnresolvedDispatch { method: MethodId, class: ClassId },

    #[error(transparent)]
    IlGen(#[from] IlGenError),

    #[error("type error at n{}: {what}", .node.index())]
    TypeError { node: NodeId, what: &'static str },

    #[error("read of unassigned local {0}")]
    UninitializedLocal(SymbolId),

    #[error("catch evaluated outside of a handler")]
    NoPendingException,

    #[error("control fell off the end of block_{}", .0.index())]
    FellOffEnd(BlockId),

    #[error("OSR exit reached")]
    OsrExit,
}

// =============================================================================
// Interpreter
// =============================================================================

/// Non-local control transfer inside a frame.
enum Flow {
    Throw(Value),
    Fatal(InterpError),
}

impl From<InterpError> for Flow {
    fn from(err: InterpError) -> Self {
        Flow::Fatal(err)
    }
}

enum Control {
    Next,
    Jump(BlockId),
    Return(Option<Value>),
}

#[derive(Default)]
struct Frame {
    locals: FxHashMap<SymbolId, Value>,
    cache: FxHashMap<NodeId, Value>,
    exception: Option<Value>,
}

struct Prepared {
    body: MethodBody,
    leaders: SecondaryMap<Block, BlockId>,
}

/// Tree IR interpreter.
pub struct Interpreter<'a> {
    il: &'a dyn IlProvider,
    hierarchy: &'a dyn ClassHierarchy,
    /// Heap shared by all frames of a run.
    pub heap: Heap,
    assumptions_valid: bool,
    step_limit: u64,
    steps: u64,
    depth: u32,
    osr_transitions: u32,
    bodies: FxHashMap<MethodId, Rc<Prepared>>,
}

impl<'a> Interpreter<'a> {
    /// Create an interpreter over the given services with an empty heap.
    pub fn new(il: &'a dyn IlProvider, hierarchy: &'a dyn ClassHierarchy) -> Self {
        Self {
            il,
            hierarchy,
            heap: Heap::new(),
            assumptions_valid: true,
            step_limit: DEFAULT_STEP_LIMIT,
            steps: 0,
            depth: 0,
            osr_transitions: 0,
            bodies: FxHashMap::default(),
        }
    }

    /// Set the maximum number of evaluation steps per run.
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Patch every assumption guard to fail from now on.
    pub fn invalidate_assumptions(&mut self) {
        self.assumptions_valid = false;
    }

    /// Number of OSR transitions taken so far.
    pub fn osr_transitions(&self) -> u32 {
        self.osr_transitions
    }

    /// Run `body` with `args` bound to its parameters in slot order.
    pub fn run(&mut self, body: &MethodBody, args: &[Value]) -> Result<Outcome, InterpError> {
        self.steps = 0;
        let leaders = Cfg::build(body).ebb_leaders(body);
        self.execute(body, &leaders, args)
    }

    fn tick(&mut self) -> Result<(), InterpError> {
        self.steps += 1;
        if self.steps > self.step_limit {
            Err(InterpError::StepLimitExceeded(self.step_limit))
        } else {
            Ok(())
        }
    }

    fn execute(
        &mut self,
        body: &MethodBody,
        leaders: &SecondaryMap<Block, BlockId>,
        args: &[Value],
    ) -> Result<Outcome, InterpError> {
        if self.depth >= MAX_FRAME_DEPTH {
            return Err(InterpError::StackOverflow);
        }
        self.depth += 1;
        let result = self.execute_frame(body, leaders, args);
        self.depth -= 1;
        result
    }

    fn execute_frame(
        &mut self,
        body: &MethodBody,
        leaders: &SecondaryMap<Block, BlockId>,
        args: &[Value],
    ) -> Result<Outcome, InterpError> {
        let mut frame = Frame::default();
        for (i, &parm) in body.symbols.parms().iter().enumerate() {
            frame.locals.insert(parm, args.get(i).copied().unwrap_or(Value::Null));
        }

        let Some(mut block) = body.entry() else {
            return Ok(Outcome::Returned(None));
        };

        loop {
            if leaders.get(block) == Some(&block) {
                frame.cache.clear();
            }
            self.tick()?;

            let mut next = None;
            for &tree in body.trees(block) {
                match self.exec_tree(body, &mut frame, tree) {
                    Ok(Control::Next) => {}
                    Ok(Control::Jump(target)) => {
                        next = Some(target);
                        break;
                    }
                    Ok(Control::Return(value)) => return Ok(Outcome::Returned(value)),
                    Err(Flow::Throw(exception)) => match body.block(block).handler {
                        Some(handler) => {
                            frame.exception = Some(exception);
                            next = Some(handler);
                            break;
                        }
                        None => return Ok(Outcome::Threw(exception)),
                    },
                    Err(Flow::Fatal(err)) => return Err(err),
                }
            }

            block = match next {
                Some(target) => target,
                None => body
                    .next_in_layout(block)
                    .ok_or(InterpError::FellOffEnd(block))?,
            };
        }
    }

    fn exec_tree(&mut self, body: &MethodBody, frame: &mut Frame, tree: NodeId) -> Result<Control, Flow> {
        let node = body.node(tree);
        let child = |i: usize| {
            node.child(i).ok_or(Flow::Fatal(InterpError::TypeError {
                node: tree,
                what: "missing operand",
            }))
        };

        match node.op {
            Opcode::Store(symbol) => {
                let v = self.eval(body, frame, child(0)?)?;
                frame.locals.insert(symbol, v);
            }
            Opcode::StoreStatic(field) => {
                let v = self.eval(body, frame, child(0)?)?;
                self.heap.statics.insert(field, v);
            }
            Opcode::StoreField(field) => {
                let object = self.eval(body, frame, child(0)?)?;
                let v = self.eval(body, frame, child(1)?)?;
                match object {
                    Value::Ref(r) => {
                        if let Some(o) = self.heap.objects.get_mut(r as usize) {
                            o.fields.insert(field, v);
                        }
                    }
                    _ => return Err(Flow::Throw(Value::Int(NULL_POINTER_EXCEPTION))),
                }
            }
            Opcode::TreeTop => {
                self.eval(body, frame, child(0)?)?;
            }
            Opcode::Return => {
                let value = match node.first_child() {
                    Some(c) => Some(self.eval(body, frame, c)?),
                    None => None,
                };
                return Ok(Control::Return(value));
            }
            Opcode::Goto(target) => return Ok(Control::Jump(target)),
            Opcode::IfNonZero(target) => {
                let cond = self.eval(body, frame, child(0)?)?;
                if cond != Value::Int(0) && cond != Value::Null {
                    return Ok(Control::Jump(target));
                }
            }
            Opcode::Throw => {
                let v = self.eval(body, frame, child(0)?)?;
                return Err(Flow::Throw(v));
            }
            Opcode::VirtualGuard(guard) => {
                let receiver = match node.first_child() {
                    Some(c) => Some(self.eval(body, frame, c)?),
                    None => None,
                };
                if !self.guard_passes(&guard, receiver) {
                    return Ok(Control::Jump(guard.slow_path));
                }
            }
            Opcode::InduceOsr { .. } => self.osr_transitions += 1,
            Opcode::OsrExit => return Err(Flow::Fatal(InterpError::OsrExit)),
            _ => {
                self.eval(body, frame, tree)?;
            }
        }
        Ok(Control::Next)
    }

    fn guard_passes(&self, guard: &GuardNode, receiver: Option<Value>) -> bool {
        match guard.test {
            GuardTestType::None | GuardTestType::Nonoverridden | GuardTestType::Fsd => {
                self.assumptions_valid
            }
            GuardTestType::Vft => {
                let class = receiver.and_then(|r| self.heap.class_of(r));
                class.is_some() && class == guard.class
            }
            GuardTestType::Method => receiver
                .and_then(|r| self.heap.class_of(r))
                .and_then(|class| self.hierarchy.resolve_virtual(class, guard.declared))
                == Some(guard.inlined),
        }
    }

    fn eval(&mut self, body: &MethodBody, frame: &mut Frame, id: NodeId) -> Result<Value, Flow> {
        if let Some(&v) = frame.cache.get(&id) {
            return Ok(v);
        }
        self.tick()?;

        let node = body.node(id);
        let type_error = |what| Flow::Fatal(InterpError::TypeError { node: id, what });
        let mut operands: SmallVec<[Value; 4]> = SmallVec::new();
        for &c in &node.children {
            operands.push(self.eval(body, frame, c)?);
        }
        let int = |i: usize| -> Result<i64, Flow> {
            operands
                .get(i)
                .and_then(|v| v.as_int())
                .ok_or_else(|| type_error("expected integer operand"))
        };

        let value = match node.op {
            Opcode::Const(c) => Value::Int(c),
            Opcode::Null => Value::Null,
            Opcode::Load(symbol) => frame
                .locals
                .get(&symbol)
                .copied()
                .ok_or(Flow::Fatal(InterpError::UninitializedLocal(symbol)))?,
            Opcode::LoadStatic(field) => self.heap.statics.get(&field).copied().unwrap_or(Value::Int(0)),
            Opcode::New(class) => self.heap.alloc(class),
            Opcode::LoadField(field) => match operands.first() {
                Some(Value::Ref(r)) => self
                    .heap
                    .objects
                    .get(*r as usize)
                    .and_then(|o| o.fields.get(&field).copied())
                    .unwrap_or(Value::Int(0)),
                _ => return Err(Flow::Throw(Value::Int(NULL_POINTER_EXCEPTION))),
            },
            Opcode::Add => Value::Int(int(0)?.wrapping_add(int(1)?)),
            Opcode::Sub => Value::Int(int(0)?.wrapping_sub(int(1)?)),
            Opcode::Mul => Value::Int(int(0)?.wrapping_mul(int(1)?)),
            Opcode::Div => {
                let divisor = int(1)?;
                if divisor == 0 {
                    return Err(Flow::Throw(Value::Int(ARITHMETIC_EXCEPTION)));
                }
                Value::Int(int(0)?.wrapping_div(divisor))
            }
            Opcode::Neg => Value::Int(int(0)?.wrapping_neg()),
            Opcode::CmpLt => Value::Int((int(0)? < int(1)?) as i64),
            Opcode::CmpEq => Value::Int((operands.first() == operands.get(1)) as i64),
            Opcode::Call(desc) => self.invoke(desc, &operands)?,
            Opcode::Catch => frame
                .exception
                .ok_or(Flow::Fatal(InterpError::NoPendingException))?,
            _ => return Err(type_error("tree root used as a value")),
        };

        frame.cache.insert(id, value);
        Ok(value)
    }

    fn invoke(&mut self, desc: CallDescriptor, args: &[Value]) -> Result<Value, Flow> {
        let target = match desc.kind {
            CallKind::Direct => desc.method,
            CallKind::Virtual | CallKind::Interface => {
                let Some(class) = args.first().and_then(|&r| self.heap.class_of(r)) else {
                    return Err(Flow::Throw(Value::Int(NULL_POINTER_EXCEPTION)));
                };
                self.hierarchy
                    .resolve_virtual(class, desc.method)
                    .ok_or(InterpError::UnresolvedDispatch {
                        method: desc.method,
                        class,
                    })?
            }
        };

        let prepared = self.prepare(target)?;
        match self.execute(&prepared.body, &prepared.leaders, args)? {
            Outcome::Returned(value) => Ok(value.unwrap_or(Value::Null)),
            Outcome::Threw(exception) => Err(Flow::Throw(exception)),
        }
    }

    fn prepare(&mut self, method: MethodId) -> Result<Rc<Prepared>, InterpError> {
        if let Some(p) = self.bodies.get(&method) {
            return Ok(Rc::clone(p));
        }
        let resolved = self
            .hierarchy
            .resolve_method(method)
            .ok_or(InterpError::UnknownMethod(method))?;
        let body = self.il.generate_il(&resolved)?;
        let leaders = Cfg::build(&body).ebb_leaders(&body);
        let prepared = Rc::new(Prepared { body, leaders });
        self.bodies.insert(method, Rc::clone(&prepared));
        Ok(prepared)
    }
}

// =============================================================================
// Tests
// =============================================================================
