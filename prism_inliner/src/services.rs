//! Collaborator interfaces used by the inliner.
//!
//! The inliner never generates IL, walks the class hierarchy or reads
//! profiling counters itself. It asks these services, which are `Send +
//! Sync` so a compile thread pool can share them:
//!
//! - **[`IlProvider`]**: builds the tree IR of a callee.
//! - **[`ClassHierarchy`]**: method resolution and override queries.
//! - **[`ProfileInfo`]**: call counts and receiver-class profiles.
//!
//! [`Program`] implements all three over in-memory tables guarded by a
//! `parking_lot::RwLock`. The inliner only reads from it.

use crate::error::IlGenError;
use crate::ir::{ByteCodeInfo, MethodBody};
use crate::method::{ClassId, MethodId, ResolvedMethod};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

// =============================================================================
// Service Traits
// =============================================================================

/// Produces the tree IR of a method.
pub trait IlProvider: Send + Sync {
    /// Generate a fresh body for `method`. Each call returns an independent
    /// copy the caller may mutate.
    fn generate_il(&self, method: &ResolvedMethod) -> Result<MethodBody, IlGenError>;
}

/// Method resolution and class hierarchy analysis.
pub trait ClassHierarchy: Send + Sync {
    /// Resolve a method identifier.
    fn resolve_method(&self, method: MethodId) -> Option<ResolvedMethod>;

    /// Method that a virtual call to `method` dispatches to for a receiver
    /// of exactly `class`.
    fn resolve_virtual(&self, class: ClassId, method: MethodId) -> Option<MethodId>;

    /// Check whether any loaded method overrides `method`.
    fn is_overridden(&self, method: MethodId) -> bool;

    /// Check whether a subclass of `class` overrides `method`.
    fn is_overridden_in_hierarchy(&self, class: ClassId, method: MethodId) -> bool;

    /// The only concrete implementation of `method`, if exactly one exists.
    fn single_implementer(&self, method: MethodId) -> Option<MethodId>;

    /// Declaring class of `method`.
    fn class_of(&self, method: MethodId) -> Option<ClassId>;
}

/// Profiled receiver class at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverProfile {
    /// Most frequent receiver class.
    pub class: ClassId,
    /// Samples that saw `class`.
    pub frequency: u32,
    /// All samples at the call site.
    pub total: u32,
}

impl ReceiverProfile {
    /// Percentage of samples that saw the dominant class.
    pub fn probability_percent(&self) -> u32 {
        if self.total == 0 {
            0
        } else {
            ((self.frequency as u64 * 100) / self.total as u64) as u32
        }
    }
}

/// Profiling data. Missing data falls back to neutral answers.
pub trait ProfileInfo: Send + Sync {
    /// Number of times the call at `bc` in `method` executed.
    fn call_count(&self, method: MethodId, bc: ByteCodeInfo) -> Option<u32>;

    /// Receiver-class profile of the call at `bc` in `method`.
    fn receiver_profile(&self, method: MethodId, bc: ByteCodeInfo) -> Option<ReceiverProfile>;
}

/// Profile source with no data.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProfile;

impl ProfileInfo for NoProfile {
    fn call_count(&self, _method: MethodId, _bc: ByteCodeInfo) -> Option<u32> {
        None
    }

    fn receiver_profile(&self, _method: MethodId, _bc: ByteCodeInfo) -> Option<ReceiverProfile> {
        None
    }
}

// =============================================================================
// In-Memory Program
// =============================================================================

#[derive(Debug, Default)]
struct ClassInfo {
    super_class: Option<ClassId>,
    interfaces: Vec<ClassId>,
    is_interface: bool,
    /// Methods declared by this class, in declaration order.
    declared: Vec<MethodId>,
}

#[derive(Debug, Default)]
struct ProgramData {
    classes: FxHashMap<ClassId, ClassInfo>,
    methods: FxHashMap<MethodId, ResolvedMethod>,
    bodies: FxHashMap<MethodId, MethodBody>,
    /// implementation -> method it directly overrides
    overrides: FxHashMap<MethodId, MethodId>,
    receiver_profiles: FxHashMap<(MethodId, ByteCodeInfo), ReceiverProfile>,
    call_counts: FxHashMap<(MethodId, ByteCodeInfo), u32>,
    il_failures: FxHashSet<MethodId>,
}

impl ProgramData {
    fn overrides_transitively(&self, implementation: MethodId, method: MethodId) -> bool {
        let mut current = Some(implementation);
        while let Some(m) = current {
            if m == method {
                return true;
            }
            current = self.overrides.get(&m).copied();
        }
        false
    }

    fn super_chain(&self, class: ClassId) -> Vec<ClassId> {
        let mut chain = Vec::new();
        let mut current = Some(class);
        while let Some(c) = current {
            if chain.contains(&c) {
                break;
            }
            chain.push(c);
            current = self.classes.get(&c).and_then(|info| info.super_class);
        }
        chain
    }

    fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool {
        let mut worklist = vec![sub];
        let mut seen = FxHashSet::default();
        while let Some(c) = worklist.pop() {
            if c == sup {
                return true;
            }
            if !seen.insert(c) {
                continue;
            }
            if let Some(info) = self.classes.get(&c) {
                worklist.extend(info.super_class);
                worklist.extend(info.interfaces.iter().copied());
            }
        }
        false
    }

    fn is_concrete(&self, method: MethodId) -> bool {
        self.methods.get(&method).is_some_and(|m| !m.is_abstract)
    }
}

/// An in-memory program: classes, methods, bodies and profiles.
///
/// Methods that override another method are linked with
/// [`Program::add_override`]; dispatch walks the superclass chain looking for
/// the first declared method that overrides the called one.
#[derive(Debug, Default)]
pub struct Program {
    data: RwLock<ProgramData>,
}

impl Program {
    /// Create an empty program.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class.
    pub fn add_class(&self, class: ClassId, super_class: Option<ClassId>) {
        let mut data = self.data.write();
        let info = data.classes.entry(class).or_default();
        info.super_class = super_class;
    }

    /// Register an interface.
    pub fn add_interface(&self, interface: ClassId) {
        let mut data = self.data.write();
        data.classes.entry(interface).or_default().is_interface = true;
    }

    /// Record that `class` implements `interface`.
    pub fn implement(&self, class: ClassId, interface: ClassId) {
        let mut data = self.data.write();
        data.classes.entry(class).or_default().interfaces.push(interface);
    }

    /// Register a method and, optionally, its body.
    pub fn add_method(&self, method: ResolvedMethod, body: Option<MethodBody>) {
        let mut data = self.data.write();
        let id = method.id;
        let declared = &mut data.classes.entry(method.class).or_default().declared;
        if !declared.contains(&id) {
            declared.push(id);
        }
        data.methods.insert(id, method);
        if let Some(body) = body {
            data.bodies.insert(id, body);
        }
    }

    /// Replace the body of a registered method.
    pub fn set_body(&self, method: MethodId, body: MethodBody) {
        self.data.write().bodies.insert(method, body);
    }

    /// Record that `implementation` overrides `overridden`.
    pub fn add_override(&self, implementation: MethodId, overridden: MethodId) {
        self.data.write().overrides.insert(implementation, overridden);
    }

    /// Attach a receiver profile to a call site.
    pub fn set_receiver_profile(&self, method: MethodId, bc: ByteCodeInfo, profile: ReceiverProfile) {
        self.data.write().receiver_profiles.insert((method, bc), profile);
    }

    /// Attach an invocation count to a call site.
    pub fn set_call_count(&self, method: MethodId, bc: ByteCodeInfo, count: u32) {
        self.data.write().call_counts.insert((method, bc), count);
    }

    /// Check whether `class` was registered as an interface.
    pub fn is_interface(&self, class: ClassId) -> bool {
        self.data.read().classes.get(&class).is_some_and(|c| c.is_interface)
    }

    /// Make IL generation fail for `method`.
    pub fn fail_il_for(&self, method: MethodId) {
        self.data.write().il_failures.insert(method);
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.data.read().methods.len()
    }

    /// Check whether no method is registered.
    pub fn is_empty(&self) -> bool {
        self.data.read().methods.is_empty()
    }
}

impl IlProvider for Program {
    fn generate_il(&self, method: &ResolvedMethod) -> Result<MethodBody, IlGenError> {
        let data = self.data.read();
        if data.il_failures.contains(&method.id) {
            return Err(IlGenError::Failed {
                method: method.id,
                message: "bytecode verification failed".to_string(),
            });
        }
        data.bodies
            .get(&method.id)
            .cloned()
            .ok_or(IlGenError::NoBytecode(method.id))
    }
}

impl ClassHierarchy for Program {
    fn resolve_method(&self, method: MethodId) -> Option<ResolvedMethod> {
        self.data.read().methods.get(&method).cloned()
    }

    fn resolve_virtual(&self, class: ClassId, method: MethodId) -> Option<MethodId> {
        let data = self.data.read();
        for c in data.super_chain(class) {
            let Some(info) = data.classes.get(&c) else {
                continue;
            };
            let found = info
                .declared
                .iter()
                .copied()
                .find(|&m| data.overrides_transitively(m, method));
            if let Some(m) = found {
                return data.is_concrete(m).then_some(m);
            }
        }
        None
    }

    fn is_overridden(&self, method: MethodId) -> bool {
        let data = self.data.read();
        data.overrides
            .keys()
            .any(|&m| m != method && data.overrides_transitively(m, method))
    }

    fn is_overridden_in_hierarchy(&self, class: ClassId, method: MethodId) -> bool {
        let data = self.data.read();
        data.overrides.keys().any(|&m| {
            m != method
                && data.overrides_transitively(m, method)
                && data
                    .methods
                    .get(&m)
                    .is_some_and(|rm| rm.class != class && data.is_subtype(rm.class, class))
        })
    }

    fn single_implementer(&self, method: MethodId) -> Option<MethodId> {
        let data = self.data.read();
        let mut implementers = data
            .methods
            .keys()
            .copied()
            .filter(|&m| data.is_concrete(m) && data.overrides_transitively(m, method));
        match (implementers.next(), implementers.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    fn class_of(&self, method: MethodId) -> Option<ClassId> {
        self.data.read().methods.get(&method).map(|m| m.class)
    }
}

impl ProfileInfo for Program {
    fn call_count(&self, method: MethodId, bc: ByteCodeInfo) -> Option<u32> {
        self.data.read().call_counts.get(&(method, bc)).copied()
    }

    fn receiver_profile(&self, method: MethodId, bc: ByteCodeInfo) -> Option<ReceiverProfile> {
        self.data.read().receiver_profiles.get(&(method, bc)).copied()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ANIMAL: ClassId = ClassId(1);
    const DOG: ClassId = ClassId(2);
    const PUPPY: ClassId = ClassId(3);
    const SPEAK: MethodId = MethodId(10);
    const DOG_SPEAK: MethodId = MethodId(11);
    const PUPPY_SPEAK: MethodId = MethodId(12);

    fn zoo() -> Program {
        let program = Program::new();
        program.add_class(ANIMAL, None);
        program.add_class(DOG, Some(ANIMAL));
        program.add_class(PUPPY, Some(DOG));
        program.add_method(ResolvedMethod::new(SPEAK, ANIMAL, "Animal.speak", 10), None);
        program.add_method(ResolvedMethod::new(DOG_SPEAK, DOG, "Dog.speak", 10), None);
        program.add_override(DOG_SPEAK, SPEAK);
        program
    }

    #[test]
    fn test_resolve_virtual_walks_superclasses() {
        let program = zoo();
        assert_eq!(program.resolve_virtual(ANIMAL, SPEAK), Some(SPEAK));
        assert_eq!(program.resolve_virtual(DOG, SPEAK), Some(DOG_SPEAK));
        assert_eq!(program.resolve_virtual(PUPPY, SPEAK), Some(DOG_SPEAK));
    }

    #[test]
    fn test_override_queries() {
        let program = zoo();
        assert!(program.is_overridden(SPEAK));
        assert!(!program.is_overridden(DOG_SPEAK));
        assert!(program.is_overridden_in_hierarchy(ANIMAL, SPEAK));
        assert!(!program.is_overridden_in_hierarchy(DOG, DOG_SPEAK));

        program.add_method(ResolvedMethod::new(PUPPY_SPEAK, PUPPY, "Puppy.speak", 10), None);
        program.add_override(PUPPY_SPEAK, DOG_SPEAK);
        assert!(program.is_overridden_in_hierarchy(DOG, DOG_SPEAK));
        assert_eq!(program.resolve_virtual(PUPPY, SPEAK), Some(PUPPY_SPEAK));
    }

    #[test]
    fn test_single_implementer_ignores_abstract_declaration() {
        let program = Program::new();
        let shape = ClassId(20);
        let circle = ClassId(21);
        let area = MethodId(30);
        let circle_area = MethodId(31);
        program.add_interface(shape);
        program.add_class(circle, None);
        program.implement(circle, shape);
        program.add_method(ResolvedMethod::new(area, shape, "Shape.area", 0).as_abstract(), None);
        program.add_method(ResolvedMethod::new(circle_area, circle, "Circle.area", 12), None);
        program.add_override(circle_area, area);

        assert!(program.is_interface(shape));
        assert_eq!(program.single_implementer(area), Some(circle_area));
        assert_eq!(program.resolve_virtual(circle, area), Some(circle_area));
        assert_eq!(program.resolve_virtual(shape, area), None);
    }

    #[test]
    fn test_il_failure_and_missing_body() {
        let program = zoo();
        let speak = program.resolve_method(SPEAK).unwrap();
        assert!(matches!(
            program.generate_il(&speak),
            Err(IlGenError::NoBytecode(m)) if m == SPEAK
        ));
        program.set_body(SPEAK, MethodBody::new(SPEAK));
        assert!(program.generate_il(&speak).is_ok());
        program.fail_il_for(SPEAK);
        assert!(matches!(program.generate_il(&speak), Err(IlGenError::Failed { .. })));
    }

    #[test]
    fn test_receiver_profile_probability() {
        let profile = ReceiverProfile {
            class: DOG,
            frequency: 90,
            total: 120,
        };
        assert_eq!(profile.probability_percent(), 75);
        assert_eq!(NoProfile.receiver_profile(SPEAK, ByteCodeInfo::top_level(0)), None);
    }
}
