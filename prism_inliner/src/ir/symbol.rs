//! Method-local symbols: parameters, automatics and temporaries.

use super::arena::{Arena, Id};

/// Identifier of a symbol in a method body's symbol table.
pub type SymbolId = Id<Symbol>;

/// Storage class of a local symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// Formal parameter at the given slot (receiver is slot 0).
    Parm(u16),
    /// Local variable from the source method.
    Auto,
    /// Compiler-introduced temporary.
    Temp,
}

/// A method-local symbol.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
}

/// Symbols of one method body.
///
/// All symbols live in the arena. A temporary only becomes part of the
/// method's permanent automatics once the call stack level that created it
/// has committed it.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Arena<Symbol>,
    parms: Vec<SymbolId>,
    automatics: Vec<SymbolId>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the next formal parameter.
    pub fn add_parm(&mut self, name: impl Into<String>) -> SymbolId {
        let slot = self.parms.len() as u16;
        let id = self.symbols.alloc(Symbol {
            kind: SymbolKind::Parm(slot),
            name: name.into(),
        });
        self.parms.push(id);
        id
    }

    /// Declare a source-level local and register it as an automatic.
    pub fn add_auto(&mut self, name: impl Into<String>) -> SymbolId {
        let id = self.symbols.alloc(Symbol {
            kind: SymbolKind::Auto,
            name: name.into(),
        });
        self.automatics.push(id);
        id
    }

    /// Allocate an automatic symbol that is not yet registered with the
    /// method; the caller is responsible for handing it to a pool.
    pub fn new_pending_auto(&mut self, name: impl Into<String>) -> SymbolId {
        self.symbols.alloc(Symbol {
            kind: SymbolKind::Auto,
            name: name.into(),
        })
    }

    /// Allocate an unregistered temporary.
    pub fn new_temp(&mut self, prefix: &str) -> SymbolId {
        let next = self.symbols.next_id();
        self.symbols.alloc(Symbol {
            kind: SymbolKind::Temp,
            name: format!("{}{}", prefix, next.index()),
        })
    }

    /// Register a committed symbol as a permanent automatic.
    pub fn add_automatic(&mut self, id: SymbolId) {
        debug_assert!(!self.automatics.contains(&id), "automatic registered twice");
        self.automatics.push(id);
    }

    /// Look up a symbol.
    #[inline]
    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id)
    }

    /// Formal parameters in slot order.
    #[inline]
    pub fn parms(&self) -> &[SymbolId] {
        &self.parms
    }

    /// Registered automatics, including committed temporaries.
    #[inline]
    pub fn automatics(&self) -> &[SymbolId] {
        &self.automatics
    }

    /// Total number of symbols.
    #[inline]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Check whether no symbol has been declared.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Iterate over every symbol.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parms_get_sequential_slots() {
        let mut table = SymbolTable::new();
        let this = table.add_parm("this");
        let x = table.add_parm("x");
        assert_eq!(table.get(this).map(|s| s.kind), Some(SymbolKind::Parm(0)));
        assert_eq!(table.get(x).map(|s| s.kind), Some(SymbolKind::Parm(1)));
        assert_eq!(table.parms(), &[this, x]);
    }

    #[test]
    fn test_temps_are_not_automatics_until_registered() {
        let mut table = SymbolTable::new();
        let t = table.new_temp("t");
        assert!(table.automatics().is_empty());
        table.add_automatic(t);
        assert_eq!(table.automatics(), &[t]);
        assert_eq!(table.get(t).map(|s| s.name.as_str()), Some("t0"));
    }
}
