//! Interned symbol names.
//!
//! Identifiers and symbol literals (`:quarter`, `:reverb`) are interned once
//! in a process-wide table so they can be copied, hashed and compared as
//! plain integers. The table is shared between threads, which lets a value
//! built on a script thread be consumed on the runtime thread.

use lasso::{Spur, ThreadedRodeo};
use std::fmt;
use std::sync::LazyLock;

static INTERNER: LazyLock<ThreadedRodeo> = LazyLock::new(ThreadedRodeo::new);

/// An interned name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Spur);

impl Symbol {
    /// Intern `name`, returning the existing symbol if it was seen before.
    pub fn new(name: &str) -> Self {
        Self(INTERNER.get_or_intern(name))
    }

    /// The interned text.
    pub fn as_str(&self) -> &'static str {
        INTERNER.resolve(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Symbol::new(name)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
