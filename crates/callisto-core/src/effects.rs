//! Dynamic effect scopes opened by `with_fx`.
//!
//! The stack is owned by the interpreter rather than kept in thread-local
//! state, so several interpreters can run side by side. Every scope pushed by
//! [`EffectHost::with_effect`] is removed again on every exit path; callers
//! that suspend inside a scope record the scopes they were in and re-enter
//! them on resume.

use crate::symbol::Symbol;
use crate::value::Value;
use std::fmt;

/// One active `with_fx` scope.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectScope {
    pub tag: Symbol,
    pub params: Vec<(Symbol, Value)>,
}

impl EffectScope {
    pub fn new(tag: Symbol) -> Self {
        Self {
            tag,
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: Symbol, value: Value) -> Self {
        self.params.push((name, value));
        self
    }

    pub fn param(&self, name: Symbol) -> Option<&Value> {
        self.params
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

impl fmt::Display for EffectScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.tag)?;
        for (name, value) in &self.params {
            write!(f, " {}={}", name, value)?;
        }
        Ok(())
    }
}

/// Ordered stack of active scopes, outermost first.
#[derive(Clone, Debug, Default)]
pub struct EffectStack {
    scopes: Vec<EffectScope>,
}

impl EffectStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, scope: EffectScope) {
        log::trace!("[FX] Enter {} (depth {})", scope, self.scopes.len() + 1);
        self.scopes.push(scope);
    }

    pub fn pop(&mut self) -> Option<EffectScope> {
        self.scopes.pop()
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Drop every scope above `depth`.
    pub fn truncate(&mut self, depth: usize) {
        self.scopes.truncate(depth);
    }

    pub fn active(&self) -> &[EffectScope] {
        &self.scopes
    }

    /// Copy of the active scopes, handed to collaborators with each request.
    pub fn snapshot(&self) -> Vec<EffectScope> {
        self.scopes.clone()
    }

    pub fn contains(&self, tag: Symbol) -> bool {
        self.scopes.iter().any(|scope| scope.tag == tag)
    }

    /// Slash-separated tag path, e.g. `reverb/echo`.
    pub fn path(&self) -> String {
        self.scopes
            .iter()
            .map(|scope| scope.tag.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Anything that owns an [`EffectStack`] and can run code inside a scope.
pub trait EffectHost {
    fn effect_stack(&mut self) -> &mut EffectStack;

    /// Run `body` with `scope` pushed, restoring the previous depth afterwards
    /// whether `body` succeeds, fails, or suspends.
    fn with_effect<T>(&mut self, scope: EffectScope, body: impl FnOnce(&mut Self) -> T) -> T
    where
        Self: Sized,
    {
        let depth = self.effect_stack().depth();
        self.effect_stack().push(scope);
        let result = body(self);
        self.effect_stack().truncate(depth);
        result
    }
}

impl EffectHost for EffectStack {
    fn effect_stack(&mut self) -> &mut EffectStack {
        self
    }
}
