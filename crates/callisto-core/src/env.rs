//! Lexically scoped variable bindings.
//!
//! Scope frames live in an arena and are addressed by [`EnvId`] handles.
//! Closures and scheduled threads hold handles rather than owning pointers,
//! so a recursive function whose frame contains the function itself does not
//! form an ownership cycle. Frames that are no longer reachable from any
//! root are reclaimed by [`Environments::collect`]; handles are
//! generational, so a reclaimed handle never aliases a newer frame.

use crate::error::{EvalError, Result};
use crate::symbol::Symbol;
use crate::value::Value;
use std::collections::HashMap;

/// Handle to a scope frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnvId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Frame {
    bindings: HashMap<Symbol, Value>,
    parent: Option<EnvId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    frame: Option<Frame>,
}

/// Arena of scope frames with a permanent global frame.
#[derive(Debug)]
pub struct Environments {
    slots: Vec<Slot>,
    free: Vec<u32>,
    global: EnvId,
    allocated_since_collect: usize,
}

impl Default for Environments {
    fn default() -> Self {
        Self::new()
    }
}

impl Environments {
    pub fn new() -> Self {
        let mut envs = Self {
            slots: Vec::new(),
            free: Vec::new(),
            global: EnvId {
                index: 0,
                generation: 0,
            },
            allocated_since_collect: 0,
        };
        envs.global = envs.alloc(None);
        envs
    }

    /// The top-level frame. It is never reclaimed.
    pub fn global(&self) -> EnvId {
        self.global
    }

    /// Create a frame whose lookups fall back to `parent`.
    pub fn child(&mut self, parent: EnvId) -> EnvId {
        self.alloc(Some(parent))
    }

    /// Bind `name` in exactly this frame.
    pub fn define(&mut self, env: EnvId, name: Symbol, value: Value) -> Result<()> {
        let frame = self
            .frame_mut(env)
            .ok_or_else(|| EvalError::UnboundName(name.to_string()))?;
        if frame.bindings.contains_key(&name) {
            return Err(EvalError::Redefinition(name.to_string()));
        }
        frame.bindings.insert(name, value);
        Ok(())
    }

    /// Look `name` up through the parent chain.
    pub fn get(&self, env: EnvId, name: Symbol) -> Result<Value> {
        let owner = self
            .owner_of(env, name)
            .ok_or_else(|| EvalError::UnboundName(name.to_string()))?;
        self.frame(owner)
            .and_then(|frame| frame.bindings.get(&name))
            .cloned()
            .ok_or_else(|| EvalError::UnboundName(name.to_string()))
    }

    /// Overwrite the binding in the nearest frame that owns `name`.
    ///
    /// Every holder of that frame observes the new value.
    pub fn set(&mut self, env: EnvId, name: Symbol, value: Value) -> Result<()> {
        let owner = self
            .owner_of(env, name)
            .ok_or_else(|| EvalError::UnboundName(name.to_string()))?;
        match self.frame_mut(owner) {
            Some(frame) => {
                frame.bindings.insert(name, value);
                Ok(())
            }
            None => Err(EvalError::UnboundName(name.to_string())),
        }
    }

    /// Whether `env` still refers to a live frame.
    pub fn is_live(&self, env: EnvId) -> bool {
        self.frame(env).is_some()
    }

    pub fn live_frames(&self) -> usize {
        self.slots.iter().filter(|slot| slot.frame.is_some()).count()
    }

    /// Frames allocated since the last [`collect`](Self::collect).
    pub fn allocated_since_collect(&self) -> usize {
        self.allocated_since_collect
    }

    /// Reclaim every frame not reachable from `roots` or the global frame.
    ///
    /// Reachability follows parent links and closures stored in bindings.
    /// Returns the number of frames freed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = EnvId>) -> usize {
        let mut marked = vec![false; self.slots.len()];
        let mut pending: Vec<EnvId> = roots.into_iter().collect();
        pending.push(self.global);

        while let Some(env) = pending.pop() {
            let Some(frame) = self.frame(env) else {
                continue;
            };
            let index = env.index as usize;
            if marked[index] {
                continue;
            }
            marked[index] = true;
            if let Some(parent) = frame.parent {
                pending.push(parent);
            }
            for value in frame.bindings.values() {
                value.trace_envs(&mut pending);
            }
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.frame.is_some() && !marked[index] {
                slot.frame = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                freed += 1;
            }
        }
        self.allocated_since_collect = 0;
        freed
    }

    fn alloc(&mut self, parent: Option<EnvId>) -> EnvId {
        self.allocated_since_collect += 1;
        let frame = Frame {
            bindings: HashMap::new(),
            parent,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.frame = Some(frame);
            return EnvId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            frame: Some(frame),
        });
        EnvId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn frame(&self, env: EnvId) -> Option<&Frame> {
        self.slots
            .get(env.index as usize)
            .filter(|slot| slot.generation == env.generation)
            .and_then(|slot| slot.frame.as_ref())
    }

    fn frame_mut(&mut self, env: EnvId) -> Option<&mut Frame> {
        self.slots
            .get_mut(env.index as usize)
            .filter(|slot| slot.generation == env.generation)
            .and_then(|slot| slot.frame.as_mut())
    }

    fn owner_of(&self, env: EnvId, name: Symbol) -> Option<EnvId> {
        let mut current = Some(env);
        while let Some(id) = current {
            let frame = self.frame(id)?;
            if frame.bindings.contains_key(&name) {
                return Some(id);
            }
            current = frame.parent;
        }
        None
    }
}
