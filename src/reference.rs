//! The minimal ref seam the trap layer builds on.
//!
//! A `RefSlot` is a single reactive cell with its own dep, wired through the
//! dep-level `track_effect` / `trigger_effects` surface, the same seam any
//! custom wrapper uses. The trap layer's get path unwraps refs by reading
//! them (which tracks), and its set path assigns through an existing ref
//! unless that ref is readonly. The full ref public surface is a collaborator
//! built on top of this, not part of the runtime.

use crate::dep::Dep;
use crate::effect::{track_effect, trigger_effects, DirtyLevel};
use crate::target::Value;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A reactive single-value cell.
pub struct RefSlot {
    value: RwLock<Value>,
    readonly: bool,
    dep: Arc<Dep>,
}

impl RefSlot {
    /// A mutable ref holding `value`.
    pub fn new(value: Value) -> Arc<Self> {
        Arc::new(RefSlot {
            value: RwLock::new(value),
            readonly: false,
            dep: Dep::standalone(),
        })
    }

    /// A readonly ref; writes are rejected.
    pub fn new_readonly(value: Value) -> Arc<Self> {
        Arc::new(RefSlot {
            value: RwLock::new(value),
            readonly: true,
            dep: Dep::standalone(),
        })
    }

    /// Whether writes are rejected.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Read the value, recording a dependency edge for the active effect.
    pub fn get(&self) -> Value {
        track_effect(&self.dep);
        self.value.read().clone()
    }

    /// Read the value without tracking.
    pub fn peek(&self) -> Value {
        self.value.read().clone()
    }

    /// Replace the value, invalidating subscribers if it changed.
    pub fn set(&self, value: Value) {
        if self.readonly {
            if cfg!(debug_assertions) {
                log::warn!("write to readonly ref ignored");
            }
            return;
        }
        let changed = {
            let mut slot = self.value.write();
            if slot.same(&value) {
                false
            } else {
                *slot = value;
                true
            }
        };
        if changed {
            trigger_effects(&self.dep, DirtyLevel::Dirty);
        }
    }

    /// The ref's dep.
    pub fn dep(&self) -> &Arc<Dep> {
        &self.dep
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefSlot")
            .field("readonly", &self.readonly)
            .field("subs", &self.dep.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_skips_trigger_when_unchanged() {
        let r = RefSlot::new(Value::Int(1));
        r.set(Value::Int(1));
        assert_eq!(r.peek(), Value::Int(1));
        r.set(Value::Int(2));
        assert_eq!(r.peek(), Value::Int(2));
    }

    #[test]
    fn readonly_ref_rejects_writes() {
        let r = RefSlot::new_readonly(Value::Int(1));
        r.set(Value::Int(2));
        assert_eq!(r.peek(), Value::Int(1));
    }
}
