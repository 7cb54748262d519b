//! Reactive targets and the `track` / `trigger` entry points.
//!
//! A [`Target`] is one reactive container allocation: its data (`Store`) plus
//! its own `key → Dep` map. The per-target dep map is level two of the
//! conceptual `target → key → Dep` registry; level one is the allocation
//! itself, so dep storage is reclaimed exactly when the last handle to the
//! target goes away without any weak-keyed global table.
//!
//! `trigger` translates one mutation into the set of deps it invalidates
//! (structural mutations also hit the iteration sentinels, list length
//! changes hit truncated indices) and fires them inside a scheduling pause so
//! a whole batch produces at most one scheduler enqueue per effect.

use crate::dep::Dep;
use crate::effect::{link_effect, trigger_effects_with, DirtyLevel};
use crate::hash::FixedHashBuilder;
use crate::ops::{DebugEventKind, DebuggerEvent, Key, TrackOp, TriggerOp};
use crate::reference::RefSlot;
use indexmap::IndexMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

use crate::tracking;

type KeyMap<V> = IndexMap<Key, V, FixedHashBuilder>;

/// The data of a reactive container.
#[derive(Debug)]
pub enum Store {
    /// An integer-indexed list.
    List(Vec<Value>),
    /// A plain keyed object.
    Record(KeyMap<Value>),
    /// A map-like container: structurally identical to `Record`, but value
    /// writes also invalidate iteration (the `SET on map-like` trigger row).
    Map(KeyMap<Value>),
}

impl Store {
    /// Whether this is the list variant.
    pub fn is_list(&self) -> bool {
        matches!(self, Store::List(_))
    }

    /// Whether this is the map-like variant.
    pub fn is_map(&self) -> bool {
        matches!(self, Store::Map(_))
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::Record(KeyMap::default())
    }
}

/// One reactive container allocation: data plus its dep map.
pub struct Target {
    store: RwLock<Store>,
    deps: RwLock<KeyMap<Arc<Dep>>>,
}

/// Shared handle to a [`Target`].
pub type TargetRef = Arc<Target>;

impl Target {
    /// Allocate a target around a store.
    pub fn new(store: Store) -> TargetRef {
        Arc::new(Target {
            store: RwLock::new(store),
            deps: RwLock::new(KeyMap::default()),
        })
    }

    /// Allocate a list target.
    pub fn list(items: Vec<Value>) -> TargetRef {
        Self::new(Store::List(items))
    }

    /// Allocate a plain-object target.
    pub fn record(entries: impl IntoIterator<Item = (Key, Value)>) -> TargetRef {
        Self::new(Store::Record(entries.into_iter().collect()))
    }

    /// Allocate a map-like target.
    pub fn map(entries: impl IntoIterator<Item = (Key, Value)>) -> TargetRef {
        Self::new(Store::Map(entries.into_iter().collect()))
    }

    /// Whether the target holds a list.
    pub fn is_list(&self) -> bool {
        self.store.read().is_list()
    }

    /// Whether the target holds a map-like container.
    pub fn is_map(&self) -> bool {
        self.store.read().is_map()
    }

    /// Read the raw store without tracking.
    pub fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.store.read())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write()
    }

    #[cfg(test)]
    pub(crate) fn dep_count(&self) -> usize {
        self.deps.read().len()
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.store.read();
        let (kind, len) = match &*store {
            Store::List(items) => ("List", items.len()),
            Store::Record(map) => ("Record", map.len()),
            Store::Map(map) => ("Map", map.len()),
        };
        f.debug_struct("Target")
            .field("kind", &kind)
            .field("len", &len)
            .finish()
    }
}

/// How a stored object value is viewed when read back out.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ViewKind {
    /// Mutations through the view are rejected.
    pub readonly: bool,
    /// Nested values are returned as-is instead of wrapped.
    pub shallow: bool,
}

/// A handle to a target carried inside a [`Value`].
///
/// `view: None` is the raw target; a view marks the value as a reactive or
/// readonly wrapper, which deep-mode writes strip back to raw before storing.
#[derive(Clone)]
pub struct ObjRef {
    target: TargetRef,
    view: Option<ViewKind>,
}

impl ObjRef {
    pub(crate) fn new(target: TargetRef, view: Option<ViewKind>) -> Self {
        ObjRef { target, view }
    }

    /// The underlying target.
    pub fn target(&self) -> &TargetRef {
        &self.target
    }

    /// The wrapper view, if this value is wrapped.
    pub fn view(&self) -> Option<ViewKind> {
        self.view
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjRef")
            .field("target", &self.target)
            .field("view", &self.view)
            .finish()
    }
}

/// A dynamically typed value stored in a reactive container.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// The absent / empty value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A float. Identity comparison is bitwise, so `NaN` equals itself.
    Float(f64),
    /// An immutable string.
    Str(Arc<str>),
    /// A handle to another container, raw or wrapped.
    Obj(ObjRef),
    /// A ref cell with its own dep.
    Ref(Arc<RefSlot>),
}

impl Value {
    /// A string value.
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    /// A raw handle to a target.
    pub fn object(target: &TargetRef) -> Value {
        Value::Obj(ObjRef::new(target.clone(), None))
    }

    /// The integer payload, if any.
    pub fn int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// True for `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for `Value::Ref`.
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref(_))
    }

    /// The object handle, if this value is one.
    pub fn as_obj(&self) -> Option<&ObjRef> {
        match self {
            Value::Obj(o) => Some(o),
            _ => None,
        }
    }

    /// Identity comparison with the semantics of change detection: floats
    /// compare bitwise, containers and refs by pointer.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => {
                Arc::ptr_eq(&a.target, &b.target) && a.view == b.view
            }
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Strip any wrapper view, leaving the raw value.
    pub fn to_raw(self) -> Value {
        match self {
            Value::Obj(o) => Value::Obj(ObjRef::new(o.target, None)),
            other => other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

/// Record a dependency edge from the active effect to `(target, key)`.
///
/// No-op unless tracking is enabled and an effect is running. The dep for
/// `key` is created on first subscription; its cleanup unregisters it from
/// the target's key map once the subscriber set empties.
pub fn track(target: &TargetRef, op: TrackOp, key: Key) {
    if !tracking::should_track() {
        return;
    }
    let Some(effect) = tracking::active_effect() else {
        return;
    };
    let dep = lookup_or_create_dep(target, &key);
    link_effect(effect, &dep, op, Some(&key));
}

fn lookup_or_create_dep(target: &TargetRef, key: &Key) -> Arc<Dep> {
    if let Some(dep) = target.deps.read().get(key) {
        return dep.clone();
    }
    let mut deps = target.deps.write();
    if let Some(dep) = deps.get(key) {
        return dep.clone();
    }
    let weak = Arc::downgrade(target);
    let cleanup_key = key.clone();
    let dep = Dep::new(move || {
        if let Some(target) = weak.upgrade() {
            target.deps.write().swap_remove(&cleanup_key);
        }
    });
    deps.insert(key.clone(), dep.clone());
    dep
}

/// The dep currently registered for `(target, key)`, if any.
pub fn get_dep_from_reactive(target: &TargetRef, key: &Key) -> Option<Arc<Dep>> {
    target.deps.read().get(key).cloned()
}

/// Invalidate everything affected by one mutation.
pub fn trigger(
    target: &TargetRef,
    op: TriggerOp,
    key: Option<Key>,
    new_value: Option<&Value>,
    old_value: Option<&Value>,
) {
    let _ = old_value;
    let mut to_fire: SmallVec<[Arc<Dep>; 4]> = SmallVec::new();
    {
        let deps = target.deps.read();
        if deps.is_empty() {
            // Never tracked.
            return;
        }
        let is_list = target.is_list();
        match op {
            TriggerOp::Clear => to_fire.extend(deps.values().cloned()),
            TriggerOp::Set if is_list && matches!(key, Some(Key::Len)) => {
                let new_len = new_value.and_then(Value::int).unwrap_or(0).max(0) as usize;
                for (k, dep) in deps.iter() {
                    match k {
                        Key::Len => to_fire.push(dep.clone()),
                        Key::Index(i) if *i >= new_len => to_fire.push(dep.clone()),
                        _ => {}
                    }
                }
            }
            _ => {
                if let Some(k) = &key {
                    if let Some(dep) = deps.get(k) {
                        to_fire.push(dep.clone());
                    }
                }
                match op {
                    TriggerOp::Add => {
                        if !is_list {
                            push_dep(&deps, &mut to_fire, &Key::Iterate);
                            if target.is_map() {
                                push_dep(&deps, &mut to_fire, &Key::MapKeyIterate);
                            }
                        } else if matches!(key, Some(Key::Index(_))) {
                            push_dep(&deps, &mut to_fire, &Key::Len);
                        }
                    }
                    TriggerOp::Delete => {
                        if !is_list {
                            push_dep(&deps, &mut to_fire, &Key::Iterate);
                            if target.is_map() {
                                push_dep(&deps, &mut to_fire, &Key::MapKeyIterate);
                            }
                        }
                    }
                    TriggerOp::Set => {
                        if target.is_map() {
                            push_dep(&deps, &mut to_fire, &Key::Iterate);
                        }
                    }
                    TriggerOp::Clear => unreachable!(),
                }
            }
        }
    }
    if to_fire.is_empty() {
        return;
    }
    let debug = if cfg!(debug_assertions) {
        Some(DebuggerEvent {
            kind: DebugEventKind::Trigger(op),
            key,
        })
    } else {
        None
    };
    tracking::pause_scheduling();
    for dep in &to_fire {
        trigger_effects_with(dep, DirtyLevel::Dirty, debug.as_ref());
    }
    tracking::reset_scheduling();
}

fn push_dep(deps: &KeyMap<Arc<Dep>>, out: &mut SmallVec<[Arc<Dep>; 4]>, key: &Key) {
    if let Some(dep) = deps.get(key) {
        out.push(dep.clone());
    }
}
