//! The trap layer: reactive views over container targets.
//!
//! A [`Reactive`] handle pairs a target with a `(readonly, shallow)`
//! configuration; the four variants share one method table instead of four
//! types. Every read forwards to `track`, every write to `trigger`, with the
//! list and map specializations the dependency rules require:
//!
//! - identity-sensitive list searches track every index before searching, and
//!   retry with the raw-unwrapped needle on a miss;
//! - length-mutating list methods run under paired tracking and scheduling
//!   pauses, so their internal bookkeeping reads add no edges and the whole
//!   mutation batches into one scheduler pass;
//! - readonly views reject writes (logged in dev builds) and never track.
//!
//! Deep (non-shallow) reads unwrap refs and hand nested objects back wrapped
//! in the same configuration, so reactivity follows the data. Deep writes
//! strip wrappers from incoming values and write through existing refs.

use crate::ops::{Key, TrackOp, TriggerOp};
use crate::target::{track, trigger, ObjRef, Store, TargetRef, Value, ViewKind};
use crate::tracking;

/// A reactive view over a [`Target`].
#[derive(Clone)]
pub struct Reactive {
    target: TargetRef,
    readonly: bool,
    shallow: bool,
}

/// A deep mutable view.
pub fn reactive(target: TargetRef) -> Reactive {
    Reactive {
        target,
        readonly: false,
        shallow: false,
    }
}

/// A mutable view that does not wrap nested values.
pub fn shallow_reactive(target: TargetRef) -> Reactive {
    Reactive {
        target,
        readonly: false,
        shallow: true,
    }
}

/// A deep readonly view.
pub fn readonly(target: TargetRef) -> Reactive {
    Reactive {
        target,
        readonly: true,
        shallow: false,
    }
}

/// A readonly view that does not wrap nested values.
pub fn shallow_readonly(target: TargetRef) -> Reactive {
    Reactive {
        target,
        readonly: true,
        shallow: true,
    }
}

fn warn_rejected(op: &str) {
    if cfg!(debug_assertions) {
        log::warn!("{op} on a readonly view ignored");
    }
}

fn warn_not_list(op: &str) {
    if cfg!(debug_assertions) {
        log::warn!("{op} called on a non-list target");
    }
}

/// Paired tracking/scheduling pause for length-mutating list methods.
struct PausePair;

impl PausePair {
    fn new() -> Self {
        tracking::pause_tracking();
        tracking::pause_scheduling();
        PausePair
    }
}

impl Drop for PausePair {
    fn drop(&mut self) {
        tracking::reset_scheduling();
        tracking::reset_tracking();
    }
}

impl Reactive {
    /// Whether this view can mutate the target.
    pub fn is_reactive(&self) -> bool {
        !self.readonly
    }

    /// Whether this view rejects mutations.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Whether nested values are returned as-is.
    pub fn is_shallow(&self) -> bool {
        self.shallow
    }

    /// The raw target behind the view.
    pub fn raw(&self) -> TargetRef {
        self.target.clone()
    }

    /// Borrow the target handle.
    pub fn target(&self) -> &TargetRef {
        &self.target
    }

    /// This view as a storable value.
    pub fn to_value(&self) -> Value {
        Value::Obj(ObjRef::new(
            self.target.clone(),
            Some(ViewKind {
                readonly: self.readonly,
                shallow: self.shallow,
            }),
        ))
    }

    fn raw_len(&self) -> usize {
        match &*self.target.read() {
            Store::List(items) => items.len(),
            Store::Record(map) | Store::Map(map) => map.len(),
        }
    }

    fn read_raw(&self, key: &Key) -> Value {
        match &*self.target.read() {
            Store::List(items) => match key {
                Key::Index(i) => items.get(*i).cloned().unwrap_or(Value::Null),
                Key::Len => Value::Int(items.len() as i64),
                _ => Value::Null,
            },
            Store::Record(map) | Store::Map(map) => {
                map.get(key).cloned().unwrap_or(Value::Null)
            }
        }
    }

    /// Unwrap refs and wrap nested objects per the view configuration.
    fn convert_out(&self, value: Value, list_index: bool) -> Value {
        if self.shallow {
            return value;
        }
        match value {
            // Integer slots of a list hand refs back as-is; everywhere else
            // a ref read unwraps (and tracks the ref's own dep).
            Value::Ref(r) => {
                if list_index {
                    Value::Ref(r)
                } else {
                    r.get()
                }
            }
            Value::Obj(o) => Value::Obj(ObjRef::new(
                o.target().clone(),
                Some(ViewKind {
                    readonly: self.readonly,
                    shallow: false,
                }),
            )),
            other => other,
        }
    }

    /// Read a key, tracking a `GET` access.
    pub fn get(&self, key: &Key) -> Value {
        if let Key::Sym(s) = key {
            if s.is_well_known() {
                return self.read_raw(key);
            }
        }
        if !self.readonly {
            track(&self.target, TrackOp::Get, key.clone());
        }
        let res = self.read_raw(key);
        let list_index = key.is_index() && self.target.is_list();
        self.convert_out(res, list_index)
    }

    /// Read a nested object as a handle in this view's configuration.
    pub fn get_object(&self, key: &Key) -> Option<Reactive> {
        match self.get(key) {
            Value::Obj(o) => o.handle().or_else(|| {
                // Shallow views return raw objects.
                Some(Reactive {
                    target: o.target().clone(),
                    readonly: self.readonly,
                    shallow: false,
                })
            }),
            _ => None,
        }
    }

    /// Write a key, triggering `ADD` or `SET` as appropriate.
    pub fn set(&self, key: Key, value: Value) {
        if self.readonly {
            warn_rejected("set");
            return;
        }
        if self.target.is_list() {
            match key {
                Key::Len => {
                    if let Some(n) = value.int() {
                        self.set_len(n.max(0) as usize);
                    }
                    return;
                }
                Key::Index(_) => {}
                _ => {
                    warn_not_list("keyed set");
                    return;
                }
            }
        }

        let mut value = value;
        let old = self.read_raw(&key);
        if !self.shallow {
            value = value.to_raw();
            if !self.target.is_list() {
                if let Value::Ref(old_ref) = &old {
                    if !value.is_ref() {
                        if old_ref.is_readonly() {
                            // Silent rejection: the slot keeps its readonly ref.
                            return;
                        }
                        old_ref.set(value);
                        return;
                    }
                }
            }
        }

        let had_key = {
            let mut store = self.target.write();
            match &mut *store {
                Store::List(items) => {
                    let i = match &key {
                        Key::Index(i) => *i,
                        _ => unreachable!(),
                    };
                    let had = i < items.len();
                    if !had {
                        items.resize(i + 1, Value::Null);
                    }
                    items[i] = value.clone();
                    had
                }
                Store::Record(map) | Store::Map(map) => {
                    map.insert(key.clone(), value.clone()).is_some()
                }
            }
        };
        if !had_key {
            trigger(&self.target, TriggerOp::Add, Some(key), Some(&value), None);
        } else if !value.same(&old) {
            trigger(&self.target, TriggerOp::Set, Some(key), Some(&value), Some(&old));
        }
    }

    /// Remove a key, triggering `DELETE` if it was present.
    pub fn delete(&self, key: &Key) -> bool {
        if self.readonly {
            warn_rejected("delete");
            return false;
        }
        let removed = {
            let mut store = self.target.write();
            match &mut *store {
                Store::List(items) => match key {
                    Key::Index(i) if *i < items.len() => {
                        let old = std::mem::replace(&mut items[*i], Value::Null);
                        if old.is_null() {
                            None
                        } else {
                            Some(old)
                        }
                    }
                    _ => None,
                },
                Store::Record(map) | Store::Map(map) => map.shift_remove(key),
            }
        };
        match removed {
            Some(old) => {
                trigger(&self.target, TriggerOp::Delete, Some(key.clone()), None, Some(&old));
                true
            }
            None => false,
        }
    }

    /// Check key presence, tracking a `HAS` access.
    pub fn has(&self, key: &Key) -> bool {
        let present = match &*self.target.read() {
            Store::List(items) => match key {
                Key::Index(i) => *i < items.len(),
                Key::Len => true,
                _ => false,
            },
            Store::Record(map) | Store::Map(map) => map.contains_key(key),
        };
        let well_known = matches!(key, Key::Sym(s) if s.is_well_known());
        if !self.readonly && !well_known {
            track(&self.target, TrackOp::Has, key.clone());
        }
        present
    }

    /// Own-key check; tracks a `HAS` access like [`Reactive::has`].
    pub fn has_own(&self, key: &Key) -> bool {
        self.has(key)
    }

    /// Enumerate keys, tracking an `ITERATE` access.
    ///
    /// Lists subscribe to the length, plain objects to the iteration
    /// sentinel, and maps to the map-key sentinel (value-only `SET`s on a
    /// map must not invalidate key iteration).
    pub fn keys(&self) -> Vec<Key> {
        let (keys, track_key) = match &*self.target.read() {
            Store::List(items) => ((0..items.len()).map(Key::Index).collect(), Key::Len),
            Store::Record(map) => (map.keys().cloned().collect::<Vec<_>>(), Key::Iterate),
            Store::Map(map) => (map.keys().cloned().collect::<Vec<_>>(), Key::MapKeyIterate),
        };
        if !self.readonly {
            track(&self.target, TrackOp::Iterate, track_key);
        }
        keys
    }

    /// Enumerate values, tracking an `ITERATE` access.
    pub fn values(&self) -> Vec<Value> {
        let (raw, track_key, list): (Vec<Value>, Key, bool) = match &*self.target.read() {
            Store::List(items) => (items.clone(), Key::Len, true),
            Store::Record(map) => (map.values().cloned().collect(), Key::Iterate, false),
            Store::Map(map) => (map.values().cloned().collect(), Key::Iterate, false),
        };
        if !self.readonly {
            track(&self.target, TrackOp::Iterate, track_key);
        }
        raw.into_iter().map(|v| self.convert_out(v, list)).collect()
    }

    /// Enumerate entries, tracking an `ITERATE` access.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        let (raw, track_key, list): (Vec<(Key, Value)>, Key, bool) = match &*self.target.read() {
            Store::List(items) => (
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (Key::Index(i), v.clone()))
                    .collect(),
                Key::Len,
                true,
            ),
            Store::Record(map) => (
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                Key::Iterate,
                false,
            ),
            Store::Map(map) => (
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                Key::Iterate,
                false,
            ),
        };
        if !self.readonly {
            track(&self.target, TrackOp::Iterate, track_key);
        }
        raw.into_iter()
            .map(|(k, v)| {
                let converted = self.convert_out(v, list);
                (k, converted)
            })
            .collect()
    }

    /// Element or entry count. Lists track the length key, keyed containers
    /// the iteration sentinel.
    pub fn len(&self) -> usize {
        let n = self.raw_len();
        if !self.readonly {
            if self.target.is_list() {
                track(&self.target, TrackOp::Get, Key::Len);
            } else {
                track(&self.target, TrackOp::Iterate, Key::Iterate);
            }
        }
        n
    }

    /// Whether the container is empty; tracks like [`Reactive::len`].
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the container, triggering `CLEAR` (which fires every dep of the
    /// target).
    pub fn clear(&self) {
        if self.readonly {
            warn_rejected("clear");
            return;
        }
        let had_entries = {
            let mut store = self.target.write();
            match &mut *store {
                Store::List(items) => {
                    let had = !items.is_empty();
                    items.clear();
                    had
                }
                Store::Record(map) | Store::Map(map) => {
                    let had = !map.is_empty();
                    map.clear();
                    had
                }
            }
        };
        if had_entries {
            trigger(&self.target, TriggerOp::Clear, None, None, None);
        }
    }

    // List instrumentation.

    /// Resize the list, firing the length-set trigger (which invalidates the
    /// length dep and every index at or past the new length).
    pub fn set_len(&self, new_len: usize) {
        if self.readonly {
            warn_rejected("set_len");
            return;
        }
        let old_len = {
            let mut store = self.target.write();
            match &mut *store {
                Store::List(items) => {
                    let old = items.len();
                    items.resize(new_len, Value::Null);
                    Some(old)
                }
                _ => None,
            }
        };
        let Some(old_len) = old_len else {
            warn_not_list("set_len");
            return;
        };
        if old_len != new_len {
            trigger(
                &self.target,
                TriggerOp::Set,
                Some(Key::Len),
                Some(&Value::Int(new_len as i64)),
                Some(&Value::Int(old_len as i64)),
            );
        }
    }

    /// Append, returning the new length.
    pub fn push(&self, value: Value) -> usize {
        if self.readonly {
            warn_rejected("push");
            return self.raw_len();
        }
        let value = if self.shallow { value } else { value.to_raw() };
        let _pause = PausePair::new();
        let appended = {
            let mut store = self.target.write();
            match &mut *store {
                Store::List(items) => {
                    items.push(value.clone());
                    Some((items.len() - 1, items.len()))
                }
                _ => None,
            }
        };
        let Some((index, len)) = appended else {
            warn_not_list("push");
            return self.raw_len();
        };
        trigger(&self.target, TriggerOp::Add, Some(Key::Index(index)), Some(&value), None);
        len
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Option<Value> {
        if self.readonly {
            warn_rejected("pop");
            return None;
        }
        let _pause = PausePair::new();
        let popped = {
            let mut store = self.target.write();
            match &mut *store {
                Store::List(items) => {
                    let old_len = items.len();
                    items.pop().map(|v| (v, old_len))
                }
                _ => None,
            }
        };
        let (value, old_len) = popped?;
        let new_len = old_len - 1;
        trigger(&self.target, TriggerOp::Delete, Some(Key::Index(new_len)), None, Some(&value));
        trigger(
            &self.target,
            TriggerOp::Set,
            Some(Key::Len),
            Some(&Value::Int(new_len as i64)),
            Some(&Value::Int(old_len as i64)),
        );
        Some(value)
    }

    /// Remove and return the first element.
    pub fn shift(&self) -> Option<Value> {
        self.mutate_list("shift", |items| {
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        })
        .flatten()
    }

    /// Prepend, returning the new length.
    pub fn unshift(&self, value: Value) -> usize {
        let value = if self.shallow { value } else { value.to_raw() };
        self.mutate_list("unshift", move |items| {
            items.insert(0, value);
            items.len()
        })
        .unwrap_or_else(|| self.raw_len())
    }

    /// Remove `delete_count` elements at `start`, inserting `items` in their
    /// place; returns the removed elements.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<Value>) -> Vec<Value> {
        let items: Vec<Value> = if self.shallow {
            items
        } else {
            items.into_iter().map(Value::to_raw).collect()
        };
        self.mutate_list("splice", move |list| {
            let start = start.min(list.len());
            let end = (start + delete_count).min(list.len());
            list.splice(start..end, items).collect::<Vec<Value>>()
        })
        .unwrap_or_default()
    }

    /// Apply a list edit under the pause pair, then fire triggers for every
    /// index whose value actually changed plus the length change.
    fn mutate_list<R>(&self, op: &str, edit: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        if self.readonly {
            warn_rejected(op);
            return None;
        }
        let _pause = PausePair::new();
        let edited = {
            let mut store = self.target.write();
            match &mut *store {
                Store::List(items) => {
                    let before = items.clone();
                    let result = edit(items);
                    Some((result, before, items.clone()))
                }
                _ => None,
            }
        };
        let Some((result, before, after)) = edited else {
            warn_not_list(op);
            return None;
        };
        self.resync_list(&before, &after);
        Some(result)
    }

    fn resync_list(&self, before: &[Value], after: &[Value]) {
        let common = before.len().min(after.len());
        for i in 0..common {
            if !before[i].same(&after[i]) {
                trigger(
                    &self.target,
                    TriggerOp::Set,
                    Some(Key::Index(i)),
                    Some(&after[i]),
                    Some(&before[i]),
                );
            }
        }
        for (i, value) in after.iter().enumerate().skip(before.len()) {
            trigger(&self.target, TriggerOp::Add, Some(Key::Index(i)), Some(value), None);
        }
        for (i, value) in before.iter().enumerate().skip(after.len()) {
            trigger(&self.target, TriggerOp::Delete, Some(Key::Index(i)), None, Some(value));
        }
        if before.len() != after.len() {
            trigger(
                &self.target,
                TriggerOp::Set,
                Some(Key::Len),
                Some(&Value::Int(after.len() as i64)),
                Some(&Value::Int(before.len() as i64)),
            );
        }
    }

    // Identity-sensitive searches.

    /// First index holding `value`. Tracks every index, searches with the
    /// needle as given, and retries with its raw form on a miss.
    pub fn index_of(&self, value: &Value) -> Option<usize> {
        let items: Vec<Value> = match &*self.target.read() {
            Store::List(items) => items.clone(),
            _ => return None,
        };
        if !self.readonly {
            for i in 0..items.len() {
                track(&self.target, TrackOp::Get, Key::Index(i));
            }
        }
        let found = items.iter().position(|v| v.same(value));
        if found.is_none() {
            cov_mark::hit!(identity_search_raw_fallback);
            let raw = value.clone().to_raw();
            return items.iter().position(|v| v.same(&raw));
        }
        found
    }

    /// Last index holding `value`; same tracking and fallback as
    /// [`Reactive::index_of`].
    pub fn last_index_of(&self, value: &Value) -> Option<usize> {
        let items: Vec<Value> = match &*self.target.read() {
            Store::List(items) => items.clone(),
            _ => return None,
        };
        if !self.readonly {
            for i in 0..items.len() {
                track(&self.target, TrackOp::Get, Key::Index(i));
            }
        }
        let found = items.iter().rposition(|v| v.same(value));
        if found.is_none() {
            let raw = value.clone().to_raw();
            return items.iter().rposition(|v| v.same(&raw));
        }
        found
    }

    /// Whether the list contains `value`; same tracking and fallback as
    /// [`Reactive::index_of`].
    pub fn contains(&self, value: &Value) -> bool {
        self.index_of(value).is_some()
    }
}

impl ObjRef {
    /// Rebuild the trap handle for a wrapped object value. Returns `None`
    /// for raw (unwrapped) values.
    pub fn handle(&self) -> Option<Reactive> {
        self.view().map(|view| Reactive {
            target: self.target().clone(),
            readonly: view.readonly,
            shallow: view.shallow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::RefSlot;
    use crate::target::Target;

    #[test]
    fn readonly_view_rejects_and_preserves() {
        let w = readonly(Target::record([(Key::str("a"), Value::Int(1))]));
        w.set(Key::str("a"), Value::Int(2));
        assert!(!w.delete(&Key::str("a")));
        assert_eq!(w.get(&Key::str("a")), Value::Int(1));
    }

    #[test]
    fn deep_get_unwraps_refs() {
        let r = RefSlot::new(Value::Int(5));
        let w = reactive(Target::record([(Key::str("r"), Value::Ref(r.clone()))]));
        assert_eq!(w.get(&Key::str("r")), Value::Int(5));

        let shallow = shallow_reactive(w.raw());
        assert!(shallow.get(&Key::str("r")).is_ref());
    }

    #[test]
    fn list_integer_slots_keep_refs_wrapped() {
        let r = RefSlot::new(Value::Int(5));
        let w = reactive(Target::list(vec![Value::Ref(r)]));
        assert!(w.get(&Key::Index(0)).is_ref());
    }

    #[test]
    fn set_through_existing_ref_writes_the_ref() {
        let r = RefSlot::new(Value::Int(1));
        let w = reactive(Target::record([(Key::str("r"), Value::Ref(r.clone()))]));
        w.set(Key::str("r"), Value::Int(9));
        assert_eq!(r.peek(), Value::Int(9));
        // The slot still holds the ref.
        assert!(w.raw().with_store(|s| match s {
            Store::Record(map) => map.get(&Key::str("r")).unwrap().is_ref(),
            _ => false,
        }));
    }

    #[test]
    fn set_through_readonly_ref_is_silently_rejected() {
        let r = RefSlot::new_readonly(Value::Int(1));
        let w = reactive(Target::record([(Key::str("r"), Value::Ref(r.clone()))]));
        w.set(Key::str("r"), Value::Int(9));
        assert_eq!(r.peek(), Value::Int(1));
    }

    #[test]
    fn deep_get_wraps_nested_objects() {
        let inner = Target::record([(Key::str("x"), Value::Int(1))]);
        let outer = reactive(Target::record([(Key::str("inner"), Value::object(&inner))]));
        let nested = outer.get_object(&Key::str("inner")).unwrap();
        assert!(nested.is_reactive());
        assert_eq!(nested.get(&Key::str("x")), Value::Int(1));

        let ro = readonly(outer.raw());
        let nested_ro = ro.get_object(&Key::str("inner")).unwrap();
        assert!(nested_ro.is_readonly());
    }

    #[test]
    fn deep_set_strips_wrapper_views() {
        let inner = reactive(Target::record([]));
        let outer = reactive(Target::record([]));
        outer.set(Key::str("inner"), inner.to_value());
        outer.raw().with_store(|s| match s {
            Store::Record(map) => {
                let stored = map.get(&Key::str("inner")).unwrap();
                assert!(stored.as_obj().unwrap().view().is_none());
            }
            _ => panic!("expected record"),
        });
    }

    #[test]
    fn index_of_falls_back_to_raw_needle() {
        let elem = Target::record([]);
        let w = reactive(Target::list(vec![Value::object(&elem)]));
        let wrapped = reactive(elem).to_value();
        assert_eq!(w.index_of(&wrapped), Some(0));
        assert!(w.contains(&wrapped));
        assert_eq!(w.last_index_of(&wrapped), Some(0));
    }

    #[test]
    fn splice_reports_removed_elements() {
        let w = reactive(Target::list(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
        ]));
        let removed = w.splice(1, 1, vec![Value::Int(9), Value::Int(10)]);
        assert_eq!(removed, vec![Value::Int(2)]);
        assert_eq!(
            w.values(),
            vec![Value::Int(1), Value::Int(9), Value::Int(10), Value::Int(3)]
        );
    }

    #[test]
    fn shift_and_unshift_move_elements() {
        let w = reactive(Target::list(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(w.shift(), Some(Value::Int(1)));
        assert_eq!(w.unshift(Value::Int(0)), 2);
        assert_eq!(w.values(), vec![Value::Int(0), Value::Int(2)]);
    }
}
