//! Operation kinds, keys, and debug events shared across the runtime.
//!
//! Keys identify locations inside a reactive container. Besides plain string,
//! integer, and symbol keys there are three sentinels: [`Key::Len`] (list
//! length), [`Key::Iterate`] (container iteration), and [`Key::MapKeyIterate`]
//! (map-key iteration). The sentinels are shared by all containers in the
//! process; subscribing to them is how iteration-shaped reads get invalidated
//! by structural mutations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// The kind of read being tracked.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TrackOp {
    /// A keyed value read.
    Get,
    /// A key-presence check.
    Has,
    /// An iteration over keys or entries.
    Iterate,
}

/// The kind of mutation being triggered.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TriggerOp {
    /// An existing key's value changed.
    Set,
    /// A new key appeared.
    Add,
    /// A key was removed.
    Delete,
    /// The whole container was emptied.
    Clear,
}

/// An opaque process-unique symbol key.
///
/// Symbols below the well-known limit are reserved for the host and are never
/// tracked by the trap layer, mirroring how language-builtin symbol reads must
/// not create subscription edges.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Symbol(u32);

/// Symbols with ids below this limit are well-known (never tracked).
const WELL_KNOWN_LIMIT: u32 = 16;

static NEXT_SYMBOL: AtomicU32 = AtomicU32::new(WELL_KNOWN_LIMIT);

impl Symbol {
    /// Allocate a fresh unique symbol.
    pub fn new() -> Self {
        Symbol(NEXT_SYMBOL.fetch_add(1, Ordering::Relaxed))
    }

    /// A well-known symbol. `n` must be below the reserved limit.
    pub const fn well_known(n: u32) -> Self {
        assert!(n < WELL_KNOWN_LIMIT);
        Symbol(n)
    }

    /// Whether this symbol is in the well-known (never tracked) range.
    pub fn is_well_known(self) -> bool {
        self.0 < WELL_KNOWN_LIMIT
    }
}

impl Default for Symbol {
    fn default() -> Self {
        Self::new()
    }
}

/// A location inside a reactive container.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Key {
    /// A string key (plain objects and maps).
    Str(Arc<str>),
    /// An integer index (lists).
    Index(usize),
    /// A symbol key.
    Sym(Symbol),
    /// The list length pseudo-key.
    Len,
    /// Sentinel subscribed by container iteration.
    Iterate,
    /// Sentinel subscribed by map-key iteration.
    MapKeyIterate,
}

impl Key {
    /// A string key.
    pub fn str(s: &str) -> Self {
        Key::Str(Arc::from(s))
    }

    /// True for `Key::Index`.
    pub fn is_index(&self) -> bool {
        matches!(self, Key::Index(_))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::str(s)
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

impl From<Symbol> for Key {
    fn from(s: Symbol) -> Self {
        Key::Sym(s)
    }
}

/// What a debug hook is being told about.
#[derive(Copy, Clone, Debug)]
pub enum DebugEventKind {
    /// A dependency edge was recorded.
    Track(TrackOp),
    /// A dep fired.
    Trigger(TriggerOp),
}

/// Payload handed to the `on_track` / `on_trigger` debug hooks.
///
/// Hooks are only invoked in development builds (`debug_assertions`).
#[derive(Clone, Debug)]
pub struct DebuggerEvent {
    /// Track or trigger, with the operation kind.
    pub kind: DebugEventKind,
    /// The key involved, when the event originated from a keyed operation.
    pub key: Option<Key>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_symbols_are_unique_and_trackable() {
        let a = Symbol::new();
        let b = Symbol::new();
        assert_ne!(a, b);
        assert!(!a.is_well_known());
    }

    #[test]
    fn well_known_symbols_are_flagged() {
        assert!(Symbol::well_known(0).is_well_known());
        assert!(Symbol::well_known(15).is_well_known());
    }

    #[test]
    fn key_conversions() {
        assert_eq!(Key::from("a"), Key::str("a"));
        assert_eq!(Key::from(3usize), Key::Index(3));
        assert!(Key::Index(0).is_index());
        assert!(!Key::Len.is_index());
    }
}
