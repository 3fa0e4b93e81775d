//! Shared core for the tern boundary runtime.
//!
//! Everything identity-bearing that crosses the interop boundary lives in a
//! [`HandleTable`]: a slot arena keyed by generation-tagged integer handles,
//! with explicit reference counting and transitive release of owned handles.
//! The growable sequence container behind the `_seq_*` surface is implemented
//! once here as [`Seq`] and instantiated per element type by the boundary
//! crates. Kept dependency-free so every boundary crate can link it.

// -------------------------
// Error taxonomy (ABI v1)
// -------------------------

/// Wire code for a handle that was never issued or is already released.
pub const ABI_ERR_BAD_HANDLE: i32 = 71_001;
/// Wire code for a sequence index outside `[0, len)`.
pub const ABI_ERR_INDEX_RANGE: i32 = 71_002;

/// Trap code for internal invariant failures (allocator misbehavior, table
/// exhaustion). Not part of the boundary error contract.
pub const TERN_TRAP_ABI_INTERNAL: i32 = 9_700;

/// The only failures a boundary entry point may surface.
///
/// Using a dead handle is a programming-contract violation on the caller's
/// side, not a recoverable condition; index errors are ordinary bounds
/// failures. Entry points validate before mutating, so a failed call leaves
/// table state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiError {
    InvalidHandle,
    IndexOutOfRange,
}

impl AbiError {
    pub fn wire_code(self) -> i32 {
        match self {
            AbiError::InvalidHandle => ABI_ERR_BAD_HANDLE,
            AbiError::IndexOutOfRange => ABI_ERR_INDEX_RANGE,
        }
    }
}

// -------------------------
// Env plumbing
// -------------------------

pub fn env_u32_nonzero(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|&v| v != 0)
        .unwrap_or(default)
}

// -------------------------
// Handles
// -------------------------

/// Opaque boundary handle: a positive `i64` packing a 1-based slot index in
/// the low 32 bits and the slot's generation in the high bits. `0` and
/// negative values are never issued, so the calling side can use `0` as its
/// own nil sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(i64);

impl Handle {
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Decodes a wire value. Rejects only the values no table ever issues;
    /// liveness is checked at resolve time.
    pub fn from_i64(raw: i64) -> Option<Handle> {
        if raw <= 0 {
            None
        } else {
            Some(Handle(raw))
        }
    }

    fn pack(slot: u32, generation: u32) -> Handle {
        Handle((i64::from(generation) << 32) | i64::from(slot))
    }

    fn slot(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    fn generation(self) -> u32 {
        ((self.0 as u64) >> 32) as u32
    }
}

// -------------------------
// Handle table
// -------------------------

/// Implemented by heap payloads stored in a [`HandleTable`].
///
/// `owned_handles` lists handles the payload solely owns; each is released
/// exactly once, recursively, when the payload is destroyed.
pub trait Payload {
    fn owned_handles(&self) -> Vec<Handle> {
        Vec::new()
    }
}

#[derive(Debug)]
struct Entry<P> {
    value: P,
    refcount: u32,
}

#[derive(Debug)]
struct Slot<P> {
    generation: u32,
    entry: Option<Entry<P>>,
}

// Generations stay below this bound so packed handles remain positive i64.
// A slot whose generation reaches the bound is retired rather than reused.
const GENERATION_RETIRE: u32 = i32::MAX as u32;

/// Process-wide registry mapping opaque handles to refcounted heap payloads.
///
/// Freed slots re-enter a free list with a bumped generation, so a stale
/// handle can never resolve to a later resident of the same slot. The table
/// itself is not synchronized; boundary crates wrap it in a `Mutex` static.
#[derive(Debug)]
pub struct HandleTable<P: Payload> {
    slots: Vec<Slot<P>>,
    free: Vec<u32>,
    live: usize,
}

impl<P: Payload> HandleTable<P> {
    pub fn new() -> Self {
        HandleTable {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Number of live entries, for embedder resource policies.
    pub fn live_len(&self) -> usize {
        self.live
    }

    /// Stores `value` with refcount 1 and returns a fresh handle distinct
    /// from every currently-live handle.
    pub fn allocate(&mut self, value: P) -> Handle {
        let entry = Entry { value, refcount: 1 };
        let (idx, generation) = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.entry = Some(entry);
                (idx, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ((self.slots.len() - 1) as u32, 0)
            }
        };
        self.live += 1;
        Handle::pack(idx + 1, generation)
    }

    fn entry(&self, h: Handle) -> Result<&Entry<P>, AbiError> {
        let idx = (h.slot() as usize)
            .checked_sub(1)
            .ok_or(AbiError::InvalidHandle)?;
        let slot = self.slots.get(idx).ok_or(AbiError::InvalidHandle)?;
        if slot.generation != h.generation() {
            return Err(AbiError::InvalidHandle);
        }
        slot.entry.as_ref().ok_or(AbiError::InvalidHandle)
    }

    fn entry_mut(&mut self, h: Handle) -> Result<&mut Entry<P>, AbiError> {
        let idx = (h.slot() as usize)
            .checked_sub(1)
            .ok_or(AbiError::InvalidHandle)?;
        let slot = self.slots.get_mut(idx).ok_or(AbiError::InvalidHandle)?;
        if slot.generation != h.generation() {
            return Err(AbiError::InvalidHandle);
        }
        slot.entry.as_mut().ok_or(AbiError::InvalidHandle)
    }

    pub fn resolve(&self, h: Handle) -> Result<&P, AbiError> {
        Ok(&self.entry(h)?.value)
    }

    pub fn resolve_mut(&mut self, h: Handle) -> Result<&mut P, AbiError> {
        Ok(&mut self.entry_mut(h)?.value)
    }

    pub fn refcount(&self, h: Handle) -> Result<u32, AbiError> {
        Ok(self.entry(h)?.refcount)
    }

    /// Adds an owning reference; returns the new count.
    pub fn increment(&mut self, h: Handle) -> Result<u32, AbiError> {
        let entry = self.entry_mut(h)?;
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    /// Drops an owning reference; returns the new count. Reaching 0 destroys
    /// the payload synchronously, releasing its owned handles first, and
    /// invalidates `h` for all future resolution.
    pub fn decrement(&mut self, h: Handle) -> Result<u32, AbiError> {
        let entry = self.entry_mut(h)?;
        entry.refcount -= 1;
        let left = entry.refcount;
        if left == 0 {
            self.destroy(h);
        }
        Ok(left)
    }

    fn destroy(&mut self, h: Handle) {
        let idx = (h.slot() as usize) - 1;
        let slot = &mut self.slots[idx];
        let entry = match slot.entry.take() {
            Some(entry) => entry,
            None => return,
        };
        if slot.generation < GENERATION_RETIRE {
            slot.generation += 1;
            self.free.push(idx as u32);
        }
        self.live -= 1;
        // Owned handles were acquired exactly once by this payload, so a
        // failed decrement here would mean the table is already corrupt.
        for owned in entry.value.owned_handles() {
            let _ = self.decrement(owned);
        }
    }
}

impl<P: Payload> Default for HandleTable<P> {
    fn default() -> Self {
        HandleTable::new()
    }
}

// -------------------------
// Growable sequence
// -------------------------

/// Growable, indexable, homogeneous container behind the `_seq_*` surface.
///
/// Indices are 0-based and contiguous; every indexed operation validates
/// against `[0, len)` before touching storage. Signed indices come straight
/// off the wire, so negatives are rejected here rather than at each call
/// site.
#[derive(Debug)]
pub struct Seq<T> {
    elems: Vec<T>,
}

impl<T> Seq<T> {
    pub fn new() -> Self {
        Seq { elems: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    fn index(&self, i: i64) -> Result<usize, AbiError> {
        usize::try_from(i)
            .ok()
            .filter(|&i| i < self.elems.len())
            .ok_or(AbiError::IndexOutOfRange)
    }

    pub fn get(&self, i: i64) -> Result<&T, AbiError> {
        let i = self.index(i)?;
        Ok(&self.elems[i])
    }

    pub fn set(&mut self, i: i64, value: T) -> Result<(), AbiError> {
        let i = self.index(i)?;
        self.elems[i] = value;
        Ok(())
    }

    /// Removes element `i`, shifting later elements left by one.
    pub fn delete(&mut self, i: i64) -> Result<(), AbiError> {
        let i = self.index(i)?;
        self.elems.remove(i);
        Ok(())
    }

    pub fn add(&mut self, value: T) {
        self.elems.push(value);
    }

    pub fn clear(&mut self) {
        self.elems.clear();
    }
}

impl<T> Default for Seq<T> {
    fn default() -> Self {
        Seq::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum Obj {
        Leaf(i64),
        Owner(Handle),
    }

    impl Payload for Obj {
        fn owned_handles(&self) -> Vec<Handle> {
            match self {
                Obj::Leaf(_) => Vec::new(),
                Obj::Owner(h) => vec![*h],
            }
        }
    }

    fn leaf_value(table: &HandleTable<Obj>, h: Handle) -> i64 {
        match table.resolve(h) {
            Ok(Obj::Leaf(v)) => *v,
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn allocate_resolve_release() {
        let mut table: HandleTable<Obj> = HandleTable::new();
        let h = table.allocate(Obj::Leaf(7));
        assert!(h.as_i64() > 0);
        assert_eq!(leaf_value(&table, h), 7);
        assert_eq!(table.refcount(h), Ok(1));
        assert_eq!(table.live_len(), 1);

        assert_eq!(table.decrement(h), Ok(0));
        assert_eq!(table.live_len(), 0);
        assert_eq!(table.resolve(h).err(), Some(AbiError::InvalidHandle));
        assert_eq!(table.decrement(h).err(), Some(AbiError::InvalidHandle));
    }

    #[test]
    fn mutation_is_visible_through_the_same_handle() {
        let mut table: HandleTable<Obj> = HandleTable::new();
        let h = table.allocate(Obj::Leaf(0));
        if let Ok(Obj::Leaf(v)) = table.resolve_mut(h) {
            *v = 5;
        }
        assert_eq!(leaf_value(&table, h), 5);
    }

    #[test]
    fn refcount_balances_acquire_release() {
        let mut table: HandleTable<Obj> = HandleTable::new();
        let h = table.allocate(Obj::Leaf(1));
        assert_eq!(table.increment(h), Ok(2));
        assert_eq!(table.increment(h), Ok(3));
        assert_eq!(table.decrement(h), Ok(2));
        assert_eq!(table.decrement(h), Ok(1));
        assert_eq!(leaf_value(&table, h), 1);
        assert_eq!(table.decrement(h), Ok(0));
        assert_eq!(table.resolve(h).err(), Some(AbiError::InvalidHandle));
    }

    #[test]
    fn reused_slot_does_not_alias_stale_handle() {
        let mut table: HandleTable<Obj> = HandleTable::new();
        let first = table.allocate(Obj::Leaf(10));
        assert_eq!(table.decrement(first), Ok(0));

        let second = table.allocate(Obj::Leaf(20));
        // Same slot, new generation: the stale handle stays dead.
        assert_ne!(first.as_i64(), second.as_i64());
        assert_eq!(table.resolve(first).err(), Some(AbiError::InvalidHandle));
        assert_eq!(leaf_value(&table, second), 20);
    }

    #[test]
    fn never_issued_handles_do_not_resolve() {
        let table: HandleTable<Obj> = HandleTable::new();
        assert!(Handle::from_i64(0).is_none());
        assert!(Handle::from_i64(-3).is_none());
        let bogus = Handle::from_i64(12345).unwrap();
        assert_eq!(table.resolve(bogus).err(), Some(AbiError::InvalidHandle));
    }

    #[test]
    fn destroying_an_owner_releases_owned_handles_transitively() {
        let mut table: HandleTable<Obj> = HandleTable::new();
        let inner = table.allocate(Obj::Leaf(42));
        let outer = table.allocate(Obj::Owner(inner));
        assert_eq!(table.live_len(), 2);

        assert_eq!(table.decrement(outer), Ok(0));
        assert_eq!(table.live_len(), 0);
        assert_eq!(table.resolve(outer).err(), Some(AbiError::InvalidHandle));
        assert_eq!(table.resolve(inner).err(), Some(AbiError::InvalidHandle));
    }

    #[test]
    fn shared_inner_survives_owner_destruction() {
        let mut table: HandleTable<Obj> = HandleTable::new();
        let inner = table.allocate(Obj::Leaf(9));
        let outer = table.allocate(Obj::Owner(inner));
        // A second owning reference held by the caller.
        assert_eq!(table.increment(inner), Ok(2));

        assert_eq!(table.decrement(outer), Ok(0));
        assert_eq!(leaf_value(&table, inner), 9);
        assert_eq!(table.decrement(inner), Ok(0));
        assert_eq!(table.resolve(inner).err(), Some(AbiError::InvalidHandle));
    }

    #[test]
    fn seq_add_len_get() {
        let mut seq: Seq<i64> = Seq::new();
        assert_eq!(seq.len(), 0);
        assert!(seq.is_empty());
        for n in 0..5 {
            seq.add(n * 10);
            assert_eq!(seq.len() as i64, n + 1);
            assert_eq!(seq.get(n), Ok(&(n * 10)));
        }
    }

    #[test]
    fn seq_set_overwrites_in_place() {
        let mut seq: Seq<i64> = Seq::new();
        seq.add(1);
        seq.add(2);
        assert_eq!(seq.set(1, 22), Ok(()));
        assert_eq!(seq.get(1), Ok(&22));
        assert_eq!(seq.len(), 2);
    }

    #[test]
    fn seq_delete_shifts_left() {
        let mut seq: Seq<i64> = Seq::new();
        for v in [10, 20, 30] {
            seq.add(v);
        }
        assert_eq!(seq.delete(1), Ok(()));
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get(0), Ok(&10));
        assert_eq!(seq.get(1), Ok(&30));
    }

    #[test]
    fn seq_bounds_are_checked_for_every_length() {
        let mut seq: Seq<i64> = Seq::new();
        for len in 0..4 {
            assert_eq!(seq.get(len).err(), Some(AbiError::IndexOutOfRange));
            assert_eq!(seq.get(-1).err(), Some(AbiError::IndexOutOfRange));
            assert_eq!(seq.set(len, 0).err(), Some(AbiError::IndexOutOfRange));
            assert_eq!(seq.delete(len).err(), Some(AbiError::IndexOutOfRange));
            seq.add(len);
        }
    }

    #[test]
    fn seq_clear_is_idempotent() {
        let mut seq: Seq<i64> = Seq::new();
        seq.add(1);
        seq.clear();
        assert_eq!(seq.len(), 0);
        seq.clear();
        assert_eq!(seq.len(), 0);
    }

    #[test]
    fn seq_owns_string_elements() {
        let mut seq: Seq<String> = Seq::new();
        let caller_owned = String::from("alpha");
        seq.add(caller_owned.clone());
        drop(caller_owned);
        assert_eq!(seq.get(0).map(String::as_str), Ok("alpha"));
    }

    #[test]
    fn env_u32_rejects_zero_and_garbage() {
        std::env::set_var("TERN_CORE_TEST_U32_ZERO", "0");
        std::env::set_var("TERN_CORE_TEST_U32_BAD", "lots");
        std::env::set_var("TERN_CORE_TEST_U32_OK", "48");
        assert_eq!(env_u32_nonzero("TERN_CORE_TEST_U32_ZERO", 7), 7);
        assert_eq!(env_u32_nonzero("TERN_CORE_TEST_U32_BAD", 7), 7);
        assert_eq!(env_u32_nonzero("TERN_CORE_TEST_U32_OK", 7), 48);
        assert_eq!(env_u32_nonzero("TERN_CORE_TEST_U32_MISSING", 9), 9);
    }
}
