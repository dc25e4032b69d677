//! Open-addressed hash table with linear probing, used both for the VM's
//! globals table and (as a set: values all `nil`) for the string intern
//! table, and for class method tables / instance field tables.

use std::ptr::NonNull;

use crate::object::Obj;
use crate::value::Value;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<NonNull<Obj>>,
    value: Value,
}

/// A tombstone is `{key: None, value: Bool(true)}`; an empty slot is
/// `{key: None, value: Nil}`. Real entries always have `key: Some(_)`.
fn is_tombstone(e: &Entry) -> bool {
    e.key.is_none() && matches!(e.value, Value::Bool(true))
}

pub struct Table {
    entries: Vec<Option<Entry>>,
    count: usize, // live entries + tombstones
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// # Safety
    /// `key` must point to a live `String` object.
    unsafe fn find_entry(entries: &[Option<Entry>], key: NonNull<Obj>) -> usize {
        let cap = entries.len();
        let hash = unsafe { key.as_ref().as_string().hash };
        let mut index = (hash as usize) & (cap - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                None => return tombstone.unwrap_or(index),
                Some(e) if is_tombstone(e) => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(e) => {
                    // Strings are interned: pointer equality is sufficient.
                    if e.key == Some(key) {
                        return index;
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn grow(&mut self, new_cap: usize) {
        let mut new_entries: Vec<Option<Entry>> = vec![None; new_cap];
        let mut new_count = 0;
        for slot in self.entries.iter().flatten() {
            if slot.key.is_none() {
                continue; // drop tombstones on resize
            }
            let idx = unsafe { Self::find_entry(&new_entries, slot.key.unwrap()) };
            new_entries[idx] = Some(*slot);
            new_count += 1;
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Inserts or overwrites `key => value`. Returns `true` if this was a
    /// new key.
    ///
    /// # Safety
    /// `key` must point to a live, interned `String` object.
    pub unsafe fn set(&mut self, key: NonNull<Obj>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * 0.75 {
            let new_cap = if self.capacity() < 8 {
                8
            } else {
                self.capacity() * 2
            };
            self.grow(new_cap);
        }
        let idx = unsafe { Self::find_entry(&self.entries, key) };
        let is_new_key = match &self.entries[idx] {
            None => true,
            Some(e) => e.key.is_none(),
        };
        let lands_in_empty_slot = matches!(&self.entries[idx], None);
        if is_new_key && lands_in_empty_slot {
            self.count += 1;
        }
        self.entries[idx] = Some(Entry {
            key: Some(key),
            value,
        });
        is_new_key
    }

    /// # Safety
    /// `key` must point to a live, interned `String` object.
    pub unsafe fn get(&self, key: NonNull<Obj>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = unsafe { Self::find_entry(&self.entries, key) };
        match &self.entries[idx] {
            Some(e) if e.key.is_some() => Some(e.value),
            _ => None,
        }
    }

    /// Installs a tombstone in place of `key`'s entry, if present.
    ///
    /// # Safety
    /// `key` must point to a live, interned `String` object.
    pub unsafe fn delete(&mut self, key: NonNull<Obj>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = unsafe { Self::find_entry(&self.entries, key) };
        match &self.entries[idx] {
            Some(e) if e.key.is_some() => {
                self.entries[idx] = Some(Entry {
                    key: None,
                    value: Value::Bool(true),
                });
                true
            }
            _ => false,
        }
    }

    /// Looks up an interned string by its raw bytes and precomputed hash
    /// without requiring a candidate `Obj` to already exist — used by the
    /// interner to find-or-allocate.
    ///
    /// # Safety
    /// Every live key in the table must point to a valid `String` object.
    pub unsafe fn find_string(&self, bytes: &[u8], hash: u32) -> Option<NonNull<Obj>> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.entries.len();
        let mut index = (hash as usize) & (cap - 1);
        loop {
            match &self.entries[index] {
                None => return None,
                Some(e) if is_tombstone(e) => {}
                Some(e) => {
                    let key = e.key.unwrap();
                    let s = unsafe { key.as_ref().as_string() };
                    if s.hash == hash && s.chars.as_bytes() == bytes {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    /// Iterates all live `(key, value)` pairs, used by the GC to mark the
    /// globals table and by the weak-interning post-mark sweep.
    pub fn iter(&self) -> impl Iterator<Item = (NonNull<Obj>, Value)> + '_ {
        self.entries.iter().flatten().filter_map(|e| match e.key {
            Some(k) => Some((k, e.value)),
            None => None,
        })
    }

    /// Removes every entry whose key fails `keep`. Used for the weak
    /// intern table: after marking, any string whose mark bit is false is
    /// dropped before sweep frees it.
    ///
    /// # Safety
    /// Every live key must be a valid pointer at call time.
    pub unsafe fn retain_keys(&mut self, mut keep: impl FnMut(NonNull<Obj>) -> bool) {
        for slot in self.entries.iter_mut() {
            if let Some(e) = slot {
                if let Some(k) = e.key {
                    if !keep(k) {
                        *slot = Some(Entry {
                            key: None,
                            value: Value::Bool(true),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjKind;
    use std::cell::Cell;

    fn leak_string(s: &str) -> NonNull<Obj> {
        let obj = Box::new(Obj {
            marked: Cell::new(false),
            next: Cell::new(None),
            kind: ObjKind::String(ObjString {
                chars: s.into(),
                hash: ObjString::hash_bytes(s.as_bytes()),
            }),
        });
        NonNull::new(Box::leak(obj) as *mut Obj).unwrap()
    }

    #[test]
    fn set_then_get_roundtrips() {
        let key = leak_string("answer");
        let mut table = Table::new();
        unsafe {
            assert!(table.set(key, Value::Number(42.0)));
            assert_eq!(table.get(key).unwrap().as_number(), Some(42.0));
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn delete_installs_tombstone_and_lookup_skips_it() {
        let a = leak_string("a");
        let b = leak_string("b");
        let mut table = Table::new();
        unsafe {
            table.set(a, Value::Number(1.0));
            table.set(b, Value::Number(2.0));
            assert!(table.delete(a));
            assert!(table.get(a).is_none());
            // lookup for `b` must still succeed despite the tombstone
            // left behind by deleting `a` on the probe sequence.
            assert_eq!(table.get(b).unwrap().as_number(), Some(2.0));
        }
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..40).map(|i| leak_string(&format!("k{i}"))).collect();
        unsafe {
            for (i, k) in keys.iter().enumerate() {
                table.set(*k, Value::Number(i as f64));
            }
            for (i, k) in keys.iter().enumerate() {
                assert_eq!(table.get(*k).unwrap().as_number(), Some(i as f64));
            }
        }
        assert_eq!(table.len(), 40);
    }

    #[test]
    fn find_string_locates_interned_bytes() {
        let key = leak_string("hello");
        let mut table = Table::new();
        unsafe {
            table.set(key, Value::Nil);
            let hash = ObjString::hash_bytes(b"hello");
            let found = table.find_string(b"hello", hash);
            assert_eq!(found, Some(key));
            assert!(table.find_string(b"nope", ObjString::hash_bytes(b"nope")).is_none());
        }
    }
}
