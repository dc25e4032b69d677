//! The shared, self-contained allocator and collector.
//!
//! The original's global singleton VM is redesigned here as a `Heap`
//! value with no process-wide state: an
//! embedder constructs one `Heap`, hands a reference to the compiler to
//! intern constants while compiling, then hands the same `Heap` to the VM
//! to execute. Both sides allocate and intern through the same table, so
//! compiled string/function constants are already traceable by the time
//! the VM starts running.
//!
//! GC roots differ between the two callers (the compiler's in-flight
//! function chain vs. the VM's stack/frames/globals/upvalues), so
//! `alloc` takes a `mark_roots` callback supplied by whichever side is
//! calling in, rather than the `Heap` knowing about either caller's
//! internal structure.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::object::{Obj, ObjKind, ObjString};
use crate::table::Table;
use crate::value::Value;

const INITIAL_NEXT_GC: usize = 1024 * 1024;

pub struct Heap {
    objects: Cell<Option<NonNull<Obj>>>,
    pub strings: RefCell<Table>,
    bytes_allocated: Cell<usize>,
    next_gc: Cell<usize>,
    gray: RefCell<Vec<NonNull<Obj>>>,
    /// Mirrors the original's `#define DEBUG_STRESS_GC`, but as a runtime
    /// toggle (read from `EMBER_GC_STRESS` once at construction) rather
    /// than a recompile flag.
    pub stress: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Cell::new(None),
            strings: RefCell::new(Table::new()),
            bytes_allocated: Cell::new(0),
            next_gc: Cell::new(INITIAL_NEXT_GC),
            gray: RefCell::new(Vec::new()),
            stress: std::env::var("EMBER_GC_STRESS").is_ok(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }

    fn approx_size(kind: &ObjKind) -> usize {
        use std::mem::size_of;
        size_of::<Obj>()
            + match kind {
                ObjKind::String(s) => s.chars.len(),
                ObjKind::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * size_of::<Value>(),
                ObjKind::Native(_) => size_of::<usize>() * 2,
                ObjKind::Closure(c) => c.upvalues.len() * size_of::<NonNull<Obj>>(),
                ObjKind::Upvalue(_) => size_of::<Value>(),
                ObjKind::Class(_) => size_of::<Table>(),
                ObjKind::Instance(_) => size_of::<Table>(),
                ObjKind::BoundMethod(_) => size_of::<Value>(),
            }
    }

    /// Allocates and links a new heap object, running a collection first
    /// if this allocation would push `bytes_allocated` past `next_gc` (or
    /// unconditionally under `stress`). `mark_roots` marks whatever the
    /// calling side (compiler or VM) currently considers live.
    pub fn alloc(&self, kind: ObjKind, mark_roots: &mut dyn FnMut(&Heap)) -> NonNull<Obj> {
        let size = Self::approx_size(&kind);
        if self.stress || self.bytes_allocated.get() + size > self.next_gc.get() {
            self.collect_garbage(mark_roots);
        }
        self.bytes_allocated.set(self.bytes_allocated.get() + size);
        let obj = Box::new(Obj {
            marked: Cell::new(false),
            next: Cell::new(self.objects.get()),
            kind,
        });
        let ptr = NonNull::new(Box::into_raw(obj)).expect("Box::into_raw is never null");
        self.objects.set(Some(ptr));
        ptr
    }

    /// Interns `bytes` as a string, returning the existing object if an
    /// equal string is already interned. This is the only path by which
    /// `String` objects are created, so pointer equality always implies
    /// value equality.
    pub fn intern(&self, bytes: &[u8], mark_roots: &mut dyn FnMut(&Heap)) -> NonNull<Obj> {
        let hash = ObjString::hash_bytes(bytes);
        if let Some(existing) = unsafe { self.strings.borrow().find_string(bytes, hash) } {
            return existing;
        }
        let s = String::from_utf8_lossy(bytes).into_owned();
        let obj = self.alloc(
            ObjKind::String(ObjString {
                chars: s.into_boxed_str(),
                hash,
            }),
            mark_roots,
        );
        unsafe {
            self.strings.borrow_mut().set(obj, Value::Nil);
        }
        obj
    }

    pub fn mark_value(&self, value: Value) {
        if let Some(obj) = value.as_obj() {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&self, obj: NonNull<Obj>) {
        let already = unsafe { obj.as_ref().marked.replace(true) };
        if !already {
            self.gray.borrow_mut().push(obj);
        }
    }

    pub fn mark_table(&self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Forces an immediate collection regardless of the `next_gc`
    /// threshold. Backs the `gc()` native.
    pub fn force_collect(&self, mark_roots: &mut dyn FnMut(&Heap)) {
        self.collect_garbage(mark_roots);
    }

    fn collect_garbage(&self, mark_roots: &mut dyn FnMut(&Heap)) {
        tracing::debug!(bytes_allocated = self.bytes_allocated.get(), "gc begin");
        mark_roots(self);
        self.trace_references();
        self.sweep_strings();
        let freed = self.sweep_objects();
        self.next_gc.set(self.bytes_allocated.get() * 2);
        tracing::debug!(freed, bytes_allocated = self.bytes_allocated.get(), "gc end");
    }

    fn trace_references(&self) {
        while let Some(obj) = self.gray.borrow_mut().pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&self, obj: NonNull<Obj>) {
        let kind_ptr: *const ObjKind = unsafe { &obj.as_ref().kind };
        // SAFETY: we only read immutable fields of the kind below; no
        // other code mutates `kind` once allocated.
        match unsafe { &*kind_ptr } {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    self.mark_object(name);
                }
                for constant in &f.chunk.constants {
                    self.mark_value(*constant);
                }
            }
            ObjKind::Closure(c) => {
                self.mark_object(c.function);
                for up in &c.upvalues {
                    self.mark_object(*up);
                }
            }
            ObjKind::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(v) = u.state.get() {
                    self.mark_value(v);
                }
            }
            ObjKind::Class(c) => {
                self.mark_object(c.name);
                self.mark_table(&c.methods.borrow());
            }
            ObjKind::Instance(i) => {
                self.mark_object(i.class);
                self.mark_table(&i.fields.borrow());
            }
            ObjKind::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_object(b.method);
            }
        }
    }

    /// Weak intern-table pass: any string not marked by the trace above
    /// is dropped from `strings` before sweep frees its object.
    fn sweep_strings(&self) {
        unsafe {
            self.strings
                .borrow_mut()
                .retain_keys(|key| key.as_ref().marked.get());
        }
    }

    fn sweep_objects(&self) -> usize {
        let mut freed = 0;
        let mut prev: Option<NonNull<Obj>> = None;
        let mut current = self.objects.get();
        while let Some(obj) = current {
            let next = unsafe { obj.as_ref().next.get() };
            if unsafe { obj.as_ref().marked.get() } {
                unsafe { obj.as_ref().marked.set(false) };
                prev = Some(obj);
                current = next;
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref().next.set(next) },
                    None => self.objects.set(next),
                }
                let size = unsafe { Self::approx_size(&obj.as_ref().kind) };
                self.bytes_allocated.set(self.bytes_allocated.get().saturating_sub(size));
                drop(unsafe { Box::from_raw(obj.as_ptr()) });
                freed += 1;
                current = next;
            }
        }
        freed
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects.get();
        while let Some(obj) = current {
            let next = unsafe { obj.as_ref().next.get() };
            drop(unsafe { Box::from_raw(obj.as_ptr()) });
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_equal_bytes_twice_returns_the_same_pointer() {
        let heap = Heap::new();
        let a = heap.intern(b"hello", &mut |_h| {});
        let b = heap.intern(b"hello", &mut |_h| {});
        assert_eq!(a, b);
    }

    #[test]
    fn unreachable_string_is_collected_and_dropped_from_the_intern_table() {
        let heap = Heap::new();
        let kept = heap.intern(b"kept", &mut |_h| {});
        heap.intern(b"garbage", &mut |_h| {});
        let hash = ObjString::hash_bytes(b"garbage");
        assert!(unsafe { heap.strings.borrow().find_string(b"garbage", hash) }.is_some());

        // Only `kept` is a root; `garbage` has nothing pointing at it.
        heap.force_collect(&mut |h| h.mark_object(kept));

        assert!(unsafe { heap.strings.borrow().find_string(b"garbage", hash) }.is_none());
        assert!(unsafe { heap.strings.borrow().find_string(b"kept", ObjString::hash_bytes(b"kept")) }.is_some());
    }
}
