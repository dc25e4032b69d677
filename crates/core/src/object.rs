//! The eight heap-object kinds and the common header that threads every
//! live object into the VM's intrusive object list.
//!
//! The original's "common prefix plus downcast by kind tag" is mapped
//! onto a single Rust enum (`ObjKind`) rather than a trait-object
//! hierarchy: the GC dispatches marking by matching on the variant
//! instead of a virtual call.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Every heap object's header: a mark bit for the collector and the
/// intrusive-list link to the next allocated object, plus the payload.
pub struct Obj {
    pub marked: Cell<bool>,
    pub next: Cell<Option<NonNull<Obj>>>,
    pub kind: ObjKind,
}

pub enum ObjKind {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// An immutable, interned byte string with a precomputed FNV-1a hash.
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

impl ObjString {
    /// FNV-1a over the raw bytes, offset basis and prime matching the
    /// original `hashString`.
    pub fn hash_bytes(bytes: &[u8]) -> u32 {
        let mut hash: u32 = 2166136261;
        for &b in bytes {
            hash ^= b as u32;
            hash = hash.wrapping_mul(16777619);
        }
        hash
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` for the anonymous top-level script function.
    pub name: Option<NonNull<Obj>>,
    pub kind: FunctionKind,
}

/// The handle a native function body gets into the running VM: the shared
/// heap (for natives that intern or allocate a result) and a way to force
/// an immediate collection (used by the `gc()` native). Implemented by
/// `ember_vm::Vm`, not by this crate, which has no notion of call frames.
pub trait NativeContext {
    fn heap(&self) -> &crate::heap::Heap;
    fn request_gc(&mut self);
    /// Seconds since the VM was constructed, backing the `clock()` native.
    fn elapsed_seconds(&self) -> f64;
    /// Lets a native push a value it allocated onto the value stack so it
    /// stays GC-rooted across a further allocation before returning it.
    fn push(&mut self, value: Value);
    fn pop(&mut self) -> Value;
}

/// A host-supplied function. Kept as an `Rc` so the function value can be
/// cheaply referenced without the GC owning it as a distinct object-graph
/// edge of its own; natives needing VM access receive it as `ctx` rather
/// than through captured global state.
pub type NativeFn = Rc<dyn Fn(&mut dyn NativeContext, &[Value]) -> Result<Value, String>>;

pub struct ObjNative {
    pub name: Box<str>,
    pub arity: i32,
    pub function: NativeFn,
}

pub struct Closure {
    pub function: NonNull<Obj>,
    pub upvalues: Vec<NonNull<Obj>>,
}

/// Either a live alias into a stack slot or, once the slot's scope has
/// exited, an owned cell holding the hoisted value.
#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct Upvalue {
    pub state: Cell<UpvalueState>,
    /// Next entry in the VM's open-upvalue list, sorted by strictly
    /// decreasing stack index. `None` once closed and unlinked.
    pub next_open: Cell<Option<NonNull<Obj>>>,
}

pub struct Class {
    pub name: NonNull<Obj>,
    pub methods: RefCell<Table>,
}

pub struct Instance {
    pub class: NonNull<Obj>,
    pub fields: RefCell<Table>,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: NonNull<Obj>,
}

impl Obj {
    /// # Safety
    /// `self` must be a `String` object.
    pub unsafe fn as_string(&self) -> &ObjString {
        match &self.kind {
            ObjKind::String(s) => s,
            _ => unreachable!("as_string called on non-string object"),
        }
    }

    /// # Safety
    /// `self` must be a `Function` object.
    pub unsafe fn as_function(&self) -> &ObjFunction {
        match &self.kind {
            ObjKind::Function(f) => f,
            _ => unreachable!("as_function called on non-function object"),
        }
    }

    /// # Safety
    /// `self` must be a `Native` object.
    pub unsafe fn as_native(&self) -> &ObjNative {
        match &self.kind {
            ObjKind::Native(n) => n,
            _ => unreachable!("as_native called on non-native object"),
        }
    }

    /// # Safety
    /// `self` must be a `Closure` object.
    pub unsafe fn as_closure(&self) -> &Closure {
        match &self.kind {
            ObjKind::Closure(c) => c,
            _ => unreachable!("as_closure called on non-closure object"),
        }
    }

    /// # Safety
    /// `self` must be an `Upvalue` object.
    pub unsafe fn as_upvalue(&self) -> &Upvalue {
        match &self.kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("as_upvalue called on non-upvalue object"),
        }
    }

    /// # Safety
    /// `self` must be a `Class` object.
    pub unsafe fn as_class(&self) -> &Class {
        match &self.kind {
            ObjKind::Class(c) => c,
            _ => unreachable!("as_class called on non-class object"),
        }
    }

    /// # Safety
    /// `self` must be an `Instance` object.
    pub unsafe fn as_instance(&self) -> &Instance {
        match &self.kind {
            ObjKind::Instance(i) => i,
            _ => unreachable!("as_instance called on non-instance object"),
        }
    }

    /// # Safety
    /// `self` must be a `BoundMethod` object.
    pub unsafe fn as_bound_method(&self) -> &BoundMethod {
        match &self.kind {
            ObjKind::BoundMethod(b) => b,
            _ => unreachable!("as_bound_method called on non-bound-method object"),
        }
    }

    /// A short, printable description of an object's runtime kind, used
    /// for the default `print`/`typeof` rendering of callables.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ObjKind::String(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Native(_) => "native",
            ObjKind::Closure(_) => "closure",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
        }
    }
}
