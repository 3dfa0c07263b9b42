//! §3 Heap objects.
//!
//! Every kind from spec.md §3 is represented as a variant of `Obj`, stored
//! in a slot of the `Heap` slab (see `gc.rs`). A `GcRef` is a generational
//! index into that slab — the safe-Rust rendition of "a common header...
//! that participates in an intrusive singly-linked allocation list": the
//! slab's free-list plays the role of that list, and the generation counter
//! catches any stale reference instead of silently reusing memory under a
//! dangling handle. The teacher's object model (`crates/angelscript-core/
//! src/runtime/object_heap.rs`, `src/vm/memory.rs`) likewise identifies
//! heap values by handle rather than raw pointer; we follow that shape.

use crate::chunk::Chunk;
use crate::ordered_map::OrderedMap;
use crate::table::Table;
use crate::value::Value;

/// A handle to a heap object. Two `GcRef`s are equal iff they name the same
/// slot *and* generation, which is exactly object identity (Invariant 2:
/// string equality is pointer/handle equality via interning).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl GcRef {
    #[cfg(test)]
    pub(crate) fn for_test(index: u32, generation: u32) -> Self {
        GcRef { index, generation }
    }
}

/// Immutable interned byte string with a cached hash (§4.3).
#[derive(Debug, Clone)]
pub struct StrObj {
    pub bytes: Box<[u8]>,
    pub hash: u64,
}

impl StrObj {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf-8>")
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeObj {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl RangeObj {
    /// Number of values the range yields, matching the original's
    /// ascending/descending iteration in `tea_vm.c`'s range-expansion code.
    pub fn len(&self) -> usize {
        if self.step == 0.0 {
            return 0;
        }
        let n = (self.end - self.start) / self.step;
        if n <= 0.0 { 0 } else { n.ceil() as usize }
    }

    pub fn nth(&self, i: i64) -> f64 {
        self.start + (i as f64) * self.step
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListObj {
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MapObj {
    pub entries: OrderedMap,
}

/// A compiled function prototype: fixed arity, optional-arity count,
/// variadic flag, captured-upvalue count, an upper bound on operand-stack
/// growth, and the chunk of bytecode + constants (§3, §4.1).
#[derive(Debug, Clone)]
pub struct FunctionProto {
    pub name: Option<GcRef>,
    pub arity: u8,
    pub arity_optional: u8,
    pub variadic: bool,
    pub upvalue_count: u8,
    pub max_slots: u32,
    pub module: Option<GcRef>,
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Points at `stack[index]` in the live operand stack.
    Open(usize),
    /// Owns its own cell after the enclosing frame returned.
    Closed(Value),
}

#[derive(Debug, Clone, Copy)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: GcRef,
    pub upvalues: Vec<GcRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Function,
    Method,
    Property,
}

pub type NativeFn = fn(&mut crate::state::State) -> crate::error::TeaResult<()>;

#[derive(Clone)]
pub struct NativeObj {
    pub kind: NativeKind,
    pub name: String,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObj").field("kind", &self.kind).field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: GcRef,
    pub super_class: Option<GcRef>,
    /// Cached from `methods["constructor"]`; identical whenever defined
    /// (Invariant 4).
    pub constructor: Option<Value>,
    pub methods: Table,
    pub statics: Table,
}

#[derive(Debug, Clone)]
pub struct InstanceObj {
    pub class: GcRef,
    pub fields: Table,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: Value,
}

#[derive(Debug, Clone)]
pub struct ModuleObj {
    pub name: GcRef,
    pub path: Option<GcRef>,
    pub values: Table,
}

pub struct UserdataObj {
    pub data: Box<dyn std::any::Any>,
    pub size: usize,
}

impl std::fmt::Debug for UserdataObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserdataObj").field("size", &self.size).finish()
    }
}

#[derive(Debug)]
pub struct FileObj {
    pub file: Option<std::fs::File>,
    pub path: GcRef,
    pub mode: GcRef,
    pub is_open: bool,
}

/// Every heap object kind named by §3. Stored inline in a `Heap` slot
/// (`gc.rs`) rather than boxed individually — the slab itself is the
/// allocation.
#[derive(Debug)]
pub enum Obj {
    Str(StrObj),
    Range(RangeObj),
    List(ListObj),
    Map(MapObj),
    Function(FunctionProto),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Module(ModuleObj),
    Userdata(UserdataObj),
    File(FileObj),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::Str(_) => "string",
            Obj::Range(_) => "range",
            Obj::List(_) => "list",
            Obj::Map(_) => "map",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Native(_) => "function",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "method",
            Obj::Module(_) => "module",
            Obj::Userdata(_) => "userdata",
            Obj::File(_) => "file",
        }
    }

    /// Approximate heap footprint, used to drive the GC's byte-watermark
    /// (§4.9). Doesn't need to be exact — only monotonic in the object's
    /// actual size — matching `teaM_reallocate`'s coarse byte accounting.
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::Str(s) => s.bytes.len(),
            Obj::List(l) => l.items.capacity() * std::mem::size_of::<Value>(),
            Obj::Map(m) => m.entries.capacity() * std::mem::size_of::<Value>() * 2,
            Obj::Function(f) => f.chunk.code.capacity() + f.chunk.constants.capacity() * std::mem::size_of::<Value>(),
            Obj::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<GcRef>(),
            Obj::Class(c) => c.methods.capacity() * 32 + c.statics.capacity() * 32,
            Obj::Instance(i) => i.fields.capacity() * 32,
            Obj::Userdata(u) => u.size,
            _ => 0,
        }
    }
}
