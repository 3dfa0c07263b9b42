//! The opaque state handle (§9 Design Notes: "no ambient singletons").
//!
//! Everything a running program can reach — the heap, the intern table,
//! globals, loaded modules, the operand stack, and the GC's bookkeeping —
//! lives behind one `State` value, mirroring `TeaState` in `tea_state.h`
//! and the teacher's own instinct to thread a single handle through every
//! core operation (`VM`/`Context` in `src/vm/vm.rs`, `src/core/context.rs`).

use crate::frame::{CallFrame, Callable, Stack};
use crate::gc::{GcConfig, Heap};
use crate::object::{
    ClassObj, ClosureObj, FunctionProto, GcRef, InstanceObj, ModuleObj, NativeFn, NativeKind, NativeObj, Obj,
    RangeObj, UpvalueObj, UpvalueState,
};
use crate::protect::Protection;
use crate::strings;
use crate::table::Table;
use crate::value::Value;
use rustc_hash::FxHashMap;

/// Host hook resolving `import "relative/path"` to an absolute path and
/// producing the compiled function for it (§6 "Import resolution"). The
/// core never reads source text or compiles; it only caches by resolved
/// path (Open Question 3) and calls back into the host for the bytes.
pub trait ModuleLoader {
    fn resolve(&mut self, base_dir: &str, relative_path: &str) -> Option<String>;
    /// Compile/load the module at `resolved_path`, returning its top-level
    /// closure ready to run.
    fn load(&mut self, state: &mut State, resolved_path: &str) -> Option<GcRef>;
}

/// A host-registered native module, selected by index (`IMPORT_NATIVE`).
pub type NativeModuleBuilder = fn(&mut State) -> crate::error::TeaResult<GcRef>;

pub struct State {
    pub(crate) heap: Heap,
    pub(crate) strings: Table,
    pub(crate) globals: Table,
    /// Mirrors `TeaState::constants` — compile-time-constant global
    /// bindings, kept separate from ordinary globals so a host compiler
    /// can forbid reassignment. The core never populates it itself.
    pub(crate) constants: Table,
    pub(crate) modules: FxHashMap<String, GcRef>,
    pub(crate) native_modules: Vec<NativeModuleBuilder>,
    pub(crate) stack: Stack,
    pub(crate) base: usize,
    /// Open upvalues, kept sorted descending by stack location (§4.8).
    pub(crate) open_upvalues: Vec<GcRef>,
    pub(crate) last_module: Option<GcRef>,
    pub(crate) string_class: Option<GcRef>,
    pub(crate) list_class: Option<GcRef>,
    pub(crate) map_class: Option<GcRef>,
    pub(crate) file_class: Option<GcRef>,
    pub(crate) range_class: Option<GcRef>,
    pub(crate) constructor_string: GcRef,
    pub(crate) repl_string: GcRef,
    pub(crate) underscore_string: GcRef,
    pub(crate) loader: Option<Box<dyn ModuleLoader>>,
    pub(crate) protection: Protection,
}

impl State {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        let mut heap = Heap::new(config);
        let mut strings = Table::new();
        let constructor_string = strings::intern(&mut heap, &mut strings, b"constructor");
        let repl_string = strings::intern(&mut heap, &mut strings, b"__repl__");
        let underscore_string = strings::intern(&mut heap, &mut strings, b"_");
        State {
            heap,
            strings,
            globals: Table::new(),
            constants: Table::new(),
            modules: FxHashMap::default(),
            native_modules: Vec::new(),
            stack: Stack::new(),
            base: 0,
            open_upvalues: Vec::new(),
            last_module: None,
            string_class: None,
            list_class: None,
            map_class: None,
            file_class: None,
            range_class: None,
            constructor_string,
            repl_string,
            underscore_string,
            loader: None,
            protection: Protection::default(),
        }
    }

    pub fn set_module_loader(&mut self, loader: impl ModuleLoader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    pub fn register_native_module(&mut self, index: usize, builder: NativeModuleBuilder) {
        if self.native_modules.len() <= index {
            self.native_modules.resize(index + 1, |_| unreachable!("unregistered native module slot"));
        }
        self.native_modules[index] = builder;
    }

    // ---- allocation (the single point that may trigger a collection) ----

    /// Allocate `obj` on the heap, first running a collection if the
    /// watermark (or stress mode) demands it. `anchors` are extra
    /// temporary roots — values not yet reachable any other way because
    /// they're mid-construction — pushed onto the operand stack for the
    /// duration of the potential collection, the same technique
    /// `tea_add_constant` uses around `tea_push`/`tea_pop`.
    pub fn alloc(&mut self, obj: Obj, anchors: &[Value]) -> GcRef {
        if self.heap.should_collect() {
            let start = self.stack.top();
            for a in anchors {
                self.stack.push(*a);
            }
            crate::gc::collect_garbage(self);
            self.stack.set_top(start);
        }
        self.heap.insert(obj)
    }

    pub fn intern(&mut self, bytes: &[u8]) -> GcRef {
        strings::intern(&mut self.heap, &mut self.strings, bytes)
    }

    pub fn new_string(&mut self, s: &str) -> GcRef {
        self.intern(s.as_bytes())
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> GcRef {
        self.alloc(Obj::List(crate::object::ListObj { items }), &[])
    }

    pub fn new_map(&mut self) -> GcRef {
        self.alloc(Obj::Map(crate::object::MapObj::default()), &[])
    }

    pub fn new_range(&mut self, start: f64, end: f64, step: f64) -> GcRef {
        self.alloc(Obj::Range(RangeObj { start, end, step }), &[])
    }

    pub fn new_instance(&mut self, class: GcRef) -> GcRef {
        self.alloc(Obj::Instance(InstanceObj { class, fields: Table::new() }), &[Value::Object(class)])
    }

    pub fn new_class(&mut self, name: GcRef, super_class: Option<GcRef>) -> GcRef {
        let mut anchors = vec![Value::Object(name)];
        if let Some(s) = super_class {
            anchors.push(Value::Object(s));
        }
        self.alloc(
            Obj::Class(ClassObj { name, super_class, constructor: None, methods: Table::new(), statics: Table::new() }),
            &anchors,
        )
    }

    pub fn new_native(&mut self, kind: NativeKind, name: impl Into<String>, func: NativeFn) -> GcRef {
        self.alloc(Obj::Native(NativeObj { kind, name: name.into(), func }), &[])
    }

    pub fn new_function(&mut self, proto: FunctionProto) -> GcRef {
        let mut anchors = Vec::new();
        if let Some(n) = proto.name {
            anchors.push(Value::Object(n));
        }
        if let Some(m) = proto.module {
            anchors.push(Value::Object(m));
        }
        self.alloc(Obj::Function(proto), &anchors)
    }

    pub fn new_closure(&mut self, function: GcRef, upvalues: Vec<GcRef>) -> GcRef {
        let mut anchors: Vec<Value> = upvalues.iter().map(|u| Value::Object(*u)).collect();
        anchors.push(Value::Object(function));
        self.alloc(Obj::Closure(ClosureObj { function, upvalues }), &anchors)
    }

    pub fn new_module(&mut self, name: GcRef, path: Option<GcRef>) -> GcRef {
        self.alloc(Obj::Module(ModuleObj { name, path, values: Table::new() }), &[Value::Object(name)])
    }

    // ---- value semantics (need heap access, §4.2) ----

    pub fn truthy(&self, v: Value) -> bool {
        self.heap.truthy(v)
    }

    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        self.heap.values_equal(a, b)
    }

    pub fn stringify(&self, v: Value) -> String {
        self.heap.stringify(v, &mut Vec::new())
    }

    pub fn type_name(&self, v: Value) -> &'static str {
        self.heap.type_name(v)
    }

    pub fn get(&self, r: GcRef) -> &Obj {
        self.heap.get(r)
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut Obj {
        self.heap.get_mut(r)
    }

    // ---- upvalue capture/close (§4.8) ----

    /// Find or create an open upvalue pointing at `stack_index`, inserting
    /// into `open_upvalues` to keep it sorted descending by location —
    /// `teaV_capture_upvalue`'s insertion-sort walk.
    pub fn capture_upvalue(&mut self, stack_index: usize) -> GcRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            match self.get(r) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Open(idx) if idx == stack_index => return r,
                    UpvalueState::Open(idx) if idx < stack_index => {
                        insert_at = i;
                        break;
                    }
                    _ => {}
                },
                _ => unreachable!(),
            }
        }
        let r = self.alloc(Obj::Upvalue(UpvalueObj { state: UpvalueState::Open(stack_index) }), &[]);
        self.open_upvalues.insert(insert_at, r);
        r
    }

    /// Close every open upvalue at or above `threshold`, copying the
    /// referent into the node's own cell (`teaV_close_upvalues`).
    pub fn close_upvalues(&mut self, threshold: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            let idx = match self.get(r) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Open(idx) => idx,
                    UpvalueState::Closed(_) => {
                        i += 1;
                        continue;
                    }
                },
                _ => unreachable!(),
            };
            if idx >= threshold {
                let value = self.stack.values[idx];
                if let Obj::Upvalue(u) = self.get_mut(r) {
                    u.state = UpvalueState::Closed(value);
                }
                self.open_upvalues.remove(i);
            } else {
                i += 1;
            }
        }
    }

    // ---- GC roots (§4.9) ----

    pub(crate) fn mark_roots(&mut self, gray: &mut Vec<GcRef>) {
        let stack_values: Vec<Value> = self.stack.values.clone();
        for v in stack_values {
            if let Value::Object(r) = v {
                self.mark_into(r, gray);
            }
        }
        let frame_callables: Vec<Callable> = self.stack.frames.iter().map(|f| f.callable).collect();
        for c in frame_callables {
            match c {
                Callable::Closure(r) | Callable::Native(r) => self.mark_into(r, gray),
            }
        }
        for r in self.open_upvalues.clone() {
            self.mark_into(r, gray);
        }
        for (k, _, v) in self.globals.iter().collect::<Vec<_>>() {
            self.mark_into(k, gray);
            if let Value::Object(r) = v {
                self.mark_into(r, gray);
            }
        }
        for (k, _, v) in self.constants.iter().collect::<Vec<_>>() {
            self.mark_into(k, gray);
            if let Value::Object(r) = v {
                self.mark_into(r, gray);
            }
        }
        for r in self.modules.values().copied().collect::<Vec<_>>() {
            self.mark_into(r, gray);
        }
        for r in [self.string_class, self.list_class, self.map_class, self.file_class, self.range_class]
            .into_iter()
            .flatten()
        {
            self.mark_into(r, gray);
        }
        self.mark_into(self.constructor_string, gray);
        self.mark_into(self.repl_string, gray);
        self.mark_into(self.underscore_string, gray);
        if let Some(m) = self.last_module {
            self.mark_into(m, gray);
        }
    }

    fn mark_into(&mut self, r: GcRef, gray: &mut Vec<GcRef>) {
        self.heap.mark(r, gray);
    }

    // ---- class lookup for primitive method dispatch (§4.10 "Properties") ----

    pub fn class_for(&self, v: Value) -> Option<GcRef> {
        match v {
            Value::Object(r) => match self.get(r) {
                Obj::Str(_) => self.string_class,
                Obj::List(_) => self.list_class,
                Obj::Map(_) => self.map_class,
                Obj::Range(_) => self.range_class,
                Obj::File(_) => self.file_class,
                Obj::Instance(i) => Some(i.class),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn ensure_frame_capacity(&mut self) {
        // `Vec` growth already handles relocation safely; this mirrors
        // `teaD_ensure_callframe`'s call site so frame-depth accounting
        // stays in one obvious place.
        if self.stack.frames.len() == self.stack.frames.capacity() {
            self.stack.frames.reserve(self.stack.frames.capacity().max(8));
        }
    }

    pub fn push_frame(&mut self, callable: Callable, slots: usize) {
        let saved_base = self.base;
        self.stack.frames.push(CallFrame { callable, ip: 0, slots, saved_base });
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}
