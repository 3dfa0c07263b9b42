//! §4.10/§4.11 Bytecode interpreter loop and call-dispatch machinery.
//!
//! Grounded in `tea_vm.c`'s `run()` dispatch switch and `tea_do.c`'s
//! `teaD_call_value`/`call`/`callc`. The original caches the active frame's
//! `ip`/`slots`/`upvalues`/chunk pointer in C locals and reloads them after
//! any call that might reenter the VM (`READ_FRAME`/`STORE_FRAME`). Safe Rust
//! has nothing to cache in the first place: every helper below re-reads the
//! current frame from `state.stack.frames` fresh, so there's no stale-cache
//! bug class to guard against.

use crate::chunk::OpCode;
use crate::error::{RuntimeError, TeaError, TeaResult, TraceFrame};
use crate::frame::Callable;
use crate::object::{BoundMethodObj, GcRef, InstanceObj, NativeKind, Obj, UpvalueState};
use crate::state::State;
use crate::value::Value;

// ---------------------------------------------------------------------
// Frame-local accessors. None of these cache anything across calls; each
// reads `state.stack.frames.last()` fresh.
// ---------------------------------------------------------------------

fn current_frame_closure(state: &State) -> Option<GcRef> {
    match state.stack.frames.last()?.callable {
        Callable::Closure(c) => Some(c),
        Callable::Native(_) => None,
    }
}

fn current_function(state: &State) -> GcRef {
    let closure = current_frame_closure(state).expect("native frame has no bytecode");
    match state.get(closure) {
        Obj::Closure(c) => c.function,
        _ => unreachable!(),
    }
}

fn current_slots(state: &State) -> usize {
    state.stack.frames.last().expect("no active frame").slots
}

fn current_ip(state: &State) -> usize {
    state.stack.frames.last().expect("no active frame").ip
}

fn set_ip(state: &mut State, ip: usize) {
    state.stack.frames.last_mut().expect("no active frame").ip = ip;
}

fn current_module(state: &State) -> Option<GcRef> {
    match state.get(current_function(state)) {
        Obj::Function(f) => f.module,
        _ => unreachable!(),
    }
}

fn current_line(state: &State) -> u32 {
    let ip = current_ip(state);
    match state.get(current_function(state)) {
        Obj::Function(f) => f.chunk.line_for_offset(ip.saturating_sub(1)),
        _ => unreachable!(),
    }
}

fn read_byte(state: &mut State) -> u8 {
    let function = current_function(state);
    let ip = current_ip(state);
    let byte = match state.get(function) {
        Obj::Function(f) => f.chunk.code[ip],
        _ => unreachable!(),
    };
    set_ip(state, ip + 1);
    byte
}

fn read_short(state: &mut State) -> u16 {
    let hi = read_byte(state) as u16;
    let lo = read_byte(state) as u16;
    (hi << 8) | lo
}

fn read_constant(state: &mut State) -> Value {
    let index = read_byte(state) as usize;
    let function = current_function(state);
    match state.get(function) {
        Obj::Function(f) => f.chunk.constants[index],
        _ => unreachable!(),
    }
}

fn read_constant_long(state: &mut State) -> Value {
    let index = read_short(state) as usize;
    let function = current_function(state);
    match state.get(function) {
        Obj::Function(f) => f.chunk.constants[index],
        _ => unreachable!(),
    }
}

fn read_string(state: &mut State) -> GcRef {
    match read_constant(state) {
        Value::Object(r) => r,
        _ => unreachable!("constant operand must be a string"),
    }
}

fn name_hash(state: &State, name: GcRef) -> u64 {
    match state.get(name) {
        Obj::Str(s) => s.hash,
        _ => unreachable!(),
    }
}

/// Build a `RuntimeError` with the traceback captured right now, while every
/// frame involved is still on the stack (`teaV_runtime_error`'s frame walk).
fn runtime_error(state: &State, message: impl Into<String>) -> TeaError {
    let mut trace = Vec::new();
    for frame in state.stack.frames.iter().rev() {
        if let Callable::Closure(c) = frame.callable {
            let function = match state.get(c) {
                Obj::Closure(cl) => cl.function,
                _ => unreachable!(),
            };
            if let Obj::Function(f) = state.get(function) {
                let line = f.chunk.line_for_offset(frame.ip.saturating_sub(1));
                let name = match f.name {
                    Some(n) => match state.get(n) {
                        Obj::Str(s) => s.as_str().to_string(),
                        _ => "?".to_string(),
                    },
                    None => "script".to_string(),
                };
                trace.push(TraceFrame { line, function: name });
            }
        }
    }
    TeaError::Runtime(RuntimeError { message: message.into(), trace })
}

// ---------------------------------------------------------------------
// Call dispatch (`teaD_call_value`).
// ---------------------------------------------------------------------

/// What `call_value` found at the callee slot, classified with only a
/// shared borrow so the classification is finished before any `&mut State`
/// call is made against it (sidesteps the borrow conflict a direct
/// translation of the C switch would hit).
enum Callee {
    BoundMethod(Value, Value),
    Class(GcRef, Option<Value>),
    Closure(GcRef),
    Native(GcRef),
    NotCallable,
}

fn classify(state: &State, value: Value) -> Callee {
    match value {
        Value::Object(r) => match state.get(r) {
            Obj::BoundMethod(b) => Callee::BoundMethod(b.receiver, b.method),
            Obj::Class(c) => Callee::Class(r, c.constructor),
            Obj::Closure(_) => Callee::Closure(r),
            Obj::Native(_) => Callee::Native(r),
            _ => Callee::NotCallable,
        },
        _ => Callee::NotCallable,
    }
}

/// `teaD_call_value`: dispatch a call to whatever sits at `stack.peek(argc)`.
pub(crate) fn call_value(state: &mut State, argc: usize) -> TeaResult<()> {
    let callee = state.stack.peek(argc);
    call_value_with(state, callee, argc)
}

/// Same dispatch, but the callee value is already known rather than read
/// off the callee stack slot (used by property/invoke dispatch, where the
/// looked-up method isn't necessarily sitting in that slot).
fn call_value_with(state: &mut State, callee: Value, argc: usize) -> TeaResult<()> {
    match classify(state, callee) {
        Callee::BoundMethod(receiver, method) => {
            let slot = state.stack.top() - argc - 1;
            state.stack.values[slot] = receiver;
            call_value_with(state, method, argc)
        }
        Callee::Class(class_ref, constructor) => {
            let instance = state.new_instance(class_ref);
            let slot = state.stack.top() - argc - 1;
            state.stack.values[slot] = Value::Object(instance);
            match constructor {
                Some(ctor) => call_value_with(state, ctor, argc),
                None => {
                    if argc != 0 {
                        return Err(runtime_error(state, "Expected 0 arguments"));
                    }
                    Ok(())
                }
            }
        }
        Callee::Closure(closure_ref) => call_closure(state, closure_ref, argc),
        Callee::Native(native_ref) => call_native(state, native_ref, argc),
        Callee::NotCallable => Err(runtime_error(state, format!("{} is not callable", state.type_name(callee)))),
    }
}

/// `call()`'s arity reconciliation: reshuffle `argc` actual arguments
/// against `(arity, arity_optional, variadic)` before pushing the frame.
fn reconcile_arity(state: &mut State, argc: usize, arity: usize, arity_optional: usize, variadic: bool) -> TeaResult<usize> {
    if argc < arity {
        if variadic && argc + 1 == arity {
            let empty = state.new_list(Vec::new());
            state.stack.push(Value::Object(empty));
            return Ok(argc + 1);
        }
        return Err(runtime_error(state, format!("Expected {arity} arguments, got {argc}")));
    }
    if argc > arity + arity_optional {
        if !variadic {
            return Err(runtime_error(state, format!("Expected at most {} arguments, got {argc}", arity + arity_optional)));
        }
        let extra = argc - (arity + arity_optional);
        let start = state.stack.top() - extra;
        let items: Vec<Value> = state.stack.values[start..].to_vec();
        state.stack.set_top(start);
        let list = state.new_list(items);
        state.stack.push(Value::Object(list));
        return Ok(arity + arity_optional + 1);
    }
    if variadic {
        let last = state.stack.pop();
        let list = state.new_list(vec![last]);
        state.stack.push(Value::Object(list));
        return Ok(argc);
    }
    Ok(argc)
}

fn call_closure(state: &mut State, closure_ref: GcRef, argc: usize) -> TeaResult<()> {
    let function = match state.get(closure_ref) {
        Obj::Closure(c) => c.function,
        _ => unreachable!(),
    };
    let (arity, arity_optional, variadic) = match state.get(function) {
        Obj::Function(f) => (f.arity as usize, f.arity_optional as usize, f.variadic),
        _ => unreachable!(),
    };
    let reconciled = reconcile_arity(state, argc, arity, arity_optional, variadic)?;
    if state.stack.frames.len() >= state.heap.config().max_frame_depth {
        return Err(runtime_error(state, "Stack overflow"));
    }
    let slots = state.stack.top() - reconciled - 1;
    state.ensure_frame_capacity();
    state.push_frame(Callable::Closure(closure_ref), slots);
    Ok(())
}

fn call_native(state: &mut State, native_ref: GcRef, argc: usize) -> TeaResult<()> {
    let kind = match state.get(native_ref) {
        Obj::Native(n) => n.kind,
        _ => unreachable!(),
    };
    let receiver_included = matches!(kind, NativeKind::Method | NativeKind::Property);
    let base = if receiver_included { state.stack.top() - argc - 1 } else { state.stack.top() - argc };
    let saved_base = state.base;
    state.base = base;
    state.push_frame(Callable::Native(native_ref), base);
    let func = match state.get(native_ref) {
        Obj::Native(n) => n.func,
        _ => unreachable!(),
    };
    let result = func(state);
    state.stack.frames.pop();
    state.base = saved_base;
    result?;
    let res = state.stack.pop();
    let slot = state.stack.top() - argc - 1;
    state.stack.set_top(slot);
    state.stack.push(res);
    Ok(())
}

// ---------------------------------------------------------------------
// Property / method / subscript dispatch (`get_property`, `invoke`,
// `bind_method`, `subscript*`, `in_`).
// ---------------------------------------------------------------------

fn lookup_method_flat(state: &State, class: GcRef, name: GcRef, hash: u64) -> Option<Value> {
    match state.get(class) {
        Obj::Class(c) => c.methods.get(name, hash),
        _ => unreachable!(),
    }
}

/// Walk `super_class` looking for a method — used only where the
/// INHERIT-time flattening might be incomplete (`get_property`/`GET_SUPER`
/// binding an instance method, per the "walking super" property rule).
fn lookup_method_chain(state: &State, mut class: GcRef, name: GcRef, hash: u64) -> Option<Value> {
    loop {
        let (found, super_class) = match state.get(class) {
            Obj::Class(c) => (c.methods.get(name, hash), c.super_class),
            _ => unreachable!(),
        };
        if found.is_some() {
            return found;
        }
        match super_class {
            Some(s) => class = s,
            None => return None,
        }
    }
}

fn get_property_via_class(state: &mut State, receiver: Value, class: GcRef, name: GcRef, hash: u64) -> TeaResult<()> {
    let method = lookup_method_flat(state, class, name, hash);
    match method {
        Some(Value::Object(r)) if matches!(state.get(r), Obj::Native(n) if n.kind == NativeKind::Property) => {
            state.stack.pop();
            state.stack.push(receiver);
            call_value_with(state, Value::Object(r), 0)
        }
        Some(v) => {
            state.stack.pop();
            state.stack.push(v);
            Ok(())
        }
        None => Err(runtime_error(state, format!("'{}' has no property '{}'", state.type_name(receiver), str_value(state, name)))),
    }
}

fn get_property_instance(state: &mut State, r: GcRef, name: GcRef, hash: u64, dopop: bool) -> TeaResult<()> {
    let (class, field) = match state.get(r) {
        Obj::Instance(inst) => (inst.class, inst.fields.get(name, hash)),
        _ => unreachable!(),
    };
    if let Some(value) = field {
        if dopop {
            state.stack.pop();
        }
        state.stack.push(value);
        return Ok(());
    }
    if let Some(method) = lookup_method_chain(state, class, name, hash) {
        let receiver = state.stack.pop();
        let bm = state.alloc(Obj::BoundMethod(BoundMethodObj { receiver, method }), &[receiver, method]);
        state.stack.push(Value::Object(bm));
        return Ok(());
    }
    let mut k = class;
    loop {
        let (value, super_class) = match state.get(k) {
            Obj::Class(c) => (c.statics.get(name, hash), c.super_class),
            _ => unreachable!(),
        };
        if let Some(v) = value {
            if dopop {
                state.stack.pop();
            }
            state.stack.push(v);
            return Ok(());
        }
        match super_class {
            Some(s) => k = s,
            None => break,
        }
    }
    Err(runtime_error(state, format!("instance has no property '{}'", str_value(state, name))))
}

fn get_property_class(state: &mut State, r: GcRef, name: GcRef, hash: u64, dopop: bool) -> TeaResult<()> {
    let mut k = r;
    loop {
        let (value, super_class) = match state.get(k) {
            Obj::Class(c) => (c.statics.get(name, hash).or_else(|| c.methods.get(name, hash)), c.super_class),
            _ => unreachable!(),
        };
        if let Some(v) = value {
            if dopop {
                state.stack.pop();
            }
            state.stack.push(v);
            return Ok(());
        }
        match super_class {
            Some(s) => k = s,
            None => break,
        }
    }
    Err(runtime_error(state, format!("class has no property '{}'", str_value(state, name))))
}

fn get_property_module(state: &mut State, r: GcRef, name: GcRef, hash: u64, dopop: bool) -> TeaResult<()> {
    let value = match state.get(r) {
        Obj::Module(m) => m.values.get(name, hash),
        _ => unreachable!(),
    };
    match value {
        Some(v) => {
            if dopop {
                state.stack.pop();
            }
            state.stack.push(v);
            Ok(())
        }
        None => Err(runtime_error(state, format!("module has no property '{}'", str_value(state, name)))),
    }
}

fn get_property_map(state: &mut State, receiver: Value, r: GcRef, name: GcRef, hash: u64, dopop: bool) -> TeaResult<()> {
    let value = match state.get(r) {
        Obj::Map(m) => m.entries.get(&state.heap, Value::Object(name)),
        _ => unreachable!(),
    };
    if let Some(v) = value {
        if dopop {
            state.stack.pop();
        }
        state.stack.push(v);
        return Ok(());
    }
    match state.map_class {
        Some(class) => get_property_via_class(state, receiver, class, name, hash),
        None => Err(runtime_error(state, format!("map has no property '{}'", str_value(state, name)))),
    }
}

fn get_property(state: &mut State, receiver: Value, name: GcRef, hash: u64, dopop: bool) -> TeaResult<()> {
    let r = match receiver {
        Value::Object(r) => r,
        _ => return Err(runtime_error(state, "Only objects have properties")),
    };
    enum Kind {
        Instance,
        Class,
        Module,
        Map,
        Other,
    }
    let kind = match state.get(r) {
        Obj::Instance(_) => Kind::Instance,
        Obj::Class(_) => Kind::Class,
        Obj::Module(_) => Kind::Module,
        Obj::Map(_) => Kind::Map,
        _ => Kind::Other,
    };
    match kind {
        Kind::Instance => get_property_instance(state, r, name, hash, dopop),
        Kind::Class => get_property_class(state, r, name, hash, dopop),
        Kind::Module => get_property_module(state, r, name, hash, dopop),
        Kind::Map => get_property_map(state, receiver, r, name, hash, dopop),
        Kind::Other => match state.class_for(receiver) {
            Some(class) => get_property_via_class(state, receiver, class, name, hash),
            None => Err(runtime_error(state, format!("'{}' has no properties", state.type_name(receiver)))),
        },
    }
}

fn set_property(state: &mut State, receiver: Value, name: GcRef, hash: u64, value: Value) -> TeaResult<()> {
    match receiver {
        Value::Object(r) => match state.get_mut(r) {
            Obj::Instance(inst) => {
                inst.fields.set(name, hash, value);
                Ok(())
            }
            _ => Err(runtime_error(state, format!("Cannot set properties on a {}", state.type_name(receiver)))),
        },
        _ => Err(runtime_error(state, "Only instances have settable properties")),
    }
}

fn str_value(state: &State, r: GcRef) -> String {
    match state.get(r) {
        Obj::Str(s) => s.as_str().to_string(),
        _ => "?".to_string(),
    }
}

/// `invoke`: property-then-method dispatch for `INVOKE`, avoiding the
/// intermediate bound-method allocation when a plain method is found.
fn invoke(state: &mut State, name: GcRef, hash: u64, argc: usize) -> TeaResult<()> {
    let receiver = state.stack.peek(argc);
    let r = match receiver {
        Value::Object(r) => r,
        _ => return Err(runtime_error(state, "Only objects have methods")),
    };
    enum Kind {
        Module,
        Instance,
        Class,
        Other,
    }
    let kind = match state.get(r) {
        Obj::Module(_) => Kind::Module,
        Obj::Instance(_) => Kind::Instance,
        Obj::Class(_) => Kind::Class,
        _ => Kind::Other,
    };
    match kind {
        Kind::Module => {
            let value = match state.get(r) {
                Obj::Module(m) => m.values.get(name, hash),
                _ => unreachable!(),
            };
            match value {
                Some(v) => call_value_with(state, v, argc),
                None => Err(runtime_error(state, format!("Undefined '{}' in module", str_value(state, name)))),
            }
        }
        Kind::Instance => {
            let (class, field) = match state.get(r) {
                Obj::Instance(inst) => (inst.class, inst.fields.get(name, hash)),
                _ => unreachable!(),
            };
            if let Some(value) = field {
                let slot = state.stack.top() - argc - 1;
                state.stack.values[slot] = value;
                return call_value_with(state, value, argc);
            }
            match lookup_method_flat(state, class, name, hash) {
                Some(method) => call_value_with(state, method, argc),
                None => Err(runtime_error(state, format!("Undefined property '{}'", str_value(state, name)))),
            }
        }
        Kind::Class => match lookup_method_flat(state, r, name, hash) {
            Some(method) => call_value_with(state, method, argc),
            None => Err(runtime_error(state, format!("Undefined property '{}'", str_value(state, name)))),
        },
        Kind::Other => match state.class_for(receiver) {
            Some(class) => match lookup_method_flat(state, class, name, hash) {
                Some(method) => call_value_with(state, method, argc),
                None => Err(runtime_error(state, format!("'{}' has no method '{}'", state.type_name(receiver), str_value(state, name)))),
            },
            None => Err(runtime_error(state, format!("'{}' has no methods", state.type_name(receiver)))),
        },
    }
}

fn is_hashable(state: &State, v: Value) -> bool {
    match v {
        Value::Null | Value::Bool(_) | Value::Number(_) => true,
        Value::Object(r) => matches!(state.get(r), Obj::Str(_) | Obj::Range(_)),
    }
}

/// Resolve a negative index the way `subscript`/`subscript_store` do:
/// negative counts back from the end, out of range is a runtime error.
fn normalize_index(state: &State, index: f64, len: usize) -> TeaResult<usize> {
    let i = index as i64;
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(runtime_error(state, "Index out of bounds"));
    }
    Ok(resolved as usize)
}

fn subscript(state: &mut State) -> TeaResult<()> {
    let index = state.stack.pop();
    let receiver = state.stack.pop();
    match receiver {
        Value::Object(r) => match state.get(r) {
            Obj::List(list) => {
                let len = list.items.len();
                let idx = index.as_number().ok_or_else(|| runtime_error(state, "List index must be a number"))?;
                let i = normalize_index(state, idx, len)?;
                let items = match state.get(r) {
                    Obj::List(l) => l.items[i],
                    _ => unreachable!(),
                };
                state.stack.push(items);
                Ok(())
            }
            Obj::Range(range) => {
                let range = *range;
                let len = range.len();
                let idx = index.as_number().ok_or_else(|| runtime_error(state, "Range index must be a number"))?;
                let i = normalize_index(state, idx, len)?;
                state.stack.push(Value::Number(range.nth(i as i64)));
                Ok(())
            }
            Obj::Map(_) => {
                if !is_hashable(state, index) {
                    return Err(runtime_error(state, "Map key isn't hashable"));
                }
                let value = match state.get(r) {
                    Obj::Map(m) => m.entries.get(&state.heap, index),
                    _ => unreachable!(),
                };
                match value {
                    Some(v) => {
                        state.stack.push(v);
                        Ok(())
                    }
                    None => Err(runtime_error(state, "Key not found")),
                }
            }
            Obj::Str(s) => {
                let chars: Vec<char> = s.as_str().chars().collect();
                let len = chars.len();
                let idx = index.as_number().ok_or_else(|| runtime_error(state, "String index must be a number"))?;
                let i = normalize_index(state, idx, len)?;
                let out = state.new_string(&chars[i].to_string());
                state.stack.push(Value::Object(out));
                Ok(())
            }
            Obj::Instance(_) => {
                state.stack.push(receiver);
                state.stack.push(index);
                state.stack.push(Value::Null);
                invoke_operator_on(state, receiver, "[]", 2)
            }
            _ => Err(runtime_error(state, format!("'{}' is not subscriptable", state.type_name(receiver)))),
        },
        _ => Err(runtime_error(state, format!("'{}' is not subscriptable", state.type_name(receiver)))),
    }
}

/// Stack before: `[receiver, index, item]`. When `assign` the item is
/// written through and the whole window collapses to `[item]`
/// (`SUBSCRIPT_STORE`). When not, nothing is written: the receiver/index
/// stay, the current element replaces `item`'s slot, and `item` is pushed
/// back on top, leaving `[receiver, index, current, item]` for a following
/// `SUBSCRIPT_STORE` to finish a compound assignment (`SUBSCRIPT_PUSH`).
fn subscript_store(state: &mut State, assign: bool) -> TeaResult<()> {
    let value = state.stack.pop();
    let index = state.stack.pop();
    let receiver = state.stack.pop();
    match receiver {
        Value::Object(r) => match state.get(r) {
            Obj::List(list) => {
                let len = list.items.len();
                let idx = index.as_number().ok_or_else(|| runtime_error(state, "List index must be a number"))?;
                let i = normalize_index(state, idx, len)?;
                if assign {
                    if let Obj::List(l) = state.get_mut(r) {
                        l.items[i] = value;
                    }
                    state.stack.push(value);
                } else {
                    let current = match state.get(r) {
                        Obj::List(l) => l.items[i],
                        _ => unreachable!(),
                    };
                    state.stack.push(receiver);
                    state.stack.push(index);
                    state.stack.push(current);
                    state.stack.push(value);
                }
                Ok(())
            }
            Obj::Map(_) => {
                if !is_hashable(state, index) {
                    return Err(runtime_error(state, "Map key isn't hashable"));
                }
                if assign {
                    let heap_ptr: *const crate::gc::Heap = &state.heap;
                    if let Obj::Map(m) = state.get_mut(r) {
                        // Safety: `set` only hashes/compares via `heap`, never
                        // mutates it; `m` and `heap` live in disjoint fields.
                        let heap: &crate::gc::Heap = unsafe { &*heap_ptr };
                        m.entries.set(heap, index, value);
                    }
                    state.stack.push(value);
                } else {
                    let current = match state.get(r) {
                        Obj::Map(m) => m.entries.get(&state.heap, index),
                        _ => unreachable!(),
                    };
                    let current = current.ok_or_else(|| runtime_error(state, "Key does not exist within the map"))?;
                    state.stack.push(receiver);
                    state.stack.push(index);
                    state.stack.push(current);
                    state.stack.push(value);
                }
                Ok(())
            }
            Obj::Instance(_) => {
                state.stack.push(receiver);
                state.stack.push(index);
                state.stack.push(value);
                invoke_operator_on(state, receiver, "[]", 2)
            }
            _ => Err(runtime_error(state, format!("'{}' does not support item assignment", state.type_name(receiver)))),
        },
        _ => Err(runtime_error(state, format!("'{}' does not support item assignment", state.type_name(receiver)))),
    }
}

fn in_op(state: &mut State) -> TeaResult<()> {
    let haystack = state.stack.pop();
    let needle = state.stack.pop();
    let result = match haystack {
        Value::Object(r) => match state.get(r) {
            Obj::Str(s) => match needle {
                Value::Object(nr) => match state.get(nr) {
                    Obj::Str(ns) => s.as_str().contains(ns.as_str()),
                    _ => return Err(runtime_error(state, "Expected a string")),
                },
                _ => return Err(runtime_error(state, "Expected a string")),
            },
            Obj::List(list) => list.items.iter().any(|v| state.values_equal(*v, needle)),
            Obj::Map(map) => map.entries.contains(&state.heap, needle),
            Obj::Range(range) => match needle.as_number() {
                Some(n) => {
                    if range.step > 0.0 {
                        n >= range.start && n < range.end && ((n - range.start) / range.step).fract() == 0.0
                    } else {
                        n <= range.start && n > range.end && ((range.start - n) / -range.step).fract() == 0.0
                    }
                }
                None => false,
            },
            _ => return Err(runtime_error(state, format!("'{}' is not iterable", state.type_name(haystack)))),
        },
        _ => return Err(runtime_error(state, format!("'{}' is not iterable", state.type_name(haystack)))),
    };
    state.stack.push(Value::Bool(result));
    Ok(())
}

// ---------------------------------------------------------------------
// Arithmetic / equality, with instance-operator-overload fallback
// (`BINARY_OP`/`INVOKE_METHOD` macros).
// ---------------------------------------------------------------------

fn is_instance(state: &State, v: Value) -> bool {
    matches!(v, Value::Object(r) if matches!(state.get(r), Obj::Instance(_)))
}

/// `INVOKE_METHOD(a, b, name, argc)`: find `name` on `a`'s class, then
/// `b`'s, and call it. Doesn't touch the stack itself — callers lay out the
/// call window (receiver + `argc` arguments) before invoking this.
fn invoke_operator(state: &mut State, a: Value, b: Value, name: &str, argc: usize) -> TeaResult<()> {
    let name_ref = state.new_string(name);
    let hash = name_hash(state, name_ref);
    if let Value::Object(ra) = a {
        if let Obj::Instance(InstanceObj { class, .. }) = state.get(ra) {
            if let Some(method) = lookup_method_flat(state, *class, name_ref, hash) {
                return call_value_with(state, method, argc);
            }
        }
    }
    if let Value::Object(rb) = b {
        if let Obj::Instance(InstanceObj { class, .. }) = state.get(rb) {
            if let Some(method) = lookup_method_flat(state, *class, name_ref, hash) {
                return call_value_with(state, method, argc);
            }
        }
    }
    Err(runtime_error(state, format!("Undefined '{name}' overload")))
}

/// Variant used by `SUBSCRIPT`/`SUBSCRIPT_STORE`: the receiver is known to
/// be an instance already, and the call window is already laid out.
fn invoke_operator_on(state: &mut State, receiver: Value, name: &str, argc: usize) -> TeaResult<()> {
    invoke_operator(state, receiver, Value::Null, name, argc)
}

enum BinResult {
    Number(f64),
    Bool(bool),
}

/// The numeric-fast-path / instance-fallback / type-error pattern shared by
/// every arithmetic and comparison opcode except `+`, `*`, `%`, `**`, which
/// have their own special-cased fallbacks below.
fn binary_op(state: &mut State, name: &str, op: impl Fn(f64, f64) -> BinResult) -> TeaResult<()> {
    let b = state.stack.peek(0);
    let a = state.stack.peek(1);
    if let (Some(an), Some(bn)) = (a.as_number(), b.as_number()) {
        state.stack.pop();
        let result = match op(an, bn) {
            BinResult::Number(n) => Value::Number(n),
            BinResult::Bool(b) => Value::Bool(b),
        };
        *state.stack.values.last_mut().unwrap() = result;
        return Ok(());
    }
    if is_instance(state, a) || is_instance(state, b) {
        state.stack.pop();
        state.stack.pop();
        state.stack.push(a);
        state.stack.push(a);
        state.stack.push(b);
        return invoke_operator(state, a, b, name, 2);
    }
    Err(runtime_error(state, format!("Attempt to use '{name}' operator with {} and {}", state.type_name(a), state.type_name(b))))
}

fn concatenate(state: &mut State) -> TeaResult<()> {
    let b = state.stack.pop();
    let a = state.stack.pop();
    let (ab, bb) = match (a, b) {
        (Value::Object(ra), Value::Object(rb)) => {
            let ab = match state.get(ra) {
                Obj::Str(s) => s.bytes.clone(),
                _ => unreachable!(),
            };
            let bb = match state.get(rb) {
                Obj::Str(s) => s.bytes.clone(),
                _ => unreachable!(),
            };
            (ab, bb)
        }
        _ => unreachable!(),
    };
    let mut combined = Vec::with_capacity(ab.len() + bb.len());
    combined.extend_from_slice(&ab);
    combined.extend_from_slice(&bb);
    let r = state.intern(&combined);
    state.stack.push(Value::Object(r));
    Ok(())
}

/// Lists concatenate by mutating the lower operand in place and pushing it
/// back — matches the original's `tea_append_list`/`PEEK(1)` reuse rather
/// than allocating a fresh list.
fn add_lists(state: &mut State, ra: GcRef, rb: GcRef) -> TeaResult<()> {
    let extra: Vec<Value> = match state.get(rb) {
        Obj::List(l) => l.items.clone(),
        _ => unreachable!(),
    };
    if let Obj::List(l) = state.get_mut(ra) {
        l.items.extend(extra);
    }
    state.stack.pop();
    state.stack.pop();
    state.stack.push(Value::Object(ra));
    Ok(())
}

fn add_maps(state: &mut State, ra: GcRef, rb: GcRef) -> TeaResult<()> {
    let extra: Vec<(Value, Value)> = match state.get(rb) {
        Obj::Map(m) => m.entries.iter_in_order().collect(),
        _ => unreachable!(),
    };
    let mut entries = match state.get_mut(ra) {
        Obj::Map(m) => std::mem::take(&mut m.entries),
        _ => unreachable!(),
    };
    for (k, v) in extra {
        entries.set(&state.heap, k, v);
    }
    if let Obj::Map(m) = state.get_mut(ra) {
        m.entries = entries;
    }
    state.stack.pop();
    state.stack.pop();
    state.stack.push(Value::Object(ra));
    Ok(())
}

fn op_add(state: &mut State) -> TeaResult<()> {
    let b = state.stack.peek(0);
    let a = state.stack.peek(1);
    if let (Value::Object(ra), Value::Object(rb)) = (a, b) {
        match (state.get(ra), state.get(rb)) {
            (Obj::Str(_), Obj::Str(_)) => return concatenate(state),
            (Obj::List(_), Obj::List(_)) => return add_lists(state, ra, rb),
            (Obj::Map(_), Obj::Map(_)) => return add_maps(state, ra, rb),
            _ => {}
        }
    }
    binary_op(state, "+", |x, y| BinResult::Number(x + y))
}

fn repeat_string(state: &mut State, str_ref: GcRef, n: f64) -> TeaResult<()> {
    let bytes = match state.get(str_ref) {
        Obj::Str(s) => s.bytes.clone(),
        _ => unreachable!(),
    };
    let count = n as i64;
    let result: Vec<u8> =
        if count <= 0 || bytes.is_empty() { Vec::new() } else { bytes.iter().copied().cycle().take(bytes.len() * count as usize).collect() };
    state.stack.pop();
    state.stack.pop();
    let r = state.intern(&result);
    state.stack.push(Value::Object(r));
    Ok(())
}

fn op_multiply(state: &mut State) -> TeaResult<()> {
    let b = state.stack.peek(0);
    let a = state.stack.peek(1);
    let repeat = match (a, b) {
        (Value::Object(ra), Value::Number(n)) if matches!(state.get(ra), Obj::Str(_)) => Some((ra, n)),
        (Value::Number(n), Value::Object(rb)) if matches!(state.get(rb), Obj::Str(_)) => Some((rb, n)),
        _ => None,
    };
    if let Some((str_ref, n)) = repeat {
        return repeat_string(state, str_ref, n);
    }
    binary_op(state, "*", |x, y| BinResult::Number(x * y))
}

fn op_mod(state: &mut State) -> TeaResult<()> {
    let b = state.stack.peek(0);
    let a = state.stack.peek(1);
    if let (Some(an), Some(bn)) = (a.as_number(), b.as_number()) {
        state.stack.pop();
        *state.stack.values.last_mut().unwrap() = Value::Number(an % bn);
        return Ok(());
    }
    invoke_operator(state, a, b, "%", 1)
}

fn op_pow(state: &mut State) -> TeaResult<()> {
    let b = state.stack.peek(0);
    let a = state.stack.peek(1);
    if let (Some(an), Some(bn)) = (a.as_number(), b.as_number()) {
        state.stack.pop();
        *state.stack.values.last_mut().unwrap() = Value::Number(an.powf(bn));
        return Ok(());
    }
    invoke_operator(state, a, b, "**", 1)
}

/// Bitwise ops truncate through `i64` — a deliberate widening of the
/// original's 32-bit `int` cast (`tea_vm.c`'s `BITWISE_OP` truncates to
/// `int`), since nothing in the language's value model caps numbers at 32
/// bits and truncating there would silently wrap values scripts can easily
/// produce (e.g. millisecond timestamps).
fn bitwise_op(state: &mut State, name: &str, op: impl Fn(i64, i64) -> i64) -> TeaResult<()> {
    let b = state.stack.peek(0);
    let a = state.stack.peek(1);
    if let (Some(an), Some(bn)) = (a.as_number(), b.as_number()) {
        state.stack.pop();
        let result = op(an as i64, bn as i64) as f64;
        *state.stack.values.last_mut().unwrap() = Value::Number(result);
        return Ok(());
    }
    if is_instance(state, a) || is_instance(state, b) {
        state.stack.pop();
        state.stack.pop();
        state.stack.push(a);
        state.stack.push(a);
        state.stack.push(b);
        return invoke_operator(state, a, b, name, 2);
    }
    Err(runtime_error(state, format!("Attempt to use '{name}' operator with {} and {}", state.type_name(a), state.type_name(b))))
}

fn op_equal(state: &mut State) -> TeaResult<()> {
    let b = state.stack.pop();
    let a = state.stack.pop();
    if is_instance(state, a) {
        state.stack.push(a);
        state.stack.push(a);
        state.stack.push(b);
        let name_ref = state.new_string("==");
        let hash = name_hash(state, name_ref);
        if let Value::Object(ra) = a {
            let class = match state.get(ra) {
                Obj::Instance(i) => i.class,
                _ => unreachable!(),
            };
            if let Some(method) = lookup_method_flat(state, class, name_ref, hash) {
                return call_value_with(state, method, 2);
            }
        }
        state.stack.set_top(state.stack.top() - 3);
    }
    let result = state.values_equal(a, b);
    state.stack.push(Value::Bool(result));
    Ok(())
}

fn op_negate(state: &mut State) -> TeaResult<()> {
    let v = state.stack.pop();
    if let Some(n) = v.as_number() {
        state.stack.push(Value::Number(-n));
        return Ok(());
    }
    if is_instance(state, v) {
        state.stack.push(v);
        state.stack.push(v);
        state.stack.push(Value::Null);
        return invoke_operator(state, v, Value::Null, "-", 2);
    }
    Err(runtime_error(state, format!("Attempt to negate a {}", state.type_name(v))))
}

// ---------------------------------------------------------------------
// Class construction opcodes.
// ---------------------------------------------------------------------

fn define_method(state: &mut State, name: GcRef) {
    let hash = name_hash(state, name);
    let method = state.stack.peek(0);
    let class_ref = match state.stack.peek(1) {
        Value::Object(r) => r,
        _ => unreachable!(),
    };
    let is_constructor = name == state.constructor_string;
    if let Obj::Class(c) = state.get_mut(class_ref) {
        c.methods.set(name, hash, method);
        if is_constructor {
            c.constructor = Some(method);
        }
    }
    state.stack.pop();
}

// ---------------------------------------------------------------------
// The dispatch loop.
// ---------------------------------------------------------------------

/// `tea_call`: call whatever sits at the bottom of the `argc`-argument
/// window already laid out at the top of the embedding stack, driving the
/// bytecode loop to completion if the callee turns out to be scripted
/// (a native callee already runs synchronously inside `call_value`).
pub(crate) fn call_from_api(state: &mut State, argc: usize) -> TeaResult<()> {
    let window_base = state.stack.top() - argc - 1;
    let frames_before = state.stack.frames.len();
    call_value(state, argc)?;
    if state.stack.frames.len() > frames_before {
        execute(state, window_base)?;
    }
    Ok(())
}

/// Run `closure` (0-argument, as every compiled module/script entry point
/// is) to completion, returning its result value (§4.11, §6 entry points).
pub fn run(state: &mut State, closure: GcRef) -> TeaResult<Value> {
    state.protected_call(|state| {
        let base = state.stack.top();
        state.stack.push(Value::Object(closure));
        call_value_with(state, Value::Object(closure), 0)?;
        execute(state, base)
    })
}

/// Execute until the frame present when `outer_depth` was captured returns.
pub(crate) fn execute(state: &mut State, outer_base: usize) -> TeaResult<Value> {
    let outer_depth = state.stack.frames.len() - 1;
    loop {
        if matches!(state.stack.frames.last().map(|f| f.callable), Some(Callable::Native(_))) {
            unreachable!("native frames never run through execute");
        }
        let op = OpCode::try_from(read_byte(state)).map_err(|_| runtime_error(state, "Invalid opcode"))?;
        match op {
            OpCode::Constant => {
                let v = read_constant(state);
                state.stack.push(v);
            }
            OpCode::ConstantLong => {
                let v = read_constant_long(state);
                state.stack.push(v);
            }
            OpCode::Null => state.stack.push(Value::Null),
            OpCode::True => state.stack.push(Value::Bool(true)),
            OpCode::False => state.stack.push(Value::Bool(false)),
            OpCode::Dup => {
                let v = state.stack.peek(0);
                state.stack.push(v);
            }
            OpCode::Pop => {
                state.stack.pop();
            }
            OpCode::PopRepl => {
                let v = state.stack.pop();
                if !v.is_null() {
                    let text = state.stringify(v);
                    println!("{text}");
                }
            }
            OpCode::GetLocal => {
                let slot = read_byte(state) as usize;
                let slots = current_slots(state);
                let v = state.stack.values[slots + slot];
                state.stack.push(v);
            }
            OpCode::SetLocal => {
                let slot = read_byte(state) as usize;
                let slots = current_slots(state);
                let v = state.stack.peek(0);
                state.stack.values[slots + slot] = v;
            }
            OpCode::GetUpvalue => {
                let slot = read_byte(state) as usize;
                let closure = current_frame_closure(state).expect("upvalue access outside a closure frame");
                let up = match state.get(closure) {
                    Obj::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let v = match state.get(up) {
                    Obj::Upvalue(u) => match u.state {
                        UpvalueState::Open(idx) => state.stack.values[idx],
                        UpvalueState::Closed(v) => v,
                    },
                    _ => unreachable!(),
                };
                state.stack.push(v);
            }
            OpCode::SetUpvalue => {
                let slot = read_byte(state) as usize;
                let closure = current_frame_closure(state).expect("upvalue access outside a closure frame");
                let up = match state.get(closure) {
                    Obj::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let v = state.stack.peek(0);
                let idx_if_open = match state.get(up) {
                    Obj::Upvalue(u) => match u.state {
                        UpvalueState::Open(idx) => Some(idx),
                        UpvalueState::Closed(_) => None,
                    },
                    _ => unreachable!(),
                };
                match idx_if_open {
                    Some(idx) => state.stack.values[idx] = v,
                    None => {
                        if let Obj::Upvalue(u) = state.get_mut(up) {
                            u.state = UpvalueState::Closed(v);
                        }
                    }
                }
            }
            OpCode::GetGlobal => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let value = state.globals.get(name, hash).or_else(|| state.constants.get(name, hash));
                match value {
                    Some(v) => state.stack.push(v),
                    None => return Err(runtime_error(state, format!("Undefined variable '{}'", str_value(state, name)))),
                }
            }
            OpCode::SetGlobal => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let v = state.stack.peek(0);
                if state.globals.set(name, hash, v) {
                    state.globals.delete(name, hash);
                    return Err(runtime_error(state, format!("Undefined variable '{}'", str_value(state, name))));
                }
            }
            OpCode::DefineGlobal => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let v = state.stack.pop();
                state.globals.set(name, hash, v);
            }
            OpCode::GetModule => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let module = current_module(state).expect("top-level code always has a module");
                let value = match state.get(module) {
                    Obj::Module(m) => m.values.get(name, hash),
                    _ => unreachable!(),
                };
                match value {
                    Some(v) => state.stack.push(v),
                    None => return Err(runtime_error(state, format!("Undefined variable '{}'", str_value(state, name)))),
                }
            }
            OpCode::SetModule => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let v = state.stack.peek(0);
                let module = current_module(state).expect("top-level code always has a module");
                let is_new = match state.get_mut(module) {
                    Obj::Module(m) => m.values.set(name, hash, v),
                    _ => unreachable!(),
                };
                if is_new {
                    if let Obj::Module(m) = state.get_mut(module) {
                        m.values.delete(name, hash);
                    }
                    return Err(runtime_error(state, format!("Undefined variable '{}'", str_value(state, name))));
                }
            }
            OpCode::DefineModule => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let v = state.stack.pop();
                let module = current_module(state).expect("top-level code always has a module");
                if let Obj::Module(m) = state.get_mut(module) {
                    m.values.set(name, hash, v);
                }
            }
            OpCode::DefineOptional => {
                let arity = read_byte(state) as usize;
                let arity_optional = read_byte(state) as usize;
                let slots = current_slots(state);
                let arg_count = state.stack.top() - slots - arity_optional - 1;
                let total = arity_optional + arg_count;
                let mut values = vec![Value::Null; total];
                for slot in values.iter_mut() {
                    *slot = state.stack.pop();
                }
                for i in 0..arg_count {
                    state.stack.push(values[total - 1 - i]);
                }
                let remaining = arity + arity_optional - arg_count;
                for i in (1..=remaining).rev() {
                    state.stack.push(values[i - 1]);
                }
            }
            OpCode::GetProperty => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let receiver = state.stack.peek(0);
                get_property(state, receiver, name, hash, true)?;
            }
            OpCode::GetPropertyNoPop => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let receiver = state.stack.peek(0);
                get_property(state, receiver, name, hash, false)?;
            }
            OpCode::SetProperty => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let value = state.stack.pop();
                let receiver = state.stack.pop();
                set_property(state, receiver, name, hash, value)?;
                state.stack.push(value);
            }
            OpCode::GetSuper => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let superclass = match state.stack.pop() {
                    Value::Object(r) if matches!(state.get(r), Obj::Class(_)) => r,
                    _ => return Err(runtime_error(state, "Superclass must be a class")),
                };
                match lookup_method_flat(state, superclass, name, hash) {
                    Some(method) => {
                        let receiver = state.stack.pop();
                        let bm = state.alloc(Obj::BoundMethod(BoundMethodObj { receiver, method }), &[receiver, method]);
                        state.stack.push(Value::Object(bm));
                    }
                    None => return Err(runtime_error(state, format!("Undefined property '{}'", str_value(state, name)))),
                }
            }
            OpCode::Range => {
                let c = state.stack.pop();
                let b = state.stack.pop();
                let a = state.stack.pop();
                match (a.as_number(), b.as_number(), c.as_number()) {
                    (Some(a), Some(b), Some(c)) => {
                        let r = state.new_range(a, b, c);
                        state.stack.push(Value::Object(r));
                    }
                    _ => return Err(runtime_error(state, "Range operands must be numbers")),
                }
            }
            OpCode::List => {
                let item_count = read_byte(state) as usize;
                let list = state.new_list(Vec::new());
                state.stack.push(Value::Object(list));
                let mut items = Vec::new();
                for i in (1..=item_count).rev() {
                    let v = state.stack.peek(i);
                    match v {
                        Value::Object(r) if matches!(state.get(r), Obj::Range(_)) => {
                            let range = match state.get(r) {
                                Obj::Range(range) => *range,
                                _ => unreachable!(),
                            };
                            for n in 0..range.len() {
                                items.push(Value::Number(range.nth(n as i64)));
                            }
                        }
                        other => items.push(other),
                    }
                }
                state.stack.set_top(state.stack.top() - item_count - 1);
                if let Obj::List(l) = state.get_mut(list) {
                    l.items = items;
                }
                state.stack.push(Value::Object(list));
            }
            OpCode::Map => {
                let item_count = read_byte(state) as usize;
                let map = state.new_map();
                state.stack.push(Value::Object(map));
                let mut entries = Vec::new();
                let mut i = item_count * 2;
                while i > 0 {
                    let key = state.stack.peek(i);
                    let value = state.stack.peek(i - 1);
                    if !is_hashable(state, key) {
                        return Err(runtime_error(state, "Map key isn't hashable"));
                    }
                    entries.push((key, value));
                    i -= 2;
                }
                state.stack.set_top(state.stack.top() - item_count * 2 - 1);
                let mut ordered = crate::ordered_map::OrderedMap::new();
                for (k, v) in entries {
                    ordered.set(&state.heap, k, v);
                }
                if let Obj::Map(m) = state.get_mut(map) {
                    m.entries = ordered;
                }
                state.stack.push(Value::Object(map));
            }
            OpCode::Enum => {
                let item_count = read_byte(state) as usize;
                let map = state.new_map();
                state.stack.push(Value::Object(map));
                let mut entries = Vec::new();
                let mut counter = 0f64;
                let mut i = item_count * 2;
                while i > 0 {
                    let name = state.stack.peek(i);
                    let mut value = state.stack.peek(i - 1);
                    match value {
                        Value::Null => value = Value::Number(counter),
                        Value::Number(n) => counter = n,
                        _ => {}
                    }
                    entries.push((name, value));
                    counter += 1.0;
                    i -= 2;
                }
                state.stack.set_top(state.stack.top() - item_count * 2 - 1);
                let mut ordered = crate::ordered_map::OrderedMap::new();
                for (k, v) in entries {
                    ordered.set(&state.heap, k, v);
                }
                if let Obj::Map(m) = state.get_mut(map) {
                    m.entries = ordered;
                }
                state.stack.push(Value::Object(map));
            }
            OpCode::UnpackList => {
                let count = read_byte(state) as usize;
                let v = state.stack.pop();
                let items = match v {
                    Value::Object(r) => match state.get(r) {
                        Obj::List(l) => l.items.clone(),
                        _ => return Err(runtime_error(state, "Can only unpack a list")),
                    },
                    _ => return Err(runtime_error(state, "Can only unpack a list")),
                };
                for i in 0..count {
                    state.stack.push(items.get(i).copied().unwrap_or(Value::Null));
                }
            }
            OpCode::UnpackRestList => {
                let before = read_byte(state) as usize;
                let after = read_byte(state) as usize;
                let v = state.stack.pop();
                let items = match v {
                    Value::Object(r) => match state.get(r) {
                        Obj::List(l) => l.items.clone(),
                        _ => return Err(runtime_error(state, "Can only unpack a list")),
                    },
                    _ => return Err(runtime_error(state, "Can only unpack a list")),
                };
                for i in 0..before {
                    state.stack.push(items.get(i).copied().unwrap_or(Value::Null));
                }
                let rest_end = items.len().saturating_sub(after);
                let rest: Vec<Value> = if rest_end > before { items[before..rest_end].to_vec() } else { Vec::new() };
                let rest_list = state.new_list(rest);
                state.stack.push(Value::Object(rest_list));
                for i in 0..after {
                    let idx = items.len().saturating_sub(after).saturating_add(i);
                    state.stack.push(items.get(idx).copied().unwrap_or(Value::Null));
                }
            }
            OpCode::Subscript => subscript(state)?,
            OpCode::SubscriptStore => subscript_store(state, true)?,
            OpCode::SubscriptPush => subscript_store(state, false)?,
            OpCode::Is => {
                let class_v = state.stack.pop();
                let v = state.stack.pop();
                let class_ref = match class_v {
                    Value::Object(r) if matches!(state.get(r), Obj::Class(_)) => r,
                    _ => return Err(runtime_error(state, "Right-hand side of 'is' must be a class")),
                };
                let result = match v {
                    Value::Object(r) => match state.get(r) {
                        Obj::Instance(inst) => {
                            let mut k = Some(inst.class);
                            let mut found = false;
                            while let Some(cur) = k {
                                if cur == class_ref {
                                    found = true;
                                    break;
                                }
                                k = match state.get(cur) {
                                    Obj::Class(c) => c.super_class,
                                    _ => unreachable!(),
                                };
                            }
                            found
                        }
                        _ => false,
                    },
                    _ => false,
                };
                state.stack.push(Value::Bool(result));
            }
            OpCode::In => in_op(state)?,
            OpCode::Equal => op_equal(state)?,
            OpCode::Greater => binary_op(state, ">", |a, b| BinResult::Bool(a > b))?,
            OpCode::GreaterEqual => binary_op(state, ">=", |a, b| BinResult::Bool(a >= b))?,
            OpCode::Less => binary_op(state, "<", |a, b| BinResult::Bool(a < b))?,
            OpCode::LessEqual => binary_op(state, "<=", |a, b| BinResult::Bool(a <= b))?,
            OpCode::Add => op_add(state)?,
            OpCode::Subtract => binary_op(state, "-", |a, b| BinResult::Number(a - b))?,
            OpCode::Multiply => op_multiply(state)?,
            OpCode::Divide => binary_op(state, "/", |a, b| BinResult::Number(a / b))?,
            OpCode::Mod => op_mod(state)?,
            OpCode::Pow => op_pow(state)?,
            OpCode::BAnd => bitwise_op(state, "&", |a, b| a & b)?,
            OpCode::BOr => bitwise_op(state, "|", |a, b| a | b)?,
            OpCode::BXor => bitwise_op(state, "^", |a, b| a ^ b)?,
            OpCode::LShift => bitwise_op(state, "<<", |a, b| a << (b & 63))?,
            OpCode::RShift => bitwise_op(state, ">>", |a, b| a >> (b & 63))?,
            OpCode::BNot => {
                let v = state.stack.pop();
                match v.as_number() {
                    Some(n) => state.stack.push(Value::Number(!(n as i64) as f64)),
                    None => return Err(runtime_error(state, format!("Attempt to use '~' operator with {}", state.type_name(v)))),
                }
            }
            OpCode::And => {
                let offset = read_short(state);
                let v = state.stack.peek(0);
                if !state.truthy(v) {
                    set_ip(state, current_ip(state) + offset as usize);
                } else {
                    state.stack.pop();
                }
            }
            OpCode::Or => {
                let offset = read_short(state);
                let v = state.stack.peek(0);
                if state.truthy(v) {
                    set_ip(state, current_ip(state) + offset as usize);
                } else {
                    state.stack.pop();
                }
            }
            OpCode::Not => {
                let v = state.stack.pop();
                state.stack.push(Value::Bool(!state.truthy(v)));
            }
            OpCode::Negate => op_negate(state)?,
            OpCode::MultiCase => {
                let count = read_byte(state) as usize;
                op_multi_case(state, count);
            }
            OpCode::CompareJump => {
                let offset = read_short(state);
                let a = state.stack.pop();
                let top = state.stack.peek(0);
                if !state.values_equal(top, a) {
                    set_ip(state, current_ip(state) + offset as usize);
                } else {
                    state.stack.pop();
                }
            }
            OpCode::Jump => {
                let offset = read_short(state);
                set_ip(state, current_ip(state) + offset as usize);
            }
            OpCode::JumpIfFalse => {
                let offset = read_short(state);
                let v = state.stack.peek(0);
                if !state.truthy(v) {
                    set_ip(state, current_ip(state) + offset as usize);
                }
            }
            OpCode::JumpIfNull => {
                let offset = read_short(state);
                let v = state.stack.peek(0);
                if v.is_null() {
                    set_ip(state, current_ip(state) + offset as usize);
                }
            }
            OpCode::Loop => {
                let offset = read_short(state);
                set_ip(state, current_ip(state) - offset as usize);
            }
            OpCode::Call => {
                let argc = read_byte(state) as usize;
                call_value(state, argc)?;
            }
            OpCode::Invoke => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let argc = read_byte(state) as usize;
                invoke(state, name, hash, argc)?;
            }
            OpCode::Super => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let argc = read_byte(state) as usize;
                let superclass = match state.stack.pop() {
                    Value::Object(r) if matches!(state.get(r), Obj::Class(_)) => r,
                    _ => return Err(runtime_error(state, "Superclass must be a class")),
                };
                match lookup_method_flat(state, superclass, name, hash) {
                    Some(method) => call_value_with(state, method, argc)?,
                    None => return Err(runtime_error(state, format!("Undefined property '{}'", str_value(state, name)))),
                }
            }
            OpCode::Closure => {
                let function_val = read_constant(state);
                let function_ref = match function_val {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let upvalue_count = match state.get(function_ref) {
                    Obj::Function(f) => f.upvalue_count,
                    _ => unreachable!(),
                } as usize;
                let frame_slots = current_slots(state);
                let enclosing = current_frame_closure(state);
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = read_byte(state);
                    let index = read_byte(state) as usize;
                    let up = if is_local != 0 {
                        state.capture_upvalue(frame_slots + index)
                    } else {
                        match enclosing {
                            Some(c) => match state.get(c) {
                                Obj::Closure(cl) => cl.upvalues[index],
                                _ => unreachable!(),
                            },
                            None => unreachable!("native frame has no upvalues to copy"),
                        }
                    };
                    upvalues.push(up);
                }
                let closure = state.new_closure(function_ref, upvalues);
                state.stack.push(Value::Object(closure));
            }
            OpCode::CloseUpvalue => {
                let threshold = state.stack.top() - 1;
                state.close_upvalues(threshold);
                state.stack.pop();
            }
            OpCode::Return => {
                let result = state.stack.pop();
                let slots = current_slots(state);
                state.close_upvalues(slots);
                state.stack.frames.pop();
                if state.stack.frames.len() <= outer_depth {
                    state.stack.set_top(outer_base);
                    return Ok(result);
                }
                state.stack.set_top(slots);
                state.stack.push(result);
            }
            OpCode::Class => {
                let name = read_string(state);
                let class = state.new_class(name, None);
                state.stack.push(Value::Object(class));
            }
            OpCode::SetClassVar => {
                let name = read_string(state);
                let hash = name_hash(state, name);
                let value = state.stack.peek(0);
                let class_ref = match state.stack.peek(1) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                if let Obj::Class(c) = state.get_mut(class_ref) {
                    c.statics.set(name, hash, value);
                }
                state.stack.pop();
            }
            OpCode::Inherit => {
                let super_v = state.stack.peek(1);
                let superclass = match super_v {
                    Value::Object(r) if matches!(state.get(r), Obj::Class(_)) => r,
                    _ => return Err(runtime_error(state, "Superclass must be a class")),
                };
                let class_ref = match state.stack.peek(0) {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                if class_ref == superclass {
                    return Err(runtime_error(state, "A class can't inherit from itself"));
                }
                let (super_methods, super_statics) = match state.get(superclass) {
                    Obj::Class(c) => (c.methods.clone(), c.statics.clone()),
                    _ => unreachable!(),
                };
                if let Obj::Class(c) = state.get_mut(class_ref) {
                    c.methods.add_all(&super_methods);
                    c.statics.add_all(&super_statics);
                    c.super_class = Some(superclass);
                }
                state.stack.pop();
            }
            OpCode::Method => {
                let name = read_string(state);
                define_method(state, name);
            }
            OpCode::ExtensionMethod => {
                let name = read_string(state);
                match state.stack.peek(1) {
                    Value::Object(r) if matches!(state.get(r), Obj::Class(_)) => {}
                    _ => return Err(runtime_error(state, "Can only define extension methods on classes")),
                }
                define_method(state, name);
                state.stack.pop();
            }
            OpCode::Import => op_import(state)?,
            OpCode::ImportVariable => match state.last_module {
                Some(m) => state.stack.push(Value::Object(m)),
                None => return Err(runtime_error(state, "No active import")),
            },
            OpCode::ImportFrom => {
                let var_count = read_byte(state) as usize;
                for _ in 0..var_count {
                    let name = read_string(state);
                    let hash = name_hash(state, name);
                    let module = state.last_module.ok_or_else(|| runtime_error(state, "No active import"))?;
                    let value = match state.get(module) {
                        Obj::Module(m) => m.values.get(name, hash),
                        _ => unreachable!(),
                    };
                    match value {
                        Some(v) => state.stack.push(v),
                        None => return Err(runtime_error(state, format!("'{}' not found in module", str_value(state, name)))),
                    }
                }
            }
            OpCode::ImportEnd => {
                state.last_module = current_module(state);
            }
            OpCode::ImportNative => op_import_native(state)?,
            OpCode::ImportNativeVariable => {
                let file_name = read_string(state);
                let var_count = read_byte(state) as usize;
                let key = str_value(state, file_name);
                let module = *state.modules.get(&key).ok_or_else(|| runtime_error(state, "Module not imported"))?;
                for _ in 0..var_count {
                    let name = read_string(state);
                    let hash = name_hash(state, name);
                    let value = match state.get(module) {
                        Obj::Module(m) => m.values.get(name, hash),
                        _ => unreachable!(),
                    };
                    match value {
                        Some(v) => state.stack.push(v),
                        None => return Err(runtime_error(state, format!("'{}' not found in module", str_value(state, name)))),
                    }
                }
            }
            OpCode::End => {}
        }
    }
}

fn op_multi_case(state: &mut State, count: usize) {
    let switch_value = state.stack.peek(count + 1);
    let mut case_value = state.stack.pop();
    for i in 0..count {
        if state.values_equal(switch_value, case_value) {
            for _ in (i + 1)..=count {
                state.stack.pop();
            }
            state.stack.push(case_value);
            return;
        }
        case_value = state.stack.pop();
    }
    state.stack.push(case_value);
}

fn op_import(state: &mut State) -> TeaResult<()> {
    let file_name = read_string(state);
    let key = str_value(state, file_name);
    if let Some(&module_ref) = state.modules.get(&key) {
        state.last_module = Some(module_ref);
        state.stack.push(Value::Null);
        return Ok(());
    }
    let base_dir = current_module(state)
        .and_then(|m| match state.get(m) {
            Obj::Module(mm) => mm.path,
            _ => None,
        })
        .map(|p| str_value(state, p))
        .unwrap_or_default();
    let resolved = {
        let mut loader = state.loader.take();
        let r = loader.as_mut().and_then(|l| l.resolve(&base_dir, &key));
        state.loader = loader;
        r
    };
    let resolved = resolved.ok_or_else(|| runtime_error(state, format!("Could not open file \"{key}\"")))?;
    let closure = {
        let mut loader = state.loader.take();
        let c = loader.as_mut().and_then(|l| l.load(state, &resolved));
        state.loader = loader;
        c
    };
    let closure = closure.ok_or_else(|| runtime_error(state, format!("Could not open file \"{key}\"")))?;
    let function = match state.get(closure) {
        Obj::Closure(c) => c.function,
        _ => unreachable!(),
    };
    let module_ref = match state.get(function) {
        Obj::Function(f) => f.module,
        _ => unreachable!(),
    };
    let module_ref = module_ref.ok_or_else(|| runtime_error(state, "Loaded module has no module object"))?;
    state.modules.insert(resolved, module_ref);
    state.last_module = Some(module_ref);
    call_value_with(state, Value::Object(closure), 0)
}

fn op_import_native(state: &mut State) -> TeaResult<()> {
    let index = read_byte(state) as usize;
    let file_name = read_string(state);
    let key = str_value(state, file_name);
    if let Some(&module_ref) = state.modules.get(&key) {
        state.last_module = Some(module_ref);
        state.stack.push(Value::Object(module_ref));
        return Ok(());
    }
    let builder = *state.native_modules.get(index).ok_or_else(|| runtime_error(state, "No such native module registered"))?;
    let module_ref = builder(state)?;
    state.modules.insert(key, module_ref);
    state.last_module = Some(module_ref);
    state.stack.push(Value::Object(module_ref));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::object::FunctionProto;

    fn script_closure(state: &mut State, build: impl FnOnce(&mut Chunk)) -> GcRef {
        let mut chunk = Chunk::new();
        build(&mut chunk);
        chunk.write_op(OpCode::Return, 1);
        let function = state.new_function(FunctionProto {
            name: None,
            arity: 0,
            arity_optional: 0,
            variadic: false,
            upvalue_count: 0,
            max_slots: 16,
            module: None,
            chunk,
        });
        state.new_closure(function, Vec::new())
    }

    #[test]
    fn arithmetic_precedence_one_plus_two_times_three() {
        let mut state = State::new();
        let closure = script_closure(&mut state, |chunk| {
            let one = chunk.add_constant(Value::Number(1.0));
            let two = chunk.add_constant(Value::Number(2.0));
            let three = chunk.add_constant(Value::Number(3.0));
            chunk.write_op(OpCode::Constant, 1);
            chunk.write(one as u8, 1);
            chunk.write_op(OpCode::Constant, 1);
            chunk.write(two as u8, 1);
            chunk.write_op(OpCode::Constant, 1);
            chunk.write(three as u8, 1);
            chunk.write_op(OpCode::Multiply, 1);
            chunk.write_op(OpCode::Add, 1);
        });
        let result = run(&mut state, closure).unwrap();
        assert_eq!(result, Value::Number(7.0));
    }

    #[test]
    fn list_negative_index_assignment() {
        let mut state = State::new();
        let list = state.new_list(vec![Value::Number(10.0), Value::Number(20.0), Value::Number(30.0)]);
        let closure = script_closure(&mut state, |chunk| {
            let listc = chunk.add_constant(Value::Object(list));
            let idx = chunk.add_constant(Value::Number(-1.0));
            let newval = chunk.add_constant(Value::Number(99.0));
            chunk.write_op(OpCode::Constant, 1);
            chunk.write(listc as u8, 1);
            chunk.write_op(OpCode::Constant, 1);
            chunk.write(idx as u8, 1);
            chunk.write_op(OpCode::Constant, 1);
            chunk.write(newval as u8, 1);
            chunk.write_op(OpCode::SubscriptStore, 1);
            chunk.write_op(OpCode::Pop, 1);
            chunk.write_op(OpCode::Null, 1);
        });
        run(&mut state, closure).unwrap();
        let items = match state.get(list) {
            Obj::List(l) => l.items.clone(),
            _ => unreachable!(),
        };
        assert_eq!(items, vec![Value::Number(10.0), Value::Number(20.0), Value::Number(99.0)]);
    }

    #[test]
    fn map_union_and_membership() {
        let mut state = State::new();
        let key_a = state.new_string("a");
        let map = state.new_map();
        let mut entries = match state.get_mut(map) {
            Obj::Map(m) => std::mem::take(&mut m.entries),
            _ => unreachable!(),
        };
        entries.set(&state.heap, Value::Object(key_a), Value::Number(1.0));
        if let Obj::Map(m) = state.get_mut(map) {
            m.entries = entries;
        }
        let closure = script_closure(&mut state, |chunk| {
            let mapc = chunk.add_constant(Value::Object(map));
            let keyc = chunk.add_constant(Value::Object(key_a));
            chunk.write_op(OpCode::Constant, 1);
            chunk.write(keyc as u8, 1);
            chunk.write_op(OpCode::Constant, 1);
            chunk.write(mapc as u8, 1);
            chunk.write_op(OpCode::In, 1);
        });
        let result = run(&mut state, closure).unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn gc_collects_unreachable_closures() {
        let config = crate::gc::GcConfig { stress_mode: true, ..crate::gc::GcConfig::default() };
        let mut state = State::with_config(config);
        let closure = script_closure(&mut state, |chunk| {
            chunk.write_op(OpCode::Null, 1);
        });
        run(&mut state, closure).unwrap();
        crate::gc::collect_garbage(&mut state);
        assert_eq!(state.stack.top(), 0);
    }
}
