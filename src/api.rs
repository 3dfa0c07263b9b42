//! §6 Embedding API: the host-facing stack-index surface.
//!
//! Grounded directly in `tea.h`'s `tea_*` functions: every operation reads
//! or writes a value by a 1-based index relative to the active call's
//! argument base (positive, counting from the bottom) or the stack top
//! (negative, counting from the top) — `index_to_abs` below is
//! `tea_api.c`'s `index2addr`. A native (`NativeFn`) only ever sees this
//! surface; it never touches `state.stack` directly.

use crate::error::TeaError;
use crate::object::{GcRef, NativeKind, Obj};
use crate::state::State;
use crate::value::Value;

/// Resolve a host-facing index to an absolute stack slot, the way
/// `index2addr` resolves `tea_check_number(T, 1)` et al. relative to the
/// active native's argument window (`state.base`).
fn index_to_abs(state: &State, index: i32) -> usize {
    if index > 0 {
        state.base + (index as usize - 1)
    } else {
        (state.stack.top() as i64 + index as i64) as usize
    }
}

impl State {
    // ---- stack shape (`tea_get_top`/`tea_set_top`/`tea_push_value`/etc.) ----

    pub fn api_get_top(&self) -> i32 {
        (self.stack.top() - self.base) as i32
    }

    pub fn api_set_top(&mut self, index: i32) {
        let abs = index_to_abs(self, index);
        if abs + 1 >= self.stack.top() {
            while self.stack.top() <= abs {
                self.stack.push(Value::Null);
            }
        } else {
            self.stack.set_top(abs + 1);
        }
    }

    pub fn api_push_value(&mut self, index: i32) {
        let abs = index_to_abs(self, index);
        let v = self.stack.values[abs];
        self.stack.push(v);
    }

    pub fn api_remove(&mut self, index: i32) {
        let abs = index_to_abs(self, index);
        self.stack.values.remove(abs);
    }

    pub fn api_insert(&mut self, index: i32) {
        let abs = index_to_abs(self, index);
        let v = self.stack.pop();
        self.stack.values.insert(abs, v);
    }

    pub fn api_replace(&mut self, index: i32) {
        let abs = index_to_abs(self, index);
        let v = self.stack.pop();
        self.stack.values[abs] = v;
    }

    pub fn api_copy(&mut self, from_index: i32, to_index: i32) {
        let from = index_to_abs(self, from_index);
        let to = index_to_abs(self, to_index);
        self.stack.values[to] = self.stack.values[from];
    }

    pub fn api_pop(&mut self, n: usize) {
        let top = self.stack.top();
        self.stack.set_top(top - n);
    }

    // ---- type queries (`tea_type`/`tea_type_name`) ----

    pub fn api_type_name(&self, index: i32) -> &'static str {
        let abs = index_to_abs(self, index);
        self.type_name(self.stack.values[abs])
    }

    pub fn api_is_null(&self, index: i32) -> bool {
        let abs = index_to_abs(self, index);
        self.stack.values[abs].is_null()
    }

    // ---- raw getters (`tea_get_number`/`tea_get_bool`/`tea_get_lstring`) ----

    pub fn api_get_number(&self, index: i32) -> f64 {
        let abs = index_to_abs(self, index);
        self.stack.values[abs].as_number().unwrap_or(0.0)
    }

    pub fn api_get_bool(&self, index: i32) -> bool {
        let abs = index_to_abs(self, index);
        self.truthy(self.stack.values[abs])
    }

    pub fn api_get_string(&self, index: i32) -> Option<String> {
        let abs = index_to_abs(self, index);
        match self.stack.values[abs] {
            Value::Object(r) => match self.get(r) {
                Obj::Str(s) => Some(s.as_str().to_string()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn api_get_range(&self, index: i32) -> Option<(f64, f64, f64)> {
        let abs = index_to_abs(self, index);
        match self.stack.values[abs] {
            Value::Object(r) => match self.get(r) {
                Obj::Range(range) => Some((range.start, range.end, range.step)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn api_equals(&self, index1: i32, index2: i32) -> bool {
        let a = self.stack.values[index_to_abs(self, index1)];
        let b = self.stack.values[index_to_abs(self, index2)];
        self.values_equal(a, b)
    }

    // ---- pushers (`tea_push_*`) ----

    pub fn api_push_null(&mut self) {
        self.stack.push(Value::Null);
    }

    pub fn api_push_bool(&mut self, b: bool) {
        self.stack.push(Value::Bool(b));
    }

    pub fn api_push_number(&mut self, n: f64) {
        self.stack.push(Value::Number(n));
    }

    pub fn api_push_string(&mut self, s: &str) {
        let r = self.new_string(s);
        self.stack.push(Value::Object(r));
    }

    pub fn api_push_range(&mut self, start: f64, end: f64, step: f64) {
        let r = self.new_range(start, end, step);
        self.stack.push(Value::Object(r));
    }

    pub fn api_push_cfunction(&mut self, name: &str, func: crate::object::NativeFn) {
        let r = self.new_native(NativeKind::Function, name, func);
        self.stack.push(Value::Object(r));
    }

    // ---- aggregates (`tea_new_list`/`tea_new_map`/`tea_new_userdata`) ----

    pub fn api_new_list(&mut self) {
        let r = self.new_list(Vec::new());
        self.stack.push(Value::Object(r));
    }

    pub fn api_new_map(&mut self) {
        let r = self.new_map();
        self.stack.push(Value::Object(r));
    }

    pub fn api_new_userdata(&mut self, data: Box<dyn std::any::Any>, size: usize) -> GcRef {
        let r = self.alloc(Obj::Userdata(crate::object::UserdataObj { data, size }), &[]);
        self.stack.push(Value::Object(r));
        r
    }

    // ---- list/map item access (`tea_add_item`/`tea_get_item`/`tea_set_item`) ----

    /// Pop the top of stack, append it to the list at `list_index`
    /// (`tea_add_item`).
    pub fn api_add_item(&mut self, list_index: i32) -> Result<(), TeaError> {
        let abs = index_to_abs(self, list_index);
        let v = self.stack.pop();
        match self.stack.values[abs] {
            Value::Object(r) => match self.get_mut(r) {
                Obj::List(l) => {
                    l.items.push(v);
                    Ok(())
                }
                _ => Err(TeaError::runtime("not a list")),
            },
            _ => Err(TeaError::runtime("not a list")),
        }
    }

    /// Push `list[index]`, or null if out of range (`tea_get_item`'s
    /// no-raise semantics).
    pub fn api_get_item(&mut self, list_index: i32, index: i64) {
        let abs = index_to_abs(self, list_index);
        let v = match self.stack.values[abs] {
            Value::Object(r) => match self.get(r) {
                Obj::List(l) => {
                    let i = if index < 0 { index + l.items.len() as i64 } else { index };
                    if i >= 0 && (i as usize) < l.items.len() { l.items[i as usize] } else { Value::Null }
                }
                _ => Value::Null,
            },
            _ => Value::Null,
        };
        self.stack.push(v);
    }

    /// Pop the top of stack and store it at `list[index]` (`tea_set_item`).
    pub fn api_set_item(&mut self, list_index: i32, index: i64) -> Result<(), TeaError> {
        let abs = index_to_abs(self, list_index);
        let v = self.stack.pop();
        match self.stack.values[abs] {
            Value::Object(r) => match self.get_mut(r) {
                Obj::List(l) => {
                    let i = if index < 0 { index + l.items.len() as i64 } else { index };
                    if i >= 0 && (i as usize) < l.items.len() {
                        l.items[i as usize] = v;
                        Ok(())
                    } else {
                        Err(TeaError::runtime("list index out of bounds"))
                    }
                }
                _ => Err(TeaError::runtime("not a list")),
            },
            _ => Err(TeaError::runtime("not a list")),
        }
    }

    /// `tea_get_field`: pop key, push `map[key]` or null on a miss — never
    /// raises (Open Question 1's resolution), unlike the `SUBSCRIPT` opcode.
    pub fn api_get_field(&mut self, map_index: i32) {
        let abs = index_to_abs(self, map_index);
        let key = self.stack.pop();
        let v = match self.stack.values[abs] {
            Value::Object(r) => match self.get(r) {
                Obj::Map(m) => m.entries.get(&self.heap, key).unwrap_or(Value::Null),
                _ => Value::Null,
            },
            _ => Value::Null,
        };
        self.stack.push(v);
    }

    /// `tea_set_field`: pop value then key, store `map[key] = value`.
    pub fn api_set_field(&mut self, map_index: i32) -> Result<(), TeaError> {
        let abs = index_to_abs(self, map_index);
        let value = self.stack.pop();
        let key = self.stack.pop();
        let mut entries = match self.stack.values[abs] {
            Value::Object(r) => match self.get_mut(r) {
                Obj::Map(m) => std::mem::take(&mut m.entries),
                _ => return Err(TeaError::runtime("not a map")),
            },
            _ => return Err(TeaError::runtime("not a map")),
        };
        entries.set(&self.heap, key, value);
        if let Value::Object(r) = self.stack.values[abs] {
            if let Obj::Map(m) = self.get_mut(r) {
                m.entries = entries;
            }
        }
        Ok(())
    }

    pub fn api_get_key(&mut self, map_index: i32, key: &str) {
        let key_ref = self.new_string(key);
        self.stack.push(Value::Object(key_ref));
        self.api_get_field(map_index);
    }

    pub fn api_set_key(&mut self, map_index: i32, key: &str) -> Result<(), TeaError> {
        let key_ref = self.new_string(key);
        let v = self.stack.pop();
        self.stack.push(Value::Object(key_ref));
        self.stack.push(v);
        self.api_set_field(map_index)
    }

    pub fn api_len(&self, index: i32) -> i32 {
        let abs = index_to_abs(self, index);
        match self.stack.values[abs] {
            Value::Object(r) => match self.get(r) {
                Obj::List(l) => l.items.len() as i32,
                Obj::Map(m) => m.entries.len() as i32,
                Obj::Str(s) => s.as_str().chars().count() as i32,
                Obj::Range(range) => range.len() as i32,
                _ => 0,
            },
            _ => 0,
        }
    }

    // ---- globals/modules (`tea_get_global`/`tea_set_global`/`tea_set_funcs`) ----

    pub fn api_get_global(&mut self, name: &str) -> bool {
        let r = self.new_string(name);
        let hash = match self.get(r) {
            Obj::Str(s) => s.hash,
            _ => unreachable!(),
        };
        match self.globals.get(r, hash) {
            Some(v) => {
                self.stack.push(v);
                true
            }
            None => {
                self.stack.push(Value::Null);
                false
            }
        }
    }

    pub fn api_set_global(&mut self, name: &str) {
        let r = self.new_string(name);
        let hash = match self.get(r) {
            Obj::Str(s) => s.hash,
            _ => unreachable!(),
        };
        let v = self.stack.pop();
        self.globals.set(r, hash, v);
    }

    pub fn api_set_funcs(&mut self, funcs: &[(&str, crate::object::NativeFn)]) {
        for &(name, func) in funcs {
            let r = self.new_native(NativeKind::Function, name, func);
            self.stack.push(Value::Object(r));
            self.api_set_global(name);
        }
    }

    pub fn api_has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    // ---- checked getters (`tea_check_*`) ----

    pub fn api_check_number(&self, index: i32) -> Result<f64, TeaError> {
        let abs = index_to_abs(self, index);
        self.stack.values[abs].as_number().ok_or_else(|| TeaError::runtime("expected a number"))
    }

    pub fn api_check_bool(&self, index: i32) -> Result<bool, TeaError> {
        let abs = index_to_abs(self, index);
        self.stack.values[abs].as_bool().ok_or_else(|| TeaError::runtime("expected a bool"))
    }

    pub fn api_check_string(&self, index: i32) -> Result<String, TeaError> {
        self.api_get_string(index).ok_or_else(|| TeaError::runtime("expected a string"))
    }

    pub fn api_check_range(&self, index: i32) -> Result<(f64, f64, f64), TeaError> {
        self.api_get_range(index).ok_or_else(|| TeaError::runtime("expected a range"))
    }

    // ---- optional getters (`tea_opt_*`) ----

    pub fn api_opt_number(&self, index: i32, default: f64) -> f64 {
        if self.api_is_null(index) { default } else { self.api_check_number(index).unwrap_or(default) }
    }

    pub fn api_opt_bool(&self, index: i32, default: bool) -> bool {
        if self.api_is_null(index) { default } else { self.api_check_bool(index).unwrap_or(default) }
    }

    pub fn api_opt_string(&self, index: i32, default: &str) -> String {
        if self.api_is_null(index) { default.to_string() } else { self.api_check_string(index).unwrap_or_else(|_| default.to_string()) }
    }

    /// `tea_check_option`: validate a string argument against a fixed set,
    /// returning its position in `options` (stdlib modules use this for
    /// enum-like string arguments, e.g. file open mode).
    pub fn api_check_option(&self, index: i32, default: &str, options: &[&str]) -> Result<usize, TeaError> {
        let value = self.api_opt_string(index, default);
        options.iter().position(|o| *o == value).ok_or_else(|| TeaError::runtime(format!("invalid option '{value}'")))
    }

    // ---- GC control (`tea_gc`) ----

    pub fn api_gc(&mut self) {
        crate::gc::collect_garbage(self);
    }

    // ---- invocation (`tea_call`) ----

    /// Call whatever sits `n` slots below the current top (the callee,
    /// followed by its `n` arguments), replacing the whole window with the
    /// single result (`tea_call`).
    pub fn api_call(&mut self, n: usize) -> Result<(), TeaError> {
        self.protected_call(|state| crate::vm::call_from_api(state, n))
    }

    /// `tea_error`: raise a runtime error carrying the top-of-stack message,
    /// for a native to call instead of returning `Ok(())`.
    pub fn api_error(&self, message: impl Into<String>) -> TeaError {
        TeaError::runtime(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NativeKind;

    fn double_native(state: &mut State) -> crate::error::TeaResult<()> {
        let n = state.api_check_number(1)?;
        state.api_push_number(n * 2.0);
        Ok(())
    }

    #[test]
    fn push_and_check_number_round_trip() {
        let mut state = State::new();
        state.api_push_number(42.0);
        assert_eq!(state.api_get_number(-1), 42.0);
    }

    #[test]
    fn list_add_and_get_item() {
        let mut state = State::new();
        state.api_new_list();
        state.api_push_number(1.0);
        state.api_add_item(-2).unwrap();
        state.api_get_item(-1, 0);
        assert_eq!(state.api_get_number(-1), 1.0);
    }

    #[test]
    fn call_native_through_api() {
        let mut state = State::new();
        state.api_push_cfunction("double", double_native);
        state.api_push_number(21.0);
        state.api_call(1).unwrap();
        assert_eq!(state.api_get_number(-1), 42.0);
    }
}
