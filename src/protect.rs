//! Protected calls (§7 / embedding API `pcall`).
//!
//! The original walks a `setjmp`/`longjmp` pair (`teaD_rawrunprotected`,
//! `teaD_pcall`) to unwind the C stack back to a checkpoint on error. Rust
//! already has that escape hatch in `Result`/`?`; all this module adds is
//! the bookkeeping `teaD_pcall` did alongside the jump: restoring the
//! operand stack, call-frame count, open-upvalue chain and embedding-API
//! base to their pre-call snapshot, and guarding nested reentry depth
//! (`TEA_MAX_CCALLS`).

use crate::error::{TeaError, TeaResult};
use crate::state::State;

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    top: usize,
    frame_count: usize,
    open_upvalue_count: usize,
    base: usize,
}

/// Nested-reentry counter; the restore itself needs no state since `?`
/// already unwinds the Rust call stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct Protection {
    depth: usize,
}

impl State {
    /// Run `body`, restoring stack/frame/upvalue/base state if it errors —
    /// the idiomatic-Rust analogue of `teaD_pcall`.
    pub fn protected_call<T>(&mut self, body: impl FnOnce(&mut State) -> TeaResult<T>) -> TeaResult<T> {
        if self.protection.depth >= self.heap.config().max_c_calls {
            return Err(TeaError::runtime("C stack overflow"));
        }
        self.protection.depth += 1;
        let snapshot = Snapshot {
            top: self.stack.top(),
            frame_count: self.stack.frames.len(),
            open_upvalue_count: self.open_upvalues.len(),
            base: self.base,
        };
        let result = body(self);
        self.protection.depth -= 1;
        if result.is_err() {
            self.stack.set_top(snapshot.top);
            self.stack.frames.truncate(snapshot.frame_count);
            self.open_upvalues.truncate(snapshot.open_upvalue_count);
            self.base = snapshot.base;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn restores_stack_on_error() {
        let mut state = State::new();
        state.stack.push(Value::Number(1.0));
        let before = state.stack.top();
        state.stack.push(Value::Number(2.0));
        let result: TeaResult<()> = state.protected_call(|s| {
            s.stack.push(Value::Number(3.0));
            Err(TeaError::runtime("boom"))
        });
        assert!(result.is_err());
        assert_eq!(state.stack.top(), before + 1);
    }

    #[test]
    fn nested_depth_is_bounded() {
        let mut state = State::new();
        state.heap.config();
        fn recurse(s: &mut State, depth: usize) -> TeaResult<usize> {
            if depth == 0 {
                return Ok(0);
            }
            s.protected_call(|s| recurse(s, depth - 1))
        }
        let result = recurse(&mut state, 300);
        assert!(result.is_err());
    }
}
