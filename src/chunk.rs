//! §4.1 Chunk & line table, and the opcode set dispatched by §4.10.
//!
//! Grounded directly in `vm/tea_chunk.c` and the `CASE_CODE` list in
//! `tea_vm.c`: a chunk is a byte buffer of opcodes/operands, a constants
//! pool, and a line table compressed by only appending a new `(offset,
//! line)` run when the line changes, looked up by binary search.

use crate::value::Value;
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum OpCode {
    Constant,
    ConstantLong,
    Null,
    True,
    False,
    Dup,
    Pop,
    PopRepl,

    GetLocal,
    SetLocal,
    GetUpvalue,
    SetUpvalue,
    GetGlobal,
    SetGlobal,
    DefineGlobal,
    GetModule,
    SetModule,
    DefineModule,
    DefineOptional,

    GetProperty,
    GetPropertyNoPop,
    SetProperty,
    GetSuper,

    Range,
    List,
    Map,
    Enum,
    UnpackList,
    UnpackRestList,

    Subscript,
    SubscriptStore,
    SubscriptPush,

    Is,
    In,

    Equal,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Pow,
    BAnd,
    BOr,
    BNot,
    BXor,
    LShift,
    RShift,

    And,
    Or,
    Not,
    Negate,

    MultiCase,
    CompareJump,
    Jump,
    JumpIfFalse,
    JumpIfNull,
    Loop,

    Call,
    Invoke,
    Super,

    Closure,
    CloseUpvalue,
    Return,

    Class,
    SetClassVar,
    Inherit,
    Method,
    ExtensionMethod,

    Import,
    ImportVariable,
    ImportFrom,
    ImportEnd,
    ImportNative,
    ImportNativeVariable,

    End,
}

/// One run in the compressed line table: bytecode offset where a source
/// line begins.
#[derive(Debug, Clone, Copy)]
struct LineStart {
    offset: u32,
    line: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<LineStart>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Append one byte, recording a new line-table run only when the line
    /// number changes (`tea_write_chunk`).
    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        if let Some(last) = self.lines.last() {
            if last.line == line {
                return;
            }
        }
        self.lines.push(LineStart { offset: (self.code.len() - 1) as u32, line });
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op.into(), line);
    }

    /// Append `value` to the constants pool and return its index
    /// (`tea_add_constant`). The caller is responsible for anchoring
    /// `value` on the operand stack first if it is a fresh heap allocation,
    /// exactly as `tea_add_constant` pushes/pops around the array write so
    /// a GC triggered by the growth can't collect it.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Binary search over the line-start runs (`tea_get_line`).
    pub fn line_for_offset(&self, instruction: usize) -> u32 {
        if self.lines.is_empty() {
            return 0;
        }
        let mut start = 0usize;
        let mut end = self.lines.len() - 1;
        loop {
            let mid = (start + end) / 2;
            let entry = self.lines[mid];
            if (instruction as u32) < entry.offset {
                if mid == 0 {
                    return entry.line;
                }
                end = mid - 1;
            } else if mid == self.lines.len() - 1 || (instruction as u32) < self.lines[mid + 1].offset {
                return entry.line;
            } else {
                start = mid + 1;
            }
        }
    }
}
