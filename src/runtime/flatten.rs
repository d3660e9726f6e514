// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Precomputes branch targets for a function body's control instructions.
//!
//! The interpreter executes directly off a function's [`Expression`] bytes,
//! reading operands lazily through a [`Reader`] rather than walking a
//! separate instruction array. That works for straight-line code and for
//! forward progress through a `Block`/`Loop`/`If`, but a taken branch needs
//! to know *where to seek to* without re-scanning the enclosing structure on
//! every jump. This module does that scan once, ahead of time, and caches
//! the result: a sparse table from a control opcode's byte offset to its
//! resolved continuation.

use crate::Allocator;
use crate::bytecode::Reader;
use crate::core_compat::vec::Vec;
use crate::types::{BlockType, Expression, Opcode};
use crate::Module;

/// What's needed to resume execution from a `Block`/`Loop`/`If` once a
/// branch targets it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Continuation {
    /// Number of operand types this frame's signature takes as parameters.
    /// The label arity for a `loop` (branching here re-enters with these).
    pub(crate) param_arity: usize,
    /// Number of operand types this frame's signature produces. The label
    /// arity for a `block`/`if` (branching here exits with these).
    pub(crate) result_arity: usize,
    /// Byte offset just past this frame's matching `End`, i.e. where a
    /// `block`/`if` branch or a natural fallthrough resumes.
    pub(crate) end: usize,
    /// For `if` frames with an `else` clause, the byte offset of that
    /// `Else` opcode — where execution resumes if the condition is false.
    /// `None` for `block`/`loop` frames, and for `if` frames without one.
    pub(crate) else_target: Option<usize>,
}

/// Sorted by byte offset; looked up by binary search.
pub(crate) struct FlatCode<A: Allocator> {
    entries: Vec<(usize, Continuation), A>,
}

impl<A: Allocator> FlatCode<A> {
    /// Looks up the continuation recorded for the `Block`/`Loop`/`If` opcode
    /// at `offset`.
    pub(crate) fn continuation_at(&self, offset: usize) -> &Continuation {
        let idx = self
            .entries
            .binary_search_by_key(&offset, |(key, _)| *key)
            .expect("offset is a scanned control opcode");
        &self.entries[idx].1
    }
}

// An in-progress scan frame: we know where it started and whether it's an
// `if`, but its `end` (and, for `if`, its `else`) aren't known until the
// scan reaches them.
struct OpenFrame {
    start: usize,
    param_arity: usize,
    result_arity: usize,
    is_if: bool,
    else_target: Option<usize>,
}

pub(crate) fn flatten<A: Allocator + Clone>(module: &Module<A>, expr: &Expression<A>, alloc: A) -> FlatCode<A> {
    let mut entries = Vec::new_in(alloc.clone());
    let mut open: std::vec::Vec<OpenFrame> = std::vec::Vec::new();

    let mut reader = Reader::new(expr);
    loop {
        let offset = reader.pos();
        let op = reader.read_opcode();
        match op {
            Opcode::Block | Opcode::Loop | Opcode::If => {
                let bt = reader.read_block_type();
                let (param_arity, result_arity) = block_arity(module, bt);
                if op == Opcode::If {
                    open.push(OpenFrame {
                        start: offset,
                        param_arity,
                        result_arity,
                        is_if: true,
                        else_target: None,
                    });
                } else {
                    open.push(OpenFrame {
                        start: offset,
                        param_arity,
                        result_arity,
                        is_if: false,
                        else_target: None,
                    });
                }
            }
            Opcode::Else => {
                let frame = open.last_mut().expect("else only appears inside an if");
                debug_assert!(frame.is_if);
                frame.else_target = Some(offset);
            }
            Opcode::End => match open.pop() {
                Some(frame) => {
                    entries.push((
                        frame.start,
                        Continuation {
                            param_arity: frame.param_arity,
                            result_arity: frame.result_arity,
                            end: reader.pos(),
                            else_target: frame.else_target,
                        },
                    ));
                }
                None => break, // the function body's own closing `End`.
            },
            _ => skip_operand(&mut reader, op),
        }
    }

    entries.sort_unstable_by_key(|(offset, _)| *offset);
    FlatCode { entries }
}

pub(crate) fn block_arity<A: Allocator>(module: &Module<A>, bt: BlockType) -> (usize, usize) {
    match bt {
        BlockType::Empty => (0, 0),
        BlockType::Result(_) => (0, 1),
        BlockType::TypeIndex(idx) => {
            let ty = &module.typesec[*idx as usize];
            (ty.parameters.len(), ty.results.len())
        }
    }
}

// Advances `reader` past the operand(s) of a non-control opcode, mirroring
// exactly the read order `crate::validate::expr` and `crate::decode::expr`
// use for the same opcode.
fn skip_operand(reader: &mut Reader<'_>, op: Opcode) {
    match op {
        Opcode::Unreachable
        | Opcode::Nop
        | Opcode::Return
        | Opcode::Drop
        | Opcode::Select
        | Opcode::I32Eqz
        | Opcode::I32Eq
        | Opcode::I32Ne
        | Opcode::I32LtS
        | Opcode::I32LtU
        | Opcode::I32GtS
        | Opcode::I32GtU
        | Opcode::I32LeS
        | Opcode::I32LeU
        | Opcode::I32GeS
        | Opcode::I32GeU
        | Opcode::I64Eqz
        | Opcode::I64Eq
        | Opcode::I64Ne
        | Opcode::I64LtS
        | Opcode::I64LtU
        | Opcode::I64GtS
        | Opcode::I64GtU
        | Opcode::I64LeS
        | Opcode::I64LeU
        | Opcode::I64GeS
        | Opcode::I64GeU
        | Opcode::F32Eq
        | Opcode::F32Ne
        | Opcode::F32Lt
        | Opcode::F32Gt
        | Opcode::F32Le
        | Opcode::F32Ge
        | Opcode::F64Eq
        | Opcode::F64Ne
        | Opcode::F64Lt
        | Opcode::F64Gt
        | Opcode::F64Le
        | Opcode::F64Ge
        | Opcode::I32Clz
        | Opcode::I32Ctz
        | Opcode::I32Popcnt
        | Opcode::I32Add
        | Opcode::I32Sub
        | Opcode::I32Mul
        | Opcode::I32DivS
        | Opcode::I32DivU
        | Opcode::I32RemS
        | Opcode::I32RemU
        | Opcode::I32And
        | Opcode::I32Or
        | Opcode::I32Xor
        | Opcode::I32Shl
        | Opcode::I32ShrS
        | Opcode::I32ShrU
        | Opcode::I32Rotl
        | Opcode::I32Rotr
        | Opcode::I64Clz
        | Opcode::I64Ctz
        | Opcode::I64Popcnt
        | Opcode::I64Add
        | Opcode::I64Sub
        | Opcode::I64Mul
        | Opcode::I64DivS
        | Opcode::I64DivU
        | Opcode::I64RemS
        | Opcode::I64RemU
        | Opcode::I64And
        | Opcode::I64Or
        | Opcode::I64Xor
        | Opcode::I64Shl
        | Opcode::I64ShrS
        | Opcode::I64ShrU
        | Opcode::I64Rotl
        | Opcode::I64Rotr
        | Opcode::F32Abs
        | Opcode::F32Neg
        | Opcode::F32Ceil
        | Opcode::F32Floor
        | Opcode::F32Trunc
        | Opcode::F32Nearest
        | Opcode::F32Sqrt
        | Opcode::F32Add
        | Opcode::F32Sub
        | Opcode::F32Mul
        | Opcode::F32Div
        | Opcode::F32Min
        | Opcode::F32Max
        | Opcode::F32Copysign
        | Opcode::F64Abs
        | Opcode::F64Neg
        | Opcode::F64Ceil
        | Opcode::F64Floor
        | Opcode::F64Trunc
        | Opcode::F64Nearest
        | Opcode::F64Sqrt
        | Opcode::F64Add
        | Opcode::F64Sub
        | Opcode::F64Mul
        | Opcode::F64Div
        | Opcode::F64Min
        | Opcode::F64Max
        | Opcode::F64Copysign
        | Opcode::I32WrapI64
        | Opcode::I32TruncF32S
        | Opcode::I32TruncF32U
        | Opcode::I32TruncF64S
        | Opcode::I32TruncF64U
        | Opcode::I64ExtendI32S
        | Opcode::I64ExtendI32U
        | Opcode::I64TruncF32S
        | Opcode::I64TruncF32U
        | Opcode::I64TruncF64S
        | Opcode::I64TruncF64U
        | Opcode::F32ConvertI32S
        | Opcode::F32ConvertI32U
        | Opcode::F32ConvertI64S
        | Opcode::F32ConvertI64U
        | Opcode::F32DemoteF64
        | Opcode::F64ConvertI32S
        | Opcode::F64ConvertI32U
        | Opcode::F64ConvertI64S
        | Opcode::F64ConvertI64U
        | Opcode::F64PromoteF32
        | Opcode::I32ReinterpretF32
        | Opcode::I64ReinterpretF64
        | Opcode::F32ReinterpretI32
        | Opcode::F64ReinterpretI64
        | Opcode::I32Extend8S
        | Opcode::I32Extend16S
        | Opcode::I64Extend8S
        | Opcode::I64Extend16S
        | Opcode::I64Extend32S
        | Opcode::MemorySize
        | Opcode::MemoryGrow => {}

        Opcode::Br | Opcode::BrIf | Opcode::Call | Opcode::LocalGet
        | Opcode::LocalSet | Opcode::LocalTee | Opcode::GlobalGet | Opcode::GlobalSet => {
            reader.read_u32();
        }

        Opcode::BrTable => {
            let len = reader.read_vec_len();
            for _ in 0..len {
                reader.read_label_idx_raw();
            }
            reader.read_label_idx_raw();
        }
        Opcode::CallIndirect => {
            reader.read_call_indirect();
        }
        Opcode::SelectT => {
            let len = reader.read_vec_len();
            for _ in 0..len {
                reader.read_val_type();
            }
        }

        Opcode::I32Load
        | Opcode::I64Load
        | Opcode::F32Load
        | Opcode::F64Load
        | Opcode::I32Load8S
        | Opcode::I32Load8U
        | Opcode::I32Load16S
        | Opcode::I32Load16U
        | Opcode::I64Load8S
        | Opcode::I64Load8U
        | Opcode::I64Load16S
        | Opcode::I64Load16U
        | Opcode::I64Load32S
        | Opcode::I64Load32U
        | Opcode::I32Store
        | Opcode::I64Store
        | Opcode::F32Store
        | Opcode::F64Store
        | Opcode::I32Store8
        | Opcode::I32Store16
        | Opcode::I64Store8
        | Opcode::I64Store16
        | Opcode::I64Store32 => {
            reader.read_mem_arg();
        }

        Opcode::I32Const => {
            reader.read_i32();
        }
        Opcode::I64Const => {
            reader.read_i64();
        }
        Opcode::F32Const => {
            reader.read_f32();
        }
        Opcode::F64Const => {
            reader.read_f64();
        }

        Opcode::BulkPrefix => skip_bulk_operand(reader),

        Opcode::Block | Opcode::Loop | Opcode::If | Opcode::Else | Opcode::End => {
            unreachable!("handled by the caller")
        }
        Opcode::VectorPrefix => unreachable!("rejected at decode time"),
    }
}

fn skip_bulk_operand(reader: &mut Reader<'_>) {
    // Every supported 0xfc opcode (the saturating truncations) takes no
    // operand.
    let _ = reader.read_bulk_opcode();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_compat::alloc::Global;
    use crate::decode::NoCustomSectionVisitor;
    use crate::storage::Buffer;

    // (func
    //   (block
    //     (loop
    //       (if (i32.const 0) (then (br 0)) (else (br 1)))
    //       (br 1))))
    fn module_bytes() -> std::vec::Vec<u8> {
        vec![
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type section: () -> ()
            0x03, 0x02, 0x01, 0x00, // function section
            0x0a, 0x16, 0x01, // code section, 1 function
            0x14, 0x00, // body size 20, 0 locals
            0x02, 0x40, // block
            0x03, 0x40, // loop
            0x41, 0x00, // i32.const 0
            0x04, 0x40, // if
            0x0c, 0x00, // br 0
            0x05, // else
            0x0c, 0x01, // br 1
            0x0b, // end (if)
            0x0c, 0x01, // br 1
            0x0b, // end (loop)
            0x0b, // end (block)
            0x0b, // end (func)
        ]
    }

    #[test]
    fn records_nested_block_loop_if_continuations() {
        let module = crate::Module::decode(
            Buffer::new(module_bytes().as_slice()),
            &mut NoCustomSectionVisitor {},
            Global,
        )
        .expect("decode should succeed");
        module.validate().expect("module should validate");

        let expr = &module.codesec[0].code;
        let flat = flatten(&module, expr, Global);

        // One entry per `block`/`loop`/`if`; exactly the `if` records an
        // `else` target, and offsets come out in scan (= program) order.
        assert_eq!(flat.entries.len(), 3);
        let offsets: std::vec::Vec<usize> = flat.entries.iter().map(|(offset, _)| *offset).collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted);

        let with_else = flat.entries.iter().filter(|(_, c)| c.else_target.is_some()).count();
        assert_eq!(with_else, 1);

        for (_, cont) in &flat.entries {
            assert_eq!(cont.param_arity, 0);
            assert_eq!(cont.result_arity, 0);
            assert!(cont.end > 0);
        }
    }
}
