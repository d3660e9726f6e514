// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The instruction dispatch loop.
//!
//! Walks a function's re-encoded [`crate::types::Expression`] byte-for-byte
//! via [`crate::bytecode::Reader`], consulting the function's flattened jump
//! table (see `super::flatten`) to resolve branch targets in O(1) instead of
//! rescanning the byte stream. Operand read order and stack push/pop shape
//! mirror `validate::expr` exactly; this is the same control-frame model with
//! real [`Value`] computation in place of type checking.

use crate::Allocator;
use crate::bytecode::Reader;
use crate::core_compat::vec::Vec;
use crate::types::{BulkOpcode, Opcode};

use super::const_eval::eval_const;
use super::{FuncAddr, FunctionInstance, ModuleInstance, Store, Trap, Value, WasmFunction, function_types_equal};

// Bounds recursive `call`/`call_indirect` nesting; exceeding it traps rather
// than exhausting the host's own call stack.
const MAX_CALL_DEPTH: usize = 512;

/// Invokes the function at `addr` with `args`, returning its single result
/// value (if its signature declares one).
pub(crate) fn call<A: Allocator + Clone>(store: &Store<A>, addr: FuncAddr, args: &[Value]) -> Result<Option<Value>, Trap> {
    call_with_depth(store, addr, args, 0)
}

fn call_with_depth<A: Allocator + Clone>(
    store: &Store<A>,
    addr: FuncAddr,
    args: &[Value],
    depth: usize,
) -> Result<Option<Value>, Trap> {
    if depth >= MAX_CALL_DEPTH {
        return Err(Trap::StackExhausted);
    }
    match store.function(addr) {
        FunctionInstance::Host(host) => host.call(args),
        FunctionInstance::Wasm(wasm) => run(store, wasm, args, depth),
    }
}

#[derive(Clone, Copy)]
enum LabelKind {
    Loop { restart: usize },
    Exit { end: usize },
    Function,
}

#[derive(Clone, Copy)]
struct Label {
    base: usize,
    arity: usize,
    kind: LabelKind,
}

enum BranchResult {
    Seek,
    Return(Option<Value>),
}

fn take_branch<A: Allocator>(
    labels: &mut std::vec::Vec<Label>,
    operands: &mut Vec<Value, A>,
    reader: &mut Reader<'_>,
    depth: u32,
) -> BranchResult {
    let target = labels.len() - 1 - depth as usize;
    let label = labels[target];

    let mut saved: std::vec::Vec<Value> = std::vec::Vec::with_capacity(label.arity);
    for _ in 0..label.arity {
        saved.push(operands.pop().expect("validator guarantees operand"));
    }
    operands.truncate(label.base);

    match label.kind {
        LabelKind::Loop { restart } => {
            operands.extend(saved.into_iter().rev());
            labels.truncate(target + 1);
            reader.seek(restart);
            BranchResult::Seek
        }
        LabelKind::Exit { end } => {
            operands.extend(saved.into_iter().rev());
            labels.truncate(target);
            reader.seek(end);
            BranchResult::Seek
        }
        LabelKind::Function => {
            labels.truncate(0);
            BranchResult::Return(saved.into_iter().next())
        }
    }
}

#[allow(clippy::too_many_lines)]
fn run<A: Allocator + Clone>(store: &Store<A>, func: &WasmFunction<A>, args: &[Value], depth: usize) -> Result<Option<Value>, Trap> {
    let alloc = func.module_instance().module().typesec.allocator().clone();

    let mut locals: Vec<Value, A> = Vec::with_capacity_in(args.len() + func.locals().len(), alloc.clone());
    locals.extend(args.iter().copied());
    for local in func.locals().iter() {
        locals.push(Value::from(*local));
    }

    let mut operands: Vec<Value, A> = Vec::new_in(alloc);
    let mut labels: std::vec::Vec<Label> = std::vec::Vec::new();
    labels.push(Label {
        base: 0,
        arity: func.signature().results.len(),
        kind: LabelKind::Function,
    });

    let flat = func.flattened();
    let mut reader = Reader::new(func.code());

    macro_rules! pop_i32 {
        () => {
            operands.pop().expect("validator guarantees operand").as_i32()
        };
    }
    macro_rules! pop_i64 {
        () => {
            operands.pop().expect("validator guarantees operand").as_i64()
        };
    }
    macro_rules! pop_f32 {
        () => {
            operands.pop().expect("validator guarantees operand").as_f32()
        };
    }
    macro_rules! pop_f64 {
        () => {
            operands.pop().expect("validator guarantees operand").as_f64()
        };
    }
    macro_rules! push_i32 {
        ($v:expr) => {
            operands.push(Value::I32($v))
        };
    }
    macro_rules! push_i64 {
        ($v:expr) => {
            operands.push(Value::I64($v))
        };
    }
    macro_rules! push_f32 {
        ($v:expr) => {
            operands.push(Value::F32($v))
        };
    }
    macro_rules! push_f64 {
        ($v:expr) => {
            operands.push(Value::F64($v))
        };
    }
    macro_rules! load {
        ($ty:ident, $read:ident) => {{
            let memarg = reader.read_mem_arg();
            let base = pop_i32!();
            let ea = memarg.offset as u64 + base as u64;
            let mem_addr = func.module_instance().mem_addr(0);
            let v = store.memory(mem_addr).lock().$read(ea)?;
            operands.push(Value::$ty(v as _));
        }};
    }
    macro_rules! store_op {
        ($pop:ident, $trunc:ty, $write:ident) => {{
            let memarg = reader.read_mem_arg();
            let value = operands.pop().expect("validator guarantees operand").$pop();
            let base = pop_i32!();
            let ea = memarg.offset as u64 + base as u64;
            let mem_addr = func.module_instance().mem_addr(0);
            store.memory(mem_addr).lock().$write(ea, value as $trunc)?;
        }};
    }

    loop {
        let offset = reader.pos();
        let op = reader.read_opcode();
        match op {
            Opcode::Block | Opcode::Loop => {
                reader.read_block_type();
                let cont = *flat.continuation_at(offset);
                let base = operands.len() - cont.param_arity;
                let kind = if op == Opcode::Loop {
                    LabelKind::Loop { restart: reader.pos() }
                } else {
                    LabelKind::Exit { end: cont.end }
                };
                let arity = if op == Opcode::Loop { cont.param_arity } else { cont.result_arity };
                labels.push(Label { base, arity, kind });
            }
            Opcode::If => {
                reader.read_block_type();
                let cont = *flat.continuation_at(offset);
                let cond = pop_i32!();
                let base = operands.len() - cont.param_arity;
                if cond != 0 {
                    labels.push(Label {
                        base,
                        arity: cont.result_arity,
                        kind: LabelKind::Exit { end: cont.end },
                    });
                } else if let Some(else_target) = cont.else_target {
                    labels.push(Label {
                        base,
                        arity: cont.result_arity,
                        kind: LabelKind::Exit { end: cont.end },
                    });
                    reader.seek(else_target + 1);
                } else {
                    reader.seek(cont.end);
                }
            }
            Opcode::Else => {
                let label = labels.pop().expect("else matches a pushed if label");
                let LabelKind::Exit { end } = label.kind else {
                    unreachable!("else always pops an if's Exit label");
                };
                reader.seek(end);
            }
            Opcode::End => {
                let label = labels.pop().expect("end matches a pushed label");
                if let LabelKind::Function = label.kind {
                    return Ok(operands.pop());
                }
            }
            Opcode::Unreachable => return Err(Trap::Unreachable),
            Opcode::Nop => {}
            Opcode::Br => {
                let depth = reader.read_u32();
                if let BranchResult::Return(v) = take_branch(&mut labels, &mut operands, &mut reader, depth) {
                    return Ok(v);
                }
            }
            Opcode::BrIf => {
                let depth = reader.read_u32();
                let cond = pop_i32!();
                if cond != 0
                    && let BranchResult::Return(v) = take_branch(&mut labels, &mut operands, &mut reader, depth)
                {
                    return Ok(v);
                }
            }
            Opcode::BrTable => {
                let cond = pop_i32!();
                let len = reader.read_vec_len();
                let mut target = None;
                for i in 0..len {
                    let label_depth = reader.read_label_idx_raw();
                    if i == cond {
                        target = Some(label_depth);
                    }
                }
                let default = reader.read_label_idx_raw();
                let depth = target.unwrap_or(default);
                if let BranchResult::Return(v) = take_branch(&mut labels, &mut operands, &mut reader, depth) {
                    return Ok(v);
                }
            }
            Opcode::Return => {
                let depth = (labels.len() - 1) as u32;
                match take_branch(&mut labels, &mut operands, &mut reader, depth) {
                    BranchResult::Return(v) => return Ok(v),
                    BranchResult::Seek => unreachable!("return always targets the function's own label"),
                }
            }
            Opcode::Call => {
                let idx = reader.read_u32() as usize;
                let addr = func.module_instance().func_addr(idx);
                let nparams = store.function(addr).signature().parameters.len();
                let split_at = operands.len() - nparams;
                let call_args = operands.split_off(split_at);
                let result = call_with_depth(store, addr, &call_args, depth + 1)?;
                if let Some(v) = result {
                    operands.push(v);
                }
            }
            Opcode::CallIndirect => {
                let ci = reader.read_call_indirect();
                let table_addr = func.module_instance().table_addr(*ci.table as usize);
                let elem_idx = pop_i32!();
                let value = store.table(table_addr).lock().expect("table lock poisoned").get(elem_idx)?;
                let Value::FuncRef(func_addr) = value else {
                    unreachable!("validator guarantees a funcref table");
                };
                let func_addr = func_addr.ok_or(Trap::UninitializedElement)?;
                let expected_ty = &func.module_instance().module().typesec[*ci.ty as usize];
                let actual_ty = store.function(func_addr).signature();
                if !function_types_equal(expected_ty, actual_ty) {
                    return Err(Trap::IndirectCallTypeMismatch);
                }
                let nparams = actual_ty.parameters.len();
                let split_at = operands.len() - nparams;
                let call_args = operands.split_off(split_at);
                let result = call_with_depth(store, func_addr, &call_args, depth + 1)?;
                if let Some(v) = result {
                    operands.push(v);
                }
            }
            Opcode::Drop => {
                operands.pop().expect("validator guarantees operand");
            }
            Opcode::Select => {
                let cond = pop_i32!();
                let b = operands.pop().expect("validator guarantees operand");
                let a = operands.pop().expect("validator guarantees operand");
                operands.push(if cond != 0 { a } else { b });
            }
            Opcode::SelectT => {
                let len = reader.read_vec_len();
                for _ in 0..len {
                    reader.read_val_type();
                }
                let cond = pop_i32!();
                let b = operands.pop().expect("validator guarantees operand");
                let a = operands.pop().expect("validator guarantees operand");
                operands.push(if cond != 0 { a } else { b });
            }
            Opcode::LocalGet => {
                let idx = reader.read_u32() as usize;
                operands.push(locals[idx]);
            }
            Opcode::LocalSet => {
                let idx = reader.read_u32() as usize;
                locals[idx] = operands.pop().expect("validator guarantees operand");
            }
            Opcode::LocalTee => {
                let idx = reader.read_u32() as usize;
                locals[idx] = *operands.last().expect("validator guarantees operand");
            }
            Opcode::GlobalGet => {
                let idx = reader.read_u32() as usize;
                let addr = func.module_instance().global_addr(idx);
                let v = store.global(addr).lock().expect("global lock poisoned").get();
                operands.push(v);
            }
            Opcode::GlobalSet => {
                let idx = reader.read_u32() as usize;
                let addr = func.module_instance().global_addr(idx);
                let v = operands.pop().expect("validator guarantees operand");
                store.global(addr).lock().expect("global lock poisoned").set(v);
            }
            Opcode::I32Load => load!(I32, read_u32),
            Opcode::I64Load => load!(I64, read_u64),
            Opcode::F32Load => load!(F32, read_f32),
            Opcode::F64Load => load!(F64, read_f64),
            Opcode::I32Load8S => load!(I32, read_i8),
            Opcode::I32Load8U => load!(I32, read_u8),
            Opcode::I32Load16S => load!(I32, read_i16),
            Opcode::I32Load16U => load!(I32, read_u16),
            Opcode::I64Load8S => load!(I64, read_i8),
            Opcode::I64Load8U => load!(I64, read_u8),
            Opcode::I64Load16S => load!(I64, read_i16),
            Opcode::I64Load16U => load!(I64, read_u16),
            Opcode::I64Load32S => load!(I64, read_i32),
            Opcode::I64Load32U => load!(I64, read_u32),
            Opcode::I32Store => store_op!(as_i32, u32, write_u32),
            Opcode::I32Store8 => store_op!(as_i32, u8, write_u8),
            Opcode::I32Store16 => store_op!(as_i32, u16, write_u16),
            Opcode::I64Store => store_op!(as_i64, u64, write_u64),
            Opcode::I64Store8 => store_op!(as_i64, u8, write_u8),
            Opcode::I64Store16 => store_op!(as_i64, u16, write_u16),
            Opcode::I64Store32 => store_op!(as_i64, u32, write_u32),
            Opcode::F32Store => store_op!(as_f32, f32, write_f32),
            Opcode::F64Store => store_op!(as_f64, f64, write_f64),
            Opcode::MemorySize => {
                let addr = func.module_instance().mem_addr(0);
                let pages = store.memory(addr).lock().size_pages();
                push_i32!(pages);
            }
            Opcode::MemoryGrow => {
                let addr = func.module_instance().mem_addr(0);
                let delta = pop_i32!();
                let prev = store.memory(addr).lock().grow(delta);
                push_i32!(prev);
            }
            Opcode::I32Const => {
                let v = reader.read_i32();
                push_i32!(v as u32);
            }
            Opcode::I64Const => {
                let v = reader.read_i64();
                push_i64!(v as u64);
            }
            Opcode::F32Const => {
                let v = reader.read_f32();
                push_f32!(v);
            }
            Opcode::F64Const => {
                let v = reader.read_f64();
                push_f64!(v);
            }
            Opcode::I32Eqz => {
                let a = pop_i32!();
                push_i32!((a == 0) as u32);
            }
            Opcode::I32Eq => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!((a == b) as u32);
            }
            Opcode::I32Ne => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!((a != b) as u32);
            }
            Opcode::I32LtS => {
                let b = pop_i32!() as i32;
                let a = pop_i32!() as i32;
                push_i32!((a < b) as u32);
            }
            Opcode::I32LtU => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!((a < b) as u32);
            }
            Opcode::I32GtS => {
                let b = pop_i32!() as i32;
                let a = pop_i32!() as i32;
                push_i32!((a > b) as u32);
            }
            Opcode::I32GtU => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!((a > b) as u32);
            }
            Opcode::I32LeS => {
                let b = pop_i32!() as i32;
                let a = pop_i32!() as i32;
                push_i32!((a <= b) as u32);
            }
            Opcode::I32LeU => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!((a <= b) as u32);
            }
            Opcode::I32GeS => {
                let b = pop_i32!() as i32;
                let a = pop_i32!() as i32;
                push_i32!((a >= b) as u32);
            }
            Opcode::I32GeU => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!((a >= b) as u32);
            }
            Opcode::I64Eqz => {
                let a = pop_i64!();
                push_i32!((a == 0) as u32);
            }
            Opcode::I64Eq => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i32!((a == b) as u32);
            }
            Opcode::I64Ne => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i32!((a != b) as u32);
            }
            Opcode::I64LtS => {
                let b = pop_i64!() as i64;
                let a = pop_i64!() as i64;
                push_i32!((a < b) as u32);
            }
            Opcode::I64LtU => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i32!((a < b) as u32);
            }
            Opcode::I64GtS => {
                let b = pop_i64!() as i64;
                let a = pop_i64!() as i64;
                push_i32!((a > b) as u32);
            }
            Opcode::I64GtU => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i32!((a > b) as u32);
            }
            Opcode::I64LeS => {
                let b = pop_i64!() as i64;
                let a = pop_i64!() as i64;
                push_i32!((a <= b) as u32);
            }
            Opcode::I64LeU => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i32!((a <= b) as u32);
            }
            Opcode::I64GeS => {
                let b = pop_i64!() as i64;
                let a = pop_i64!() as i64;
                push_i32!((a >= b) as u32);
            }
            Opcode::I64GeU => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i32!((a >= b) as u32);
            }
            Opcode::F32Eq => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_i32!((a == b) as u32);
            }
            Opcode::F32Ne => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_i32!((a != b) as u32);
            }
            Opcode::F32Lt => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_i32!((a < b) as u32);
            }
            Opcode::F32Gt => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_i32!((a > b) as u32);
            }
            Opcode::F32Le => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_i32!((a <= b) as u32);
            }
            Opcode::F32Ge => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_i32!((a >= b) as u32);
            }
            Opcode::F64Eq => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_i32!((a == b) as u32);
            }
            Opcode::F64Ne => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_i32!((a != b) as u32);
            }
            Opcode::F64Lt => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_i32!((a < b) as u32);
            }
            Opcode::F64Gt => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_i32!((a > b) as u32);
            }
            Opcode::F64Le => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_i32!((a <= b) as u32);
            }
            Opcode::F64Ge => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_i32!((a >= b) as u32);
            }
            Opcode::I32Clz => {
                let a = pop_i32!();
                push_i32!(a.leading_zeros());
            }
            Opcode::I32Ctz => {
                let a = pop_i32!();
                push_i32!(a.trailing_zeros());
            }
            Opcode::I32Popcnt => {
                let a = pop_i32!();
                push_i32!(a.count_ones());
            }
            Opcode::I32Add => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a.wrapping_add(b));
            }
            Opcode::I32Sub => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a.wrapping_sub(b));
            }
            Opcode::I32Mul => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a.wrapping_mul(b));
            }
            Opcode::I32DivS => {
                let b = pop_i32!() as i32;
                let a = pop_i32!() as i32;
                push_i32!(super::numeric::div_s_32(a, b)? as u32);
            }
            Opcode::I32DivU => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(super::numeric::div_u_32(a, b)?);
            }
            Opcode::I32RemS => {
                let b = pop_i32!() as i32;
                let a = pop_i32!() as i32;
                push_i32!(super::numeric::rem_s_32(a, b)? as u32);
            }
            Opcode::I32RemU => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(super::numeric::rem_u_32(a, b)?);
            }
            Opcode::I32And => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a & b);
            }
            Opcode::I32Or => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a | b);
            }
            Opcode::I32Xor => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a ^ b);
            }
            Opcode::I32Shl => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a.wrapping_shl(b));
            }
            Opcode::I32ShrS => {
                let b = pop_i32!();
                let a = pop_i32!() as i32;
                push_i32!(a.wrapping_shr(b) as u32);
            }
            Opcode::I32ShrU => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a.wrapping_shr(b));
            }
            Opcode::I32Rotl => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a.rotate_left(b));
            }
            Opcode::I32Rotr => {
                let b = pop_i32!();
                let a = pop_i32!();
                push_i32!(a.rotate_right(b));
            }
            Opcode::I64Clz => {
                let a = pop_i64!();
                push_i64!(a.leading_zeros() as u64);
            }
            Opcode::I64Ctz => {
                let a = pop_i64!();
                push_i64!(a.trailing_zeros() as u64);
            }
            Opcode::I64Popcnt => {
                let a = pop_i64!();
                push_i64!(a.count_ones() as u64);
            }
            Opcode::I64Add => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a.wrapping_add(b));
            }
            Opcode::I64Sub => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a.wrapping_sub(b));
            }
            Opcode::I64Mul => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a.wrapping_mul(b));
            }
            Opcode::I64DivS => {
                let b = pop_i64!() as i64;
                let a = pop_i64!() as i64;
                push_i64!(super::numeric::div_s_64(a, b)? as u64);
            }
            Opcode::I64DivU => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(super::numeric::div_u_64(a, b)?);
            }
            Opcode::I64RemS => {
                let b = pop_i64!() as i64;
                let a = pop_i64!() as i64;
                push_i64!(super::numeric::rem_s_64(a, b)? as u64);
            }
            Opcode::I64RemU => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(super::numeric::rem_u_64(a, b)?);
            }
            Opcode::I64And => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a & b);
            }
            Opcode::I64Or => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a | b);
            }
            Opcode::I64Xor => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a ^ b);
            }
            Opcode::I64Shl => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a.wrapping_shl(b as u32));
            }
            Opcode::I64ShrS => {
                let b = pop_i64!();
                let a = pop_i64!() as i64;
                push_i64!(a.wrapping_shr(b as u32) as u64);
            }
            Opcode::I64ShrU => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a.wrapping_shr(b as u32));
            }
            Opcode::I64Rotl => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a.rotate_left(b as u32));
            }
            Opcode::I64Rotr => {
                let b = pop_i64!();
                let a = pop_i64!();
                push_i64!(a.rotate_right(b as u32));
            }
            Opcode::F32Abs => {
                let a = pop_f32!();
                push_f32!(a.abs());
            }
            Opcode::F32Neg => {
                let a = pop_f32!();
                push_f32!(-a);
            }
            Opcode::F32Ceil => {
                let a = pop_f32!();
                push_f32!(a.ceil());
            }
            Opcode::F32Floor => {
                let a = pop_f32!();
                push_f32!(a.floor());
            }
            Opcode::F32Trunc => {
                let a = pop_f32!();
                push_f32!(a.trunc());
            }
            Opcode::F32Nearest => {
                let a = pop_f32!();
                push_f32!(a.round_ties_even());
            }
            Opcode::F32Sqrt => {
                let a = pop_f32!();
                push_f32!(a.sqrt());
            }
            Opcode::F32Add => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_f32!(a + b);
            }
            Opcode::F32Sub => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_f32!(a - b);
            }
            Opcode::F32Mul => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_f32!(a * b);
            }
            Opcode::F32Div => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_f32!(a / b);
            }
            Opcode::F32Min => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_f32!(super::numeric::f32_min(a, b));
            }
            Opcode::F32Max => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_f32!(super::numeric::f32_max(a, b));
            }
            Opcode::F32Copysign => {
                let b = pop_f32!();
                let a = pop_f32!();
                push_f32!(a.copysign(b));
            }
            Opcode::F64Abs => {
                let a = pop_f64!();
                push_f64!(a.abs());
            }
            Opcode::F64Neg => {
                let a = pop_f64!();
                push_f64!(-a);
            }
            Opcode::F64Ceil => {
                let a = pop_f64!();
                push_f64!(a.ceil());
            }
            Opcode::F64Floor => {
                let a = pop_f64!();
                push_f64!(a.floor());
            }
            Opcode::F64Trunc => {
                let a = pop_f64!();
                push_f64!(a.trunc());
            }
            Opcode::F64Nearest => {
                let a = pop_f64!();
                push_f64!(a.round_ties_even());
            }
            Opcode::F64Sqrt => {
                let a = pop_f64!();
                push_f64!(a.sqrt());
            }
            Opcode::F64Add => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_f64!(a + b);
            }
            Opcode::F64Sub => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_f64!(a - b);
            }
            Opcode::F64Mul => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_f64!(a * b);
            }
            Opcode::F64Div => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_f64!(a / b);
            }
            Opcode::F64Min => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_f64!(super::numeric::f64_min(a, b));
            }
            Opcode::F64Max => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_f64!(super::numeric::f64_max(a, b));
            }
            Opcode::F64Copysign => {
                let b = pop_f64!();
                let a = pop_f64!();
                push_f64!(a.copysign(b));
            }
            Opcode::I32WrapI64 => {
                let a = pop_i64!();
                push_i32!(a as u32);
            }
            Opcode::I32TruncF32S => {
                let a = pop_f32!();
                push_i32!(super::numeric::trunc_to_i32_s(a as f64)? as u32);
            }
            Opcode::I32TruncF32U => {
                let a = pop_f32!();
                push_i32!(super::numeric::trunc_to_i32_u(a as f64)?);
            }
            Opcode::I32TruncF64S => {
                let a = pop_f64!();
                push_i32!(super::numeric::trunc_to_i32_s(a)? as u32);
            }
            Opcode::I32TruncF64U => {
                let a = pop_f64!();
                push_i32!(super::numeric::trunc_to_i32_u(a)?);
            }
            Opcode::I64ExtendI32S => {
                let a = pop_i32!() as i32;
                push_i64!(a as i64 as u64);
            }
            Opcode::I64ExtendI32U => {
                let a = pop_i32!();
                push_i64!(a as u64);
            }
            Opcode::I64TruncF32S => {
                let a = pop_f32!();
                push_i64!(super::numeric::trunc_to_i64_s(a as f64)? as u64);
            }
            Opcode::I64TruncF32U => {
                let a = pop_f32!();
                push_i64!(super::numeric::trunc_to_i64_u(a as f64)?);
            }
            Opcode::I64TruncF64S => {
                let a = pop_f64!();
                push_i64!(super::numeric::trunc_to_i64_s(a)? as u64);
            }
            Opcode::I64TruncF64U => {
                let a = pop_f64!();
                push_i64!(super::numeric::trunc_to_i64_u(a)?);
            }
            Opcode::F32ConvertI32S => {
                let a = pop_i32!() as i32;
                push_f32!(a as f32);
            }
            Opcode::F32ConvertI32U => {
                let a = pop_i32!();
                push_f32!(a as f32);
            }
            Opcode::F32ConvertI64S => {
                let a = pop_i64!() as i64;
                push_f32!(a as f32);
            }
            Opcode::F32ConvertI64U => {
                let a = pop_i64!();
                push_f32!(a as f32);
            }
            Opcode::F32DemoteF64 => {
                let a = pop_f64!();
                push_f32!(a as f32);
            }
            Opcode::F64ConvertI32S => {
                let a = pop_i32!() as i32;
                push_f64!(a as f64);
            }
            Opcode::F64ConvertI32U => {
                let a = pop_i32!();
                push_f64!(a as f64);
            }
            Opcode::F64ConvertI64S => {
                let a = pop_i64!() as i64;
                push_f64!(a as f64);
            }
            Opcode::F64ConvertI64U => {
                let a = pop_i64!();
                push_f64!(a as f64);
            }
            Opcode::F64PromoteF32 => {
                let a = pop_f32!();
                push_f64!(a as f64);
            }
            Opcode::I32ReinterpretF32 => {
                let a = pop_f32!();
                push_i32!(a.to_bits());
            }
            Opcode::I64ReinterpretF64 => {
                let a = pop_f64!();
                push_i64!(a.to_bits());
            }
            Opcode::F32ReinterpretI32 => {
                let a = pop_i32!();
                push_f32!(f32::from_bits(a));
            }
            Opcode::F64ReinterpretI64 => {
                let a = pop_i64!();
                push_f64!(f64::from_bits(a));
            }
            Opcode::I32Extend8S => {
                let a = pop_i32!();
                push_i32!((a as u8 as i8 as i32) as u32);
            }
            Opcode::I32Extend16S => {
                let a = pop_i32!();
                push_i32!((a as u16 as i16 as i32) as u32);
            }
            Opcode::I64Extend8S => {
                let a = pop_i64!();
                push_i64!((a as u8 as i8 as i64) as u64);
            }
            Opcode::I64Extend16S => {
                let a = pop_i64!();
                push_i64!((a as u16 as i16 as i64) as u64);
            }
            Opcode::I64Extend32S => {
                let a = pop_i64!();
                push_i64!((a as u32 as i32 as i64) as u64);
            }
            Opcode::BulkPrefix => match reader.read_bulk_opcode() {
                BulkOpcode::I32TruncSatF32S => {
                    let a = pop_f32!();
                    push_i32!((a as i32) as u32);
                }
                BulkOpcode::I32TruncSatF32U => {
                    let a = pop_f32!();
                    push_i32!(a as u32);
                }
                BulkOpcode::I32TruncSatF64S => {
                    let a = pop_f64!();
                    push_i32!((a as i32) as u32);
                }
                BulkOpcode::I32TruncSatF64U => {
                    let a = pop_f64!();
                    push_i32!(a as u32);
                }
                BulkOpcode::I64TruncSatF32S => {
                    let a = pop_f32!();
                    push_i64!((a as i64) as u64);
                }
                BulkOpcode::I64TruncSatF32U => {
                    let a = pop_f32!();
                    push_i64!(a as u64);
                }
                BulkOpcode::I64TruncSatF64S => {
                    let a = pop_f64!();
                    push_i64!((a as i64) as u64);
                }
                BulkOpcode::I64TruncSatF64U => {
                    let a = pop_f64!();
                    push_i64!(a as u64);
                }
            },
            Opcode::VectorPrefix => unreachable!("SIMD instructions are rejected at validation time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core_compat::alloc::Global;
    use crate::runtime::{Store, linker};
    use crate::storage::Buffer;
    use crate::types::Version;
    use crate::{Module, decode};

    use super::*;

    // (module
    //   (func (export "add") (param i32 i32) (result i32)
    //     local.get 0
    //     local.get 1
    //     i32.add))
    fn add_module_bytes() -> std::vec::Vec<u8> {
        vec![
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x07, 0x01, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f, // type section
            0x03, 0x02, 0x01, 0x00, // function section
            0x07, 0x07, 0x01, 0x03, b'a', b'd', b'd', 0x00, 0x00, // export section
            0x0a, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b, // code section
        ]
    }

    fn load_and_instantiate(bytes: std::vec::Vec<u8>) -> (Store<Global>, linker::Instance<Global>) {
        let module = Module::decode(Buffer::new(bytes.as_slice()), &mut decode::NoCustomSectionVisitor {}, Global).expect("decode");
        module.validate().expect("validate");
        let module = std::sync::Arc::new(module);
        let mut store = Store::new(Global);
        let linker = linker::Linker::new(Global);
        let (instance, trap) = linker::Instance::instantiate(module, &mut store, &linker).expect("instantiate");
        assert!(trap.is_none());
        (store, instance)
    }

    #[test]
    fn add_function_computes_sum() {
        let (store, instance) = load_and_instantiate(add_module_bytes());
        let linker::ExternVal::Func(addr) = instance.get_export("add").expect("export exists") else {
            panic!("expected a function export");
        };
        let result = call(&store, addr, &[Value::I32(2), Value::I32(3)]).expect("call succeeds");
        assert_eq!(result, Some(Value::I32(5)));
    }

    #[test]
    fn div_by_zero_traps() {
        // (module
        //   (func (export "div") (param i32 i32) (result i32)
        //     local.get 0
        //     local.get 1
        //     i32.div_s))
        let bytes: std::vec::Vec<u8> = vec![
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x07, 0x01, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f, // type section
            0x03, 0x02, 0x01, 0x00, // function section
            0x07, 0x07, 0x01, 0x03, b'd', b'i', b'v', 0x00, 0x00, // export section
            0x0a, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6d, 0x0b, // code section
        ];
        let (store, instance) = load_and_instantiate(bytes);
        let linker::ExternVal::Func(addr) = instance.get_export("div").expect("export exists") else {
            panic!("expected a function export");
        };
        let result = call(&store, addr, &[Value::I32(1), Value::I32(0)]);
        assert_eq!(result, Err(Trap::IntegerDivideByZero));
    }

    #[test]
    fn block_branch_exits_with_result() {
        // (module
        //   (func (export "f") (result i32)
        //     (block (result i32)
        //       i32.const 42
        //       br 0)
        //     ))
        let bytes: std::vec::Vec<u8> = vec![
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f, // type section: () -> i32
            0x03, 0x02, 0x01, 0x00, // function section
            0x07, 0x05, 0x01, 0x01, b'f', 0x00, 0x00, // export section
            0x0a, 0x0b, 0x01, 0x09, 0x00, 0x02, 0x7f, 0x41, 0x2a, 0x0c, 0x00, 0x0b, 0x0b, // code section
        ];
        let (store, instance) = load_and_instantiate(bytes);
        let linker::ExternVal::Func(addr) = instance.get_export("f").expect("export exists") else {
            panic!("expected a function export");
        };
        let result = call(&store, addr, &[]).expect("call succeeds");
        assert_eq!(result, Some(Value::I32(42)));
    }
}
