// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The control-frame type checker.
//!
//! Implements the standard WebAssembly validation algorithm (spec appendix
//! "Algorithm"): an operand-type stack and a control-frame stack, with a
//! per-frame "unreachable" flag that makes the operand stack polymorphic once
//! an instruction that never falls through (`unreachable`, `br`, `return`,
//! ...) has been seen, so that dead code following it validates regardless of
//! its actual operand shape.

use crate::Allocator;
use crate::bytecode::Reader;
use crate::core_compat::vec::Vec;
use crate::types::{
    BulkOpcode, Expression, FuncIdx, FunctionType, GlobalIdx, GlobalTypeMutability, Locals,
    MemArg, Opcode, RefType, ValType,
};

use super::{Error, Validator};

#[derive(Copy, Clone, Debug)]
pub(crate) enum ExpressionValidationContext<'module, A: Allocator> {
    Function(&'module FunctionType<A>, &'module Locals<A>),
    Constant(ValType),
}

// The declared inputs/outputs of a control frame, borrowed from the module
// where possible so that entering/leaving blocks never allocates.
#[derive(Clone, Copy, Debug)]
enum Signature<'module, A: Allocator> {
    Empty,
    Single(ValType),
    Indexed(&'module FunctionType<A>),
}

impl<'module, A: Allocator> Signature<'module, A> {
    fn num_params(self) -> usize {
        match self {
            Self::Empty | Self::Single(_) => 0,
            Self::Indexed(ty) => ty.parameters.len(),
        }
    }

    fn param(self, idx: usize) -> ValType {
        match self {
            Self::Indexed(ty) => ty.parameters[idx],
            Self::Empty | Self::Single(_) => unreachable!(),
        }
    }

    fn num_results(self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Single(_) => 1,
            Self::Indexed(ty) => ty.results.len(),
        }
    }

    fn result(self, idx: usize) -> ValType {
        match self {
            Self::Single(vt) => {
                debug_assert_eq!(idx, 0);
                vt
            }
            Self::Indexed(ty) => ty.results[idx],
            Self::Empty => unreachable!(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FrameKind {
    Block,
    Loop,
    If,
    IfElse,
    Function,
}

struct ControlFrame<'module, A: Allocator> {
    kind: FrameKind,
    signature: Signature<'module, A>,
    // Operand stack height at the point this frame was entered.
    height: usize,
    unreachable: bool,
}

impl<'module, A: Allocator> ControlFrame<'module, A> {
    // The arity and types a branch targeting this frame must supply.
    fn label_arity(&self) -> usize {
        if self.kind == FrameKind::Loop {
            self.signature.num_params()
        } else {
            self.signature.num_results()
        }
    }

    fn label_type(&self, idx: usize) -> ValType {
        if self.kind == FrameKind::Loop {
            self.signature.param(idx)
        } else {
            self.signature.result(idx)
        }
    }
}

// Function-local lookup table mapping a local index to its declared type.
enum LocalTypes<'module, A: Allocator> {
    None,
    Declared {
        signature: &'module FunctionType<A>,
        locals: &'module Locals<A>,
    },
}

impl<A: Allocator> LocalTypes<'_, A> {
    fn get(&self, idx: u32) -> Option<ValType> {
        match self {
            Self::None => None,
            Self::Declared { signature, locals } => {
                let idx = idx as usize;
                if idx < signature.parameters.len() {
                    Some(signature.parameters[idx])
                } else {
                    locals
                        .get(idx - signature.parameters.len())
                        .map(|local| local.value_type())
                }
            }
        }
    }
}

// Operand stack with None (Unknown) standing in for the polymorphic operand
// type that appears below the "unreachable" point of dead code.
struct Checker<'module, A: Allocator> {
    opds: Vec<Option<ValType>, A>,
    ctrls: Vec<ControlFrame<'module, A>, A>,
}

impl<'module, A: Allocator> Checker<'module, A> {
    fn push_val(&mut self, ty: Option<ValType>) {
        self.opds.push(ty);
    }

    fn pop_val(&mut self) -> Result<Option<ValType>, Error> {
        let frame = self.ctrls.last().expect("at least the function frame");
        if self.opds.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(Error::OperandStackUnderflow);
        }
        Ok(self.opds.pop().expect("checked non-empty above"))
    }

    fn pop_expect(&mut self, expected: Option<ValType>) -> Result<Option<ValType>, Error> {
        let actual = self.pop_val()?;
        match (actual, expected) {
            (None, _) => Ok(expected),
            (Some(_), None) => Ok(actual),
            (Some(a), Some(e)) if a == e => Ok(actual),
            _ => Err(Error::TypeMismatch {
                expected,
                actual,
            }),
        }
    }

    fn push_n(&mut self, sig: Signature<'module, A>, results: bool) {
        let n = if results { sig.num_results() } else { sig.num_params() };
        for i in 0..n {
            let ty = if results { sig.result(i) } else { sig.param(i) };
            self.push_val(Some(ty));
        }
    }

    fn pop_n(&mut self, sig: Signature<'module, A>, results: bool) -> Result<(), Error> {
        let n = if results { sig.num_results() } else { sig.num_params() };
        for i in (0..n).rev() {
            let ty = if results { sig.result(i) } else { sig.param(i) };
            self.pop_expect(Some(ty))?;
        }
        Ok(())
    }

    fn push_ctrl(&mut self, kind: FrameKind, sig: Signature<'module, A>) -> Result<(), Error> {
        self.pop_n(sig, false)?;
        self.push_ctrl_raw(kind, sig);
        Ok(())
    }

    // Pushes a new frame without first popping its parameters off the
    // enclosing stack. Used by `else`, which re-enters with the same
    // parameters the matching `if` already consumed.
    fn push_ctrl_raw(&mut self, kind: FrameKind, sig: Signature<'module, A>) {
        let height = self.opds.len();
        self.ctrls.push(ControlFrame {
            kind,
            signature: sig,
            height,
            unreachable: false,
        });
        self.push_n(sig, false);
    }

    fn pop_ctrl(&mut self) -> Result<ControlFrame<'module, A>, Error> {
        let sig = self.ctrls.last().expect("at least the function frame").signature;
        self.pop_n(sig, true)?;
        let frame = self.ctrls.last().expect("at least the function frame");
        if self.opds.len() != frame.height {
            return Err(Error::UnbalancedControlStack);
        }
        Ok(self.ctrls.pop().expect("checked non-empty above"))
    }

    fn set_unreachable(&mut self) {
        let frame = self.ctrls.last_mut().expect("at least the function frame");
        let height = frame.height;
        frame.unreachable = true;
        self.opds.truncate(height);
    }

    fn label(&self, depth: u32) -> Result<&ControlFrame<'module, A>, Error> {
        let depth = depth as usize;
        if depth >= self.ctrls.len() {
            return Err(Error::UnbalancedControlStack);
        }
        Ok(&self.ctrls[self.ctrls.len() - 1 - depth])
    }

    // Checks that branching to `depth` is type-correct without consuming the
    // operand stack (used by br_table, which must check every target).
    fn check_branch(&mut self, depth: u32) -> Result<(), Error>
    where
        A: Clone,
    {
        let arity = self.label(depth)?.label_arity();
        let mut popped: Vec<Option<ValType>, A> =
            Vec::with_capacity_in(arity, self.opds.allocator().clone());
        for i in (0..arity).rev() {
            let ty = self.label(depth)?.label_type(i);
            popped.push(self.pop_expect(Some(ty))?);
        }
        while let Some(ty) = popped.pop() {
            self.push_val(ty);
        }
        Ok(())
    }

    fn branch(&mut self, depth: u32) -> Result<(), Error> {
        let frame = self.label(depth)?;
        let arity = frame.label_arity();
        for i in (0..arity).rev() {
            let ty = self.label(depth)?.label_type(i);
            self.pop_expect(Some(ty))?;
        }
        Ok(())
    }
}

fn signature_of<A: Allocator>(
    validator: &Validator<'_, A>,
    bt: crate::types::BlockType,
) -> Signature<'_, A> {
    match bt {
        crate::types::BlockType::Empty => Signature::Empty,
        crate::types::BlockType::Result(vt) => Signature::Single(vt),
        crate::types::BlockType::TypeIndex(idx) => Signature::Indexed(validator.function_type(idx)),
    }
}

pub(crate) fn validate_expression<'module, A: Allocator + Clone>(
    validator: &mut Validator<'module, A>,
    expr: &Expression<A>,
    context: ExpressionValidationContext<'module, A>,
) -> Result<(), Error> {
    let alloc = validator.allocator();
    let mut checker = Checker {
        opds: Vec::new_in(alloc.clone()),
        ctrls: Vec::new_in(alloc),
    };

    let (local_types, func_results) = match context {
        ExpressionValidationContext::Function(signature, locals) => (
            LocalTypes::Declared { signature, locals },
            Signature::Indexed(signature),
        ),
        ExpressionValidationContext::Constant(vt) => (LocalTypes::None, Signature::Single(vt)),
    };
    checker.ctrls.push(ControlFrame {
        kind: FrameKind::Function,
        signature: func_results,
        height: 0,
        unreachable: false,
    });

    let mut reader = Reader::new(expr);
    loop {
        let op = checker_step(validator, &mut checker, &local_types, &mut reader, context)?;
        if op == Opcode::End && checker.ctrls.is_empty() {
            break;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_lines)]
fn checker_step<'module, A: Allocator + Clone>(
    validator: &mut Validator<'module, A>,
    checker: &mut Checker<'module, A>,
    locals: &LocalTypes<'module, A>,
    reader: &mut Reader<'_>,
    context: ExpressionValidationContext<'module, A>,
) -> Result<Opcode, Error> {
    use ValType::{ExternRef, F32, F64, FuncRef, I32, I64};

    let op = reader.read_opcode();

    if matches!(context, ExpressionValidationContext::Constant(_))
        && !matches!(
            op,
            Opcode::I32Const
                | Opcode::I64Const
                | Opcode::F32Const
                | Opcode::F64Const
                | Opcode::GlobalGet
                | Opcode::End
        )
    {
        return Err(Error::InvalidConstantExpression);
    }

    macro_rules! pop {
        ($t:expr) => {
            checker.pop_expect(Some($t))?
        };
    }
    macro_rules! push {
        ($t:expr) => {
            checker.push_val(Some($t))
        };
    }
    macro_rules! unop {
        ($t:expr) => {{
            pop!($t);
            push!($t);
        }};
    }
    macro_rules! binop {
        ($t:expr) => {{
            pop!($t);
            pop!($t);
            push!($t);
        }};
    }
    macro_rules! testop {
        ($t:expr) => {{
            pop!($t);
            push!(I32);
        }};
    }
    macro_rules! relop {
        ($t:expr) => {{
            pop!($t);
            pop!($t);
            push!(I32);
        }};
    }
    macro_rules! cvtop {
        ($from:expr, $to:expr) => {{
            pop!($from);
            push!($to);
        }};
    }

    match op {
        Opcode::Unreachable => checker.set_unreachable(),
        Opcode::Nop => {}

        Opcode::Else => {
            let frame = checker.pop_ctrl()?;
            if frame.kind != FrameKind::If {
                return Err(Error::UnbalancedControlStack);
            }
            checker.push_ctrl_raw(FrameKind::IfElse, frame.signature);
        }

        Opcode::End => {
            let frame = checker.pop_ctrl()?;
            if frame.kind == FrameKind::If
                && (frame.signature.num_params() != frame.signature.num_results()
                    || (0..frame.signature.num_params())
                        .any(|i| frame.signature.param(i) != frame.signature.result(i)))
            {
                return Err(Error::UnbalancedControlStack);
            }
            checker.push_n(frame.signature, true);
        }

        Opcode::Block | Opcode::Loop | Opcode::If => {
            let bt = reader.read_block_type();
            let sig = signature_of(validator, bt);
            let kind = match op {
                Opcode::Block => FrameKind::Block,
                Opcode::Loop => FrameKind::Loop,
                Opcode::If => {
                    pop!(I32);
                    FrameKind::If
                }
                _ => unreachable!(),
            };
            checker.push_ctrl(kind, sig)?;
        }

        Opcode::Br => {
            let depth = reader.read_u32();
            checker.branch(depth)?;
            checker.set_unreachable();
        }
        Opcode::BrIf => {
            let depth = reader.read_u32();
            pop!(I32);
            checker.branch(depth)?;
        }
        Opcode::BrTable => {
            pop!(I32);
            let len = reader.read_vec_len();
            let default_arity = checker.label(reader_peek_default_depth(reader, len))?.label_arity();
            for _ in 0..len {
                let depth = reader.read_label_idx_raw();
                if checker.label(depth)?.label_arity() != default_arity {
                    return Err(Error::TypeMismatch {
                        expected: None,
                        actual: None,
                    });
                }
                checker.check_branch(depth)?;
            }
            let default = reader.read_label_idx_raw();
            checker.branch(default)?;
            checker.set_unreachable();
        }
        Opcode::Return => {
            let depth = (checker.ctrls.len() - 1) as u32;
            checker.branch(depth)?;
            checker.set_unreachable();
        }
        Opcode::Call => {
            let idx = FuncIdx::new(reader.read_u32());
            validator.validate(&idx)?;
            let sig = Signature::Indexed(validator.function_signature(idx));
            checker.pop_n(sig, false)?;
            checker.push_n(sig, true);
        }
        Opcode::CallIndirect => {
            let operands = reader.read_call_indirect();
            validator.validate(&operands.table)?;
            validator.validate(&operands.ty)?;
            if validator.table_type(operands.table).reftype != RefType::Func {
                return Err(Error::TypeMismatch {
                    expected: Some(FuncRef),
                    actual: None,
                });
            }
            pop!(I32);
            let sig = Signature::Indexed(validator.function_type(operands.ty));
            checker.pop_n(sig, false)?;
            checker.push_n(sig, true);
        }

        Opcode::Drop => {
            checker.pop_val()?;
        }
        Opcode::Select => {
            pop!(I32);
            let t1 = checker.pop_val()?;
            let t2 = checker.pop_expect(t1)?;
            if matches!(t2, Some(FuncRef | ExternRef)) {
                return Err(Error::TypeMismatch {
                    expected: None,
                    actual: t2,
                });
            }
            checker.push_val(t2);
        }
        Opcode::SelectT => {
            let len = reader.read_vec_len();
            let mut ty = None;
            for i in 0..len {
                let vt = reader.read_val_type();
                if i == 0 {
                    ty = Some(vt);
                }
            }
            let Some(ty) = ty else {
                return Err(Error::TypeMismatch {
                    expected: None,
                    actual: None,
                });
            };
            pop!(I32);
            pop!(ty);
            pop!(ty);
            push!(ty);
        }

        Opcode::LocalGet => {
            let idx = reader.read_u32();
            let ty = locals.get(idx).ok_or(Error::TypeMismatch {
                expected: None,
                actual: None,
            })?;
            push!(ty);
        }
        Opcode::LocalSet => {
            let idx = reader.read_u32();
            let ty = locals.get(idx).ok_or(Error::TypeMismatch {
                expected: None,
                actual: None,
            })?;
            pop!(ty);
        }
        Opcode::LocalTee => {
            let idx = reader.read_u32();
            let ty = locals.get(idx).ok_or(Error::TypeMismatch {
                expected: None,
                actual: None,
            })?;
            pop!(ty);
            push!(ty);
        }
        Opcode::GlobalGet => {
            let idx = GlobalIdx::new(reader.read_u32());
            validator.validate(&idx)?;
            if matches!(context, ExpressionValidationContext::Constant(_))
                && (!validator.global_is_imported(idx)
                    || validator.global_type(idx).mutability != GlobalTypeMutability::Const)
            {
                return Err(Error::InvalidConstantExpression);
            }
            push!(validator.global_type(idx).value);
        }
        Opcode::GlobalSet => {
            let idx = GlobalIdx::new(reader.read_u32());
            validator.validate(&idx)?;
            let ty = validator.global_type(idx);
            if ty.mutability == GlobalTypeMutability::Const {
                return Err(Error::ImmutableGlobalAssignment {
                    globalidx: *idx,
                });
            }
            pop!(ty.value);
        }

        Opcode::I32Load => {
            check_alignment(reader.read_mem_arg(), 4)?;
            require_memory(validator)?;
            pop!(I32);
            push!(I32);
        }
        Opcode::I32Load8S | Opcode::I32Load8U => {
            check_alignment(reader.read_mem_arg(), 1)?;
            require_memory(validator)?;
            pop!(I32);
            push!(I32);
        }
        Opcode::I32Load16S | Opcode::I32Load16U => {
            check_alignment(reader.read_mem_arg(), 2)?;
            require_memory(validator)?;
            pop!(I32);
            push!(I32);
        }
        Opcode::I64Load => {
            check_alignment(reader.read_mem_arg(), 8)?;
            require_memory(validator)?;
            pop!(I32);
            push!(I64);
        }
        Opcode::I64Load8S | Opcode::I64Load8U => {
            check_alignment(reader.read_mem_arg(), 1)?;
            require_memory(validator)?;
            pop!(I32);
            push!(I64);
        }
        Opcode::I64Load16S | Opcode::I64Load16U => {
            check_alignment(reader.read_mem_arg(), 2)?;
            require_memory(validator)?;
            pop!(I32);
            push!(I64);
        }
        Opcode::I64Load32S | Opcode::I64Load32U => {
            check_alignment(reader.read_mem_arg(), 4)?;
            require_memory(validator)?;
            pop!(I32);
            push!(I64);
        }
        Opcode::F32Load => {
            check_alignment(reader.read_mem_arg(), 4)?;
            require_memory(validator)?;
            pop!(I32);
            push!(F32);
        }
        Opcode::F64Load => {
            check_alignment(reader.read_mem_arg(), 8)?;
            require_memory(validator)?;
            pop!(I32);
            push!(F64);
        }
        Opcode::I32Store => {
            check_alignment(reader.read_mem_arg(), 4)?;
            require_memory(validator)?;
            pop!(I32);
            pop!(I32);
        }
        Opcode::I32Store8 => {
            check_alignment(reader.read_mem_arg(), 1)?;
            require_memory(validator)?;
            pop!(I32);
            pop!(I32);
        }
        Opcode::I32Store16 => {
            check_alignment(reader.read_mem_arg(), 2)?;
            require_memory(validator)?;
            pop!(I32);
            pop!(I32);
        }
        Opcode::I64Store => {
            check_alignment(reader.read_mem_arg(), 8)?;
            require_memory(validator)?;
            pop!(I64);
            pop!(I32);
        }
        Opcode::I64Store8 => {
            check_alignment(reader.read_mem_arg(), 1)?;
            require_memory(validator)?;
            pop!(I64);
            pop!(I32);
        }
        Opcode::I64Store16 => {
            check_alignment(reader.read_mem_arg(), 2)?;
            require_memory(validator)?;
            pop!(I64);
            pop!(I32);
        }
        Opcode::I64Store32 => {
            check_alignment(reader.read_mem_arg(), 4)?;
            require_memory(validator)?;
            pop!(I64);
            pop!(I32);
        }
        Opcode::F32Store => {
            check_alignment(reader.read_mem_arg(), 4)?;
            require_memory(validator)?;
            pop!(F32);
            pop!(I32);
        }
        Opcode::F64Store => {
            check_alignment(reader.read_mem_arg(), 8)?;
            require_memory(validator)?;
            pop!(F64);
            pop!(I32);
        }
        Opcode::MemorySize => {
            require_memory(validator)?;
            push!(I32);
        }
        Opcode::MemoryGrow => {
            require_memory(validator)?;
            pop!(I32);
            push!(I32);
        }

        Opcode::I32Const => {
            reader.read_i32();
            push!(I32);
        }
        Opcode::I64Const => {
            reader.read_i64();
            push!(I64);
        }
        Opcode::F32Const => {
            reader.read_f32();
            push!(F32);
        }
        Opcode::F64Const => {
            reader.read_f64();
            push!(F64);
        }

        Opcode::I32Eqz => testop!(I32),
        Opcode::I32Eq
        | Opcode::I32Ne
        | Opcode::I32LtS
        | Opcode::I32LtU
        | Opcode::I32GtS
        | Opcode::I32GtU
        | Opcode::I32LeS
        | Opcode::I32LeU
        | Opcode::I32GeS
        | Opcode::I32GeU => relop!(I32),
        Opcode::I64Eqz => {
            pop!(I64);
            push!(I32);
        }
        Opcode::I64Eq
        | Opcode::I64Ne
        | Opcode::I64LtS
        | Opcode::I64LtU
        | Opcode::I64GtS
        | Opcode::I64GtU
        | Opcode::I64LeS
        | Opcode::I64LeU
        | Opcode::I64GeS
        | Opcode::I64GeU => relop!(I64),
        Opcode::F32Eq | Opcode::F32Ne | Opcode::F32Lt | Opcode::F32Gt | Opcode::F32Le | Opcode::F32Ge => {
            relop!(F32)
        }
        Opcode::F64Eq | Opcode::F64Ne | Opcode::F64Lt | Opcode::F64Gt | Opcode::F64Le | Opcode::F64Ge => {
            relop!(F64)
        }

        Opcode::I32Clz | Opcode::I32Ctz | Opcode::I32Popcnt => unop!(I32),
        Opcode::I32Add
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
        | Opcode::I32Rotr => binop!(I32),
        Opcode::I64Clz | Opcode::I64Ctz | Opcode::I64Popcnt => unop!(I64),
        Opcode::I64Add
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
        | Opcode::I64Rotr => binop!(I64),
        Opcode::F32Abs
        | Opcode::F32Neg
        | Opcode::F32Ceil
        | Opcode::F32Floor
        | Opcode::F32Trunc
        | Opcode::F32Nearest
        | Opcode::F32Sqrt => unop!(F32),
        Opcode::F32Add
        | Opcode::F32Sub
        | Opcode::F32Mul
        | Opcode::F32Div
        | Opcode::F32Min
        | Opcode::F32Max
        | Opcode::F32Copysign => binop!(F32),
        Opcode::F64Abs
        | Opcode::F64Neg
        | Opcode::F64Ceil
        | Opcode::F64Floor
        | Opcode::F64Trunc
        | Opcode::F64Nearest
        | Opcode::F64Sqrt => unop!(F64),
        Opcode::F64Add
        | Opcode::F64Sub
        | Opcode::F64Mul
        | Opcode::F64Div
        | Opcode::F64Min
        | Opcode::F64Max
        | Opcode::F64Copysign => binop!(F64),

        Opcode::I32WrapI64 => cvtop!(I64, I32),
        Opcode::I32TruncF32S | Opcode::I32TruncF32U => cvtop!(F32, I32),
        Opcode::I32TruncF64S | Opcode::I32TruncF64U => cvtop!(F64, I32),
        Opcode::I64ExtendI32S | Opcode::I64ExtendI32U => cvtop!(I32, I64),
        Opcode::I64TruncF32S | Opcode::I64TruncF32U => cvtop!(F32, I64),
        Opcode::I64TruncF64S | Opcode::I64TruncF64U => cvtop!(F64, I64),
        Opcode::F32ConvertI32S | Opcode::F32ConvertI32U => cvtop!(I32, F32),
        Opcode::F32ConvertI64S | Opcode::F32ConvertI64U => cvtop!(I64, F32),
        Opcode::F32DemoteF64 => cvtop!(F64, F32),
        Opcode::F64ConvertI32S | Opcode::F64ConvertI32U => cvtop!(I32, F64),
        Opcode::F64ConvertI64S | Opcode::F64ConvertI64U => cvtop!(I64, F64),
        Opcode::F64PromoteF32 => cvtop!(F32, F64),
        Opcode::I32ReinterpretF32 => cvtop!(F32, I32),
        Opcode::I64ReinterpretF64 => cvtop!(F64, I64),
        Opcode::F32ReinterpretI32 => cvtop!(I32, F32),
        Opcode::F64ReinterpretI64 => cvtop!(I64, F64),
        Opcode::I32Extend8S | Opcode::I32Extend16S => unop!(I32),
        Opcode::I64Extend8S | Opcode::I64Extend16S | Opcode::I64Extend32S => unop!(I64),

        Opcode::BulkPrefix => checker_step_bulk(validator, checker, reader)?,
        Opcode::VectorPrefix => return Err(Error::UnsupportedVectorInstruction),
    }

    Ok(op)
}

fn require_memory<A: Allocator>(validator: &Validator<'_, A>) -> Result<(), Error> {
    if validator.memory_count() == 0 {
        Err(Error::InvalidMemoryIndex)
    } else {
        Ok(())
    }
}

// A memarg's alignment hint must not exceed the instruction's natural
// width: `2^align <= natural_align` where `natural_align` is `N/8` for a
// `t.load/store[N]`.
fn check_alignment(mem_arg: MemArg, natural_align: u32) -> Result<(), Error> {
    let within_bound = matches!(1u32.checked_shl(mem_arg.align), Some(bound) if bound <= natural_align);
    if within_bound {
        Ok(())
    } else {
        Err(Error::MisalignedMemoryAccess {
            align: mem_arg.align,
            natural_align,
        })
    }
}

// br_table's default label trails the list in the byte stream; we must see
// the arity of *some* label before validating the rest, so this peeks ahead
// without disturbing the reader used by the caller.
fn reader_peek_default_depth(reader: &Reader<'_>, skip: u32) -> u32 {
    let mut lookahead = *reader;
    for _ in 0..skip {
        lookahead.read_label_idx_raw();
    }
    lookahead.read_label_idx_raw()
}

fn checker_step_bulk<'module, A: Allocator + Clone>(
    validator: &mut Validator<'module, A>,
    checker: &mut Checker<'module, A>,
    reader: &mut Reader<'_>,
) -> Result<(), Error> {
    use ValType::I32;

    macro_rules! pop {
        ($t:expr) => {
            checker.pop_expect(Some($t))?
        };
    }
    macro_rules! push {
        ($t:expr) => {
            checker.push_val(Some($t))
        };
    }

    let bulk_op = reader.read_bulk_opcode();
    match bulk_op {
        BulkOpcode::I32TruncSatF32S | BulkOpcode::I32TruncSatF32U => {
            pop!(ValType::F32);
            push!(I32);
        }
        BulkOpcode::I32TruncSatF64S | BulkOpcode::I32TruncSatF64U => {
            pop!(ValType::F64);
            push!(I32);
        }
        BulkOpcode::I64TruncSatF32S | BulkOpcode::I64TruncSatF32U => {
            pop!(ValType::F32);
            push!(ValType::I64);
        }
        BulkOpcode::I64TruncSatF64S | BulkOpcode::I64TruncSatF64U => {
            pop!(ValType::F64);
            push!(ValType::I64);
        }
    }
    Ok(())
}
