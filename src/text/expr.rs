// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Instruction sequences: the text counterpart to [`decode::ExpressionEncoder`].
//!
//! Both the binary decoder and this module funnel their opcodes through the
//! same [`ExpressionEncoder`], so a function body parsed from source and one
//! decoded from a `.wasm` blob produce bit-identical [`Expression`]s; nothing
//! downstream can tell which format an expression came from.
//!
//! The index spaces for locals and labels have no entry in [`symbols::Space`]
//! (§9's pre-scan only covers module-level spaces), so both are resolved
//! here instead: [`LocalsScope`] is a flat name list built from a function's
//! params and locals in declaration order, and labels are tracked as a stack
//! pushed on every `block`/`loop`/`if` and popped on exit, with `$name`
//! references resolved to a depth counted from the innermost entry.
//!
//! Folded instructions are parsed depth-first: an instruction's own fixed
//! immediates (including clause-shaped ones like `call_indirect`'s
//! `(type $t)`) are read first, then any remaining parenthesized children are
//! its operand sub-instructions, parsed and written to the encoder before the
//! instruction itself is. [`PendingInstr`] exists to make that reordering
//! possible: parsing an instruction never touches the encoder directly,
//! only `PendingInstr::emit` does, once the caller knows what (if anything)
//! needs to come first.

use crate::core_compat::alloc::Global;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::decode::ExpressionEncoder;
use crate::types::{
    BlockType, BrTableOperands, BulkOpcode, CallIndirectOperands, Expression, LabelIdx, MemArg,
    Opcode, SelectTOperands, TableIdx, TypeIdx, ValType,
};
use crate::Allocator;

use super::lexer::{self, Pos, Tok};
use super::symbols::Space;
use super::{Error, ErrorKind, Parser};

/// The flat local-index namespace of a single function: parameters then
/// declared locals, in source order, each optionally named.
pub(super) struct LocalsScope<'a> {
    names: Vec<Option<&'a str>, Global>,
}

impl<'a> LocalsScope<'a> {
    pub(super) fn new() -> Self {
        Self { names: Vec::new() }
    }

    pub(super) fn extend(&mut self, names: Vec<Option<&'a str>, Global>) {
        self.names.extend(names);
    }

    fn resolve(&self, name: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|n| *n == Some(name))
            .map(|i| i as u32)
    }
}

type Labels<'a> = Vec<Option<&'a str>, Global>;

/// Parses a function body: the instruction sequence making up a `func`
/// field, up to but not including its closing `)`.
pub(super) fn parse_function_body<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    locals: &LocalsScope<'a>,
) -> Result<Expression<A>, Error> {
    parse_sequence_until_rparen(parser, locals)
}

/// Parses a constant expression, e.g. a global's initializer.
pub(super) fn parse_const_expr<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
) -> Result<Expression<A>, Error> {
    let locals = LocalsScope::new();
    parse_sequence_until_rparen(parser, &locals)
}

/// Parses a flat instruction sequence with no locals in scope, e.g. an
/// element or data segment's explicit `(offset ...)` clause.
pub(super) fn parse_instr_sequence_as_expr<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
) -> Result<Expression<A>, Error> {
    let locals = LocalsScope::new();
    parse_sequence_until_rparen(parser, &locals)
}

/// Parses the abbreviated single-instruction form of an offset expression,
/// e.g. `(i32.const 0)`, consuming both of its parens itself.
pub(super) fn parse_single_folded_instr_as_expr<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
) -> Result<Expression<A>, Error> {
    let locals = LocalsScope::new();
    let mut labels: Labels<'a> = Vec::new();
    let mut enc = ExpressionEncoder::new(parser_alloc(parser));
    parse_folded_instr(parser, &locals, &mut labels, &mut enc)?;
    enc.write_opcode(Opcode::End)?;
    Ok(enc.finalize())
}

fn parser_alloc<'a, A: Allocator + Clone>(parser: &Parser<'a, A>) -> A {
    parser.alloc.clone()
}

fn parse_sequence_until_rparen<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    locals: &LocalsScope<'a>,
) -> Result<Expression<A>, Error> {
    let mut labels: Labels<'a> = Vec::new();
    let mut enc = ExpressionEncoder::new(parser_alloc(parser));
    loop {
        match parser.peek_tok()? {
            Some((Tok::RParen, _)) | None => break,
            _ => parse_instr(parser, locals, &mut labels, &mut enc)?,
        }
    }
    enc.write_opcode(Opcode::End)?;
    Ok(enc.finalize())
}

// A fully-parsed instruction, not yet written to the encoder. Kept apart
// from `ExpressionEncoder::write_*` so a folded instruction's operand
// sub-instructions can be parsed (and themselves written) in between
// parsing this instruction and emitting it.
enum PendingInstr<A: Allocator> {
    Op(Opcode),
    OpU32(Opcode, u32),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    MemArg(Opcode, MemArg),
    Select,
    SelectT(SelectTOperands<A>),
    CallIndirect(CallIndirectOperands),
    BrTable(BrTableOperands<A>),
    Bulk(BulkOpcode),
}

impl<A: Allocator> PendingInstr<A> {
    fn emit(self, enc: &mut ExpressionEncoder<A>) -> Result<(), TryReserveError> {
        match self {
            PendingInstr::Op(op) => enc.write_opcode(op),
            PendingInstr::OpU32(op, v) => {
                enc.write_opcode(op)?;
                enc.write_u32(v)
            }
            PendingInstr::I32(v) => {
                enc.write_opcode(Opcode::I32Const)?;
                enc.write_i32(v)
            }
            PendingInstr::I64(v) => {
                enc.write_opcode(Opcode::I64Const)?;
                enc.write_i64(v)
            }
            PendingInstr::F32(v) => {
                enc.write_opcode(Opcode::F32Const)?;
                enc.write_f32(v)
            }
            PendingInstr::F64(v) => {
                enc.write_opcode(Opcode::F64Const)?;
                enc.write_f64(v)
            }
            PendingInstr::MemArg(op, mem_arg) => {
                enc.write_opcode(op)?;
                enc.write_mem_arg(mem_arg)
            }
            PendingInstr::Select => enc.write_opcode(Opcode::Select),
            PendingInstr::SelectT(types) => {
                enc.write_opcode(Opcode::SelectT)?;
                enc.write_select_t(types)
            }
            PendingInstr::CallIndirect(operands) => {
                enc.write_opcode(Opcode::CallIndirect)?;
                enc.write_call_indirect(operands)
            }
            PendingInstr::BrTable(operands) => {
                enc.write_opcode(Opcode::BrTable)?;
                enc.write_br_table(operands)
            }
            PendingInstr::Bulk(op) => {
                enc.write_opcode(Opcode::BulkPrefix)?;
                enc.write_bulk_opcode(op)
            }
        }
    }
}

// Reads one instruction, folded `(...)` or flat, writing it (and anything
// it turns out to need first) to `enc`.
fn parse_instr<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    locals: &LocalsScope<'a>,
    labels: &mut Labels<'a>,
    enc: &mut ExpressionEncoder<A>,
) -> Result<(), Error> {
    match parser.peek_tok()? {
        Some((Tok::LParen, _)) => parse_folded_instr(parser, locals, labels, enc),
        Some((Tok::Atom(_), _)) => {
            let (mnemonic, pos) = parser.expect_atom()?;
            parse_flat_mnemonic(parser, mnemonic, pos, locals, labels, enc)
        }
        Some((_, pos)) => Err(parser.err(pos, ErrorKind::UnexpectedToken)),
        None => Err(parser.err(Pos::default(), ErrorKind::UnexpectedEof)),
    }
}

fn parse_flat_mnemonic<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    mnemonic: &'a str,
    pos: Pos,
    locals: &LocalsScope<'a>,
    labels: &mut Labels<'a>,
    enc: &mut ExpressionEncoder<A>,
) -> Result<(), Error> {
    match mnemonic {
        "block" => parse_block_or_loop(parser, locals, labels, enc, Opcode::Block, false),
        "loop" => parse_block_or_loop(parser, locals, labels, enc, Opcode::Loop, false),
        "if" => parse_if_flat(parser, locals, labels, enc),
        _ => {
            let pending = parse_plain_mnemonic(parser, mnemonic, pos, locals, labels)?;
            Ok(pending.emit(enc)?)
        }
    }
}

// Consumes a complete `(...)` folded instruction, including both of its
// parens.
fn parse_folded_instr<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    locals: &LocalsScope<'a>,
    labels: &mut Labels<'a>,
    enc: &mut ExpressionEncoder<A>,
) -> Result<(), Error> {
    parser.expect_lparen()?;
    let (mnemonic, pos) = parser.expect_atom()?;
    match mnemonic {
        "block" => return parse_block_or_loop(parser, locals, labels, enc, Opcode::Block, true),
        "loop" => return parse_block_or_loop(parser, locals, labels, enc, Opcode::Loop, true),
        "if" => return parse_if_folded(parser, locals, labels, enc),
        _ => {}
    }
    // Fixed immediates (including clause-shaped ones, e.g. call_indirect's
    // `(type $t)`) are consumed first; whatever parenthesized children
    // remain are this instruction's operand sub-expressions, which must be
    // written to `enc` before this instruction itself is.
    let pending = parse_plain_mnemonic(parser, mnemonic, pos, locals, labels)?;
    loop {
        if parser.eat_rparen()? {
            break;
        }
        parse_folded_instr(parser, locals, labels, enc)?;
    }
    Ok(pending.emit(enc)?)
}

fn parse_block_type<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
) -> Result<BlockType, Error> {
    if parser.eat_clause("type")? {
        let idx = parser.expect_idx(Space::Type)?;
        parser.expect_rparen()?;
        // A `(type $t)` clause may be redundantly followed by the
        // signature it names; parsed and discarded, same as an import's
        // inline typeuse.
        let mut discarded_names = Vec::new();
        let _ = parser.parse_func_signature(&mut discarded_names)?;
        return Ok(BlockType::TypeIndex(TypeIdx::new(idx)));
    }
    if parser.eat_clause("result")? {
        let ty = parser.parse_val_type()?;
        parser.expect_rparen()?;
        return Ok(BlockType::Result(ty));
    }
    Ok(BlockType::Empty)
}

fn parse_block_or_loop<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    locals: &LocalsScope<'a>,
    labels: &mut Labels<'a>,
    enc: &mut ExpressionEncoder<A>,
    op: Opcode,
    folded: bool,
) -> Result<(), Error> {
    let label_name = parser.eat_id()?;
    let block_type = parse_block_type(parser)?;
    enc.write_opcode(op)?;
    enc.write_block_type(block_type)?;
    labels.try_reserve(1)?;
    labels.push(label_name);

    loop {
        if folded {
            if parser.eat_rparen()? {
                break;
            }
        } else if matches!(parser.peek_tok()?, Some((Tok::Atom("end"), _))) {
            break;
        }
        parse_instr(parser, locals, labels, enc)?;
    }
    labels.pop();
    enc.write_opcode(Opcode::End)?;

    if !folded {
        parser.expect_keyword("end")?;
        let _ = parser.eat_id()?;
    }
    Ok(())
}

fn parse_if_folded<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    locals: &LocalsScope<'a>,
    labels: &mut Labels<'a>,
    enc: &mut ExpressionEncoder<A>,
) -> Result<(), Error> {
    let label_name = parser.eat_id()?;
    let block_type = parse_block_type(parser)?;

    // Any folded instructions preceding `(then ...)` compute the branch
    // condition; their bytecode is written first, as any operand would be.
    while !parser.eat_clause("then")? {
        parse_folded_instr(parser, locals, labels, enc)?;
    }

    enc.write_opcode(Opcode::If)?;
    enc.write_block_type(block_type)?;
    labels.try_reserve(1)?;
    labels.push(label_name);

    loop {
        if parser.eat_rparen()? {
            break;
        }
        parse_instr(parser, locals, labels, enc)?;
    }

    if parser.eat_clause("else")? {
        enc.write_opcode(Opcode::Else)?;
        loop {
            if parser.eat_rparen()? {
                break;
            }
            parse_instr(parser, locals, labels, enc)?;
        }
    }

    labels.pop();
    enc.write_opcode(Opcode::End)?;
    parser.expect_rparen()?;
    Ok(())
}

fn parse_if_flat<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    locals: &LocalsScope<'a>,
    labels: &mut Labels<'a>,
    enc: &mut ExpressionEncoder<A>,
) -> Result<(), Error> {
    let label_name = parser.eat_id()?;
    let block_type = parse_block_type(parser)?;
    enc.write_opcode(Opcode::If)?;
    enc.write_block_type(block_type)?;
    labels.try_reserve(1)?;
    labels.push(label_name);

    loop {
        match parser.peek_tok()? {
            Some((Tok::Atom("else"), _)) | Some((Tok::Atom("end"), _)) => break,
            _ => parse_instr(parser, locals, labels, enc)?,
        }
    }

    if let Some((Tok::Atom("else"), _)) = parser.peek_tok()? {
        parser.next_tok()?;
        let _ = parser.eat_id()?;
        enc.write_opcode(Opcode::Else)?;
        loop {
            match parser.peek_tok()? {
                Some((Tok::Atom("end"), _)) => break,
                _ => parse_instr(parser, locals, labels, enc)?,
            }
        }
    }

    parser.expect_keyword("end")?;
    let _ = parser.eat_id()?;
    labels.pop();
    enc.write_opcode(Opcode::End)?;
    Ok(())
}

fn resolve_label<'a, A: Allocator + Clone>(
    parser: &Parser<'a, A>,
    labels: &[Option<&'a str>],
    atom: &str,
    pos: Pos,
) -> Result<u32, Error> {
    if let Some(name) = atom.strip_prefix('$') {
        labels
            .iter()
            .rev()
            .position(|n| *n == Some(name))
            .map(|i| i as u32)
            .ok_or_else(|| parser.err(pos, ErrorKind::UndefinedIdentifier))
    } else {
        lexer::parse_u32(atom).ok_or_else(|| parser.err(pos, ErrorKind::InvalidIntegerLiteral))
    }
}

fn parse_label_atom<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    labels: &[Option<&'a str>],
) -> Result<u32, Error> {
    let (atom, pos) = parser.expect_atom()?;
    resolve_label(parser, labels, atom, pos)
}

fn parse_local_atom<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    locals: &LocalsScope<'a>,
) -> Result<u32, Error> {
    let (atom, pos) = parser.expect_atom()?;
    if let Some(name) = atom.strip_prefix('$') {
        locals
            .resolve(name)
            .ok_or_else(|| parser.err(pos, ErrorKind::UndefinedIdentifier))
    } else {
        lexer::parse_u32(atom).ok_or_else(|| parser.err(pos, ErrorKind::InvalidIntegerLiteral))
    }
}

fn parse_br_table_operands<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    labels: &[Option<&'a str>],
) -> Result<BrTableOperands<A>, Error> {
    let (first_atom, first_pos) = parser.expect_atom()?;
    let mut last = resolve_label(parser, labels, first_atom, first_pos)?;
    let mut targets = Vec::new_in(parser_alloc(parser));
    loop {
        match parser.peek_tok()? {
            Some((Tok::Atom(atom), pos)) => {
                parser.next_tok()?;
                targets.try_reserve(1)?;
                targets.push(LabelIdx::new(last));
                last = resolve_label(parser, labels, atom, pos)?;
            }
            _ => break,
        }
    }
    Ok(BrTableOperands {
        labels: targets,
        default: LabelIdx::new(last),
    })
}

fn parse_call_indirect_operands<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
) -> Result<CallIndirectOperands, Error> {
    let table = match parser.peek_tok()? {
        Some((Tok::Atom(_), _)) => parser.expect_idx(Space::Table)?,
        _ => 0,
    };
    parser.expect_lparen()?;
    parser.expect_keyword("type")?;
    let ty = parser.expect_idx(Space::Type)?;
    parser.expect_rparen()?;
    // Optional inline `(param ...)`/`(result ...)` restating the type's
    // signature, discarded the same way a `(type $t)` block type's does.
    let mut discarded_names = Vec::new();
    let _ = parser.parse_func_signature(&mut discarded_names)?;
    Ok(CallIndirectOperands {
        table: TableIdx::new(table),
        ty: TypeIdx::new(ty),
    })
}

fn parse_optional_select_result_types<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
) -> Result<Vec<ValType, A>, Error> {
    let mut types = Vec::new_in(parser_alloc(parser));
    while parser.eat_clause("result")? {
        loop {
            if parser.eat_rparen()? {
                break;
            }
            let ty = parser.parse_val_type()?;
            types.try_reserve(1)?;
            types.push(ty);
        }
    }
    Ok(types)
}

fn parse_i32_literal<'a, A: Allocator + Clone>(parser: &mut Parser<'a, A>) -> Result<i32, Error> {
    let (atom, pos) = parser.expect_atom()?;
    lexer::parse_i32(atom).ok_or_else(|| parser.err(pos, ErrorKind::InvalidIntegerLiteral))
}

fn parse_i64_literal<'a, A: Allocator + Clone>(parser: &mut Parser<'a, A>) -> Result<i64, Error> {
    let (atom, pos) = parser.expect_atom()?;
    lexer::parse_i64(atom).ok_or_else(|| parser.err(pos, ErrorKind::InvalidIntegerLiteral))
}

fn parse_f32_literal<'a, A: Allocator + Clone>(parser: &mut Parser<'a, A>) -> Result<f32, Error> {
    let (atom, pos) = parser.expect_atom()?;
    lexer::parse_f32(atom).ok_or_else(|| parser.err(pos, ErrorKind::InvalidFloatLiteral))
}

fn parse_f64_literal<'a, A: Allocator + Clone>(parser: &mut Parser<'a, A>) -> Result<f64, Error> {
    let (atom, pos) = parser.expect_atom()?;
    lexer::parse_f64(atom).ok_or_else(|| parser.err(pos, ErrorKind::InvalidFloatLiteral))
}

// `offset=N`/`align=N` attributes on a load or store; either, both, or
// neither may be present, each defaulting per the opcode's natural
// alignment. `align=` is given as a byte count in source but stored as its
// log2, matching the binary encoding.
fn parse_mem_arg<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    natural_align_log2: u32,
) -> Result<MemArg, Error> {
    let mut offset = 0u32;
    let mut align = natural_align_log2;
    loop {
        match parser.peek_tok()? {
            Some((Tok::Atom(atom), pos)) if atom.starts_with("offset=") => {
                parser.next_tok()?;
                offset = lexer::parse_u32(&atom["offset=".len()..])
                    .ok_or_else(|| parser.err(pos, ErrorKind::InvalidIntegerLiteral))?;
            }
            Some((Tok::Atom(atom), pos)) if atom.starts_with("align=") => {
                parser.next_tok()?;
                let bytes = lexer::parse_u32(&atom["align=".len()..])
                    .ok_or_else(|| parser.err(pos, ErrorKind::InvalidIntegerLiteral))?;
                if bytes == 0 || !bytes.is_power_of_two() {
                    return Err(parser.err(pos, ErrorKind::InvalidIntegerLiteral));
                }
                align = bytes.trailing_zeros();
            }
            _ => break,
        }
    }
    Ok(MemArg { offset, align })
}

fn memarg_opcode(mnemonic: &str) -> Option<(Opcode, u32)> {
    use Opcode::*;
    Some(match mnemonic {
        "i32.load" => (I32Load, 2),
        "i64.load" => (I64Load, 3),
        "f32.load" => (F32Load, 2),
        "f64.load" => (F64Load, 3),
        "i32.load8_s" => (I32Load8S, 0),
        "i32.load8_u" => (I32Load8U, 0),
        "i32.load16_s" => (I32Load16S, 1),
        "i32.load16_u" => (I32Load16U, 1),
        "i64.load8_s" => (I64Load8S, 0),
        "i64.load8_u" => (I64Load8U, 0),
        "i64.load16_s" => (I64Load16S, 1),
        "i64.load16_u" => (I64Load16U, 1),
        "i64.load32_s" => (I64Load32S, 2),
        "i64.load32_u" => (I64Load32U, 2),
        "i32.store" => (I32Store, 2),
        "i64.store" => (I64Store, 3),
        "f32.store" => (F32Store, 2),
        "f64.store" => (F64Store, 3),
        "i32.store8" => (I32Store8, 0),
        "i32.store16" => (I32Store16, 1),
        "i64.store8" => (I64Store8, 0),
        "i64.store16" => (I64Store16, 1),
        "i64.store32" => (I64Store32, 2),
        _ => return None,
    })
}

fn bulk_trunc_sat_opcode(mnemonic: &str) -> Option<BulkOpcode> {
    use BulkOpcode::*;
    Some(match mnemonic {
        "i32.trunc_sat_f32_s" => I32TruncSatF32S,
        "i32.trunc_sat_f32_u" => I32TruncSatF32U,
        "i32.trunc_sat_f64_s" => I32TruncSatF64S,
        "i32.trunc_sat_f64_u" => I32TruncSatF64U,
        "i64.trunc_sat_f32_s" => I64TruncSatF32S,
        "i64.trunc_sat_f32_u" => I64TruncSatF32U,
        "i64.trunc_sat_f64_s" => I64TruncSatF64S,
        "i64.trunc_sat_f64_u" => I64TruncSatF64U,
        _ => return None,
    })
}

// Every opcode that takes no immediate and no operand-folding clause: the
// bulk of the numeric instruction set.
fn zero_operand_opcode(mnemonic: &str) -> Option<Opcode> {
    use Opcode::*;
    Some(match mnemonic {
        "unreachable" => Unreachable,
        "nop" => Nop,
        "return" => Return,
        "drop" => Drop,
        "memory.size" => MemorySize,
        "memory.grow" => MemoryGrow,
        "i32.eqz" => I32Eqz,
        "i32.eq" => I32Eq,
        "i32.ne" => I32Ne,
        "i32.lt_s" => I32LtS,
        "i32.lt_u" => I32LtU,
        "i32.gt_s" => I32GtS,
        "i32.gt_u" => I32GtU,
        "i32.le_s" => I32LeS,
        "i32.le_u" => I32LeU,
        "i32.ge_s" => I32GeS,
        "i32.ge_u" => I32GeU,
        "i64.eqz" => I64Eqz,
        "i64.eq" => I64Eq,
        "i64.ne" => I64Ne,
        "i64.lt_s" => I64LtS,
        "i64.lt_u" => I64LtU,
        "i64.gt_s" => I64GtS,
        "i64.gt_u" => I64GtU,
        "i64.le_s" => I64LeS,
        "i64.le_u" => I64LeU,
        "i64.ge_s" => I64GeS,
        "i64.ge_u" => I64GeU,
        "f32.eq" => F32Eq,
        "f32.ne" => F32Ne,
        "f32.lt" => F32Lt,
        "f32.gt" => F32Gt,
        "f32.le" => F32Le,
        "f32.ge" => F32Ge,
        "f64.eq" => F64Eq,
        "f64.ne" => F64Ne,
        "f64.lt" => F64Lt,
        "f64.gt" => F64Gt,
        "f64.le" => F64Le,
        "f64.ge" => F64Ge,
        "i32.clz" => I32Clz,
        "i32.ctz" => I32Ctz,
        "i32.popcnt" => I32Popcnt,
        "i32.add" => I32Add,
        "i32.sub" => I32Sub,
        "i32.mul" => I32Mul,
        "i32.div_s" => I32DivS,
        "i32.div_u" => I32DivU,
        "i32.rem_s" => I32RemS,
        "i32.rem_u" => I32RemU,
        "i32.and" => I32And,
        "i32.or" => I32Or,
        "i32.xor" => I32Xor,
        "i32.shl" => I32Shl,
        "i32.shr_s" => I32ShrS,
        "i32.shr_u" => I32ShrU,
        "i32.rotl" => I32Rotl,
        "i32.rotr" => I32Rotr,
        "i64.clz" => I64Clz,
        "i64.ctz" => I64Ctz,
        "i64.popcnt" => I64Popcnt,
        "i64.add" => I64Add,
        "i64.sub" => I64Sub,
        "i64.mul" => I64Mul,
        "i64.div_s" => I64DivS,
        "i64.div_u" => I64DivU,
        "i64.rem_s" => I64RemS,
        "i64.rem_u" => I64RemU,
        "i64.and" => I64And,
        "i64.or" => I64Or,
        "i64.xor" => I64Xor,
        "i64.shl" => I64Shl,
        "i64.shr_s" => I64ShrS,
        "i64.shr_u" => I64ShrU,
        "i64.rotl" => I64Rotl,
        "i64.rotr" => I64Rotr,
        "f32.abs" => F32Abs,
        "f32.neg" => F32Neg,
        "f32.ceil" => F32Ceil,
        "f32.floor" => F32Floor,
        "f32.trunc" => F32Trunc,
        "f32.nearest" => F32Nearest,
        "f32.sqrt" => F32Sqrt,
        "f32.add" => F32Add,
        "f32.sub" => F32Sub,
        "f32.mul" => F32Mul,
        "f32.div" => F32Div,
        "f32.min" => F32Min,
        "f32.max" => F32Max,
        "f32.copysign" => F32Copysign,
        "f64.abs" => F64Abs,
        "f64.neg" => F64Neg,
        "f64.ceil" => F64Ceil,
        "f64.floor" => F64Floor,
        "f64.trunc" => F64Trunc,
        "f64.nearest" => F64Nearest,
        "f64.sqrt" => F64Sqrt,
        "f64.add" => F64Add,
        "f64.sub" => F64Sub,
        "f64.mul" => F64Mul,
        "f64.div" => F64Div,
        "f64.min" => F64Min,
        "f64.max" => F64Max,
        "f64.copysign" => F64Copysign,
        "i32.wrap_i64" => I32WrapI64,
        "i32.trunc_f32_s" => I32TruncF32S,
        "i32.trunc_f32_u" => I32TruncF32U,
        "i32.trunc_f64_s" => I32TruncF64S,
        "i32.trunc_f64_u" => I32TruncF64U,
        "i64.extend_i32_s" => I64ExtendI32S,
        "i64.extend_i32_u" => I64ExtendI32U,
        "i64.trunc_f32_s" => I64TruncF32S,
        "i64.trunc_f32_u" => I64TruncF32U,
        "i64.trunc_f64_s" => I64TruncF64S,
        "i64.trunc_f64_u" => I64TruncF64U,
        "f32.convert_i32_s" => F32ConvertI32S,
        "f32.convert_i32_u" => F32ConvertI32U,
        "f32.convert_i64_s" => F32ConvertI64S,
        "f32.convert_i64_u" => F32ConvertI64U,
        "f32.demote_f64" => F32DemoteF64,
        "f64.convert_i32_s" => F64ConvertI32S,
        "f64.convert_i32_u" => F64ConvertI32U,
        "f64.convert_i64_s" => F64ConvertI64S,
        "f64.convert_i64_u" => F64ConvertI64U,
        "f64.promote_f32" => F64PromoteF32,
        "i32.reinterpret_f32" => I32ReinterpretF32,
        "i64.reinterpret_f64" => I64ReinterpretF64,
        "f32.reinterpret_i32" => F32ReinterpretI32,
        "f64.reinterpret_i64" => F64ReinterpretI64,
        "i32.extend8_s" => I32Extend8S,
        "i32.extend16_s" => I32Extend16S,
        "i64.extend8_s" => I64Extend8S,
        "i64.extend16_s" => I64Extend16S,
        "i64.extend32_s" => I64Extend32S,
        _ => return None,
    })
}

// Parses one instruction's own mnemonic-specific immediates (`block`,
// `loop`, and `if` are handled by their dedicated callers before reaching
// here). Never touches the encoder: the caller decides when to emit,
// since a folded instruction's operands must be emitted first.
fn parse_plain_mnemonic<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    mnemonic: &'a str,
    pos: Pos,
    locals: &LocalsScope<'a>,
    labels: &[Option<&'a str>],
) -> Result<PendingInstr<A>, Error> {
    match mnemonic {
        "br" => Ok(PendingInstr::OpU32(Opcode::Br, parse_label_atom(parser, labels)?)),
        "br_if" => Ok(PendingInstr::OpU32(Opcode::BrIf, parse_label_atom(parser, labels)?)),
        "br_table" => Ok(PendingInstr::BrTable(parse_br_table_operands(parser, labels)?)),
        "call" => Ok(PendingInstr::OpU32(Opcode::Call, parser.expect_idx(Space::Func)?)),
        "call_indirect" => Ok(PendingInstr::CallIndirect(parse_call_indirect_operands(parser)?)),
        "global.get" => Ok(PendingInstr::OpU32(Opcode::GlobalGet, parser.expect_idx(Space::Global)?)),
        "global.set" => Ok(PendingInstr::OpU32(Opcode::GlobalSet, parser.expect_idx(Space::Global)?)),
        "local.get" => Ok(PendingInstr::OpU32(Opcode::LocalGet, parse_local_atom(parser, locals)?)),
        "local.set" => Ok(PendingInstr::OpU32(Opcode::LocalSet, parse_local_atom(parser, locals)?)),
        "local.tee" => Ok(PendingInstr::OpU32(Opcode::LocalTee, parse_local_atom(parser, locals)?)),
        "select" => {
            let types = parse_optional_select_result_types(parser)?;
            if types.is_empty() {
                Ok(PendingInstr::Select)
            } else {
                Ok(PendingInstr::SelectT(SelectTOperands { types }))
            }
        }
        "i32.const" => Ok(PendingInstr::I32(parse_i32_literal(parser)?)),
        "i64.const" => Ok(PendingInstr::I64(parse_i64_literal(parser)?)),
        "f32.const" => Ok(PendingInstr::F32(parse_f32_literal(parser)?)),
        "f64.const" => Ok(PendingInstr::F64(parse_f64_literal(parser)?)),
        _ => {
            if let Some((op, align_log2)) = memarg_opcode(mnemonic) {
                return Ok(PendingInstr::MemArg(op, parse_mem_arg(parser, align_log2)?));
            }
            if let Some(op) = bulk_trunc_sat_opcode(mnemonic) {
                return Ok(PendingInstr::Bulk(op));
            }
            if let Some(op) = zero_operand_opcode(mnemonic) {
                return Ok(PendingInstr::Op(op));
            }
            Err(parser.err(pos, ErrorKind::UnknownMnemonic))
        }
    }
}
