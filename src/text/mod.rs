// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly text format ("WAT") parsing, per §4.1.
//!
//! [`parse_module`] produces exactly the same [`Module`] AST that
//! [`crate::Module::decode`] produces from the equivalent binary: abbreviated
//! forms (inline imports/exports, folded instructions, implicit type uses,
//! symbolic `$name` references) are all expanded to their canonical,
//! index-based forms here, so that nothing downstream — the validator, the
//! flattening pass, the interpreter — ever needs to know which format a
//! module came from.
//!
//! The grammar is walked in two passes over the same source text. The first
//! ([`symbols::scan`]) builds the four index spaces' `$name -> index` maps
//! so that forward references (a `call $later_func` before `$later_func`'s
//! own definition) resolve correctly; the second is the real recursive-
//! descent parse, consulting those maps whenever a symbolic reference is
//! read. Local and label namespaces don't need this: nothing in the text
//! format lets an instruction reference a local or label that isn't already
//! in scope, so those are resolved inline during the single real parse.

mod expr;
mod lexer;
mod symbols;

use core::fmt;

use crate::Allocator;
use crate::core_compat::boxed::Box;
use crate::core_compat::vec::Vec;
use crate::types::{
    CodeSection, DataSection, ElementSection, ExportSection, FunctionSection, GlobalSection,
    ImportSection, MemType, MemorySection, Name, StartSection, TableSection, TableType,
    TypeSection, Version,
};
use crate::Module;

use lexer::{Lexer, Pos, Tok};
use symbols::ModuleSymbols;

/// An error encountered while parsing WebAssembly text format source.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub line: u32,
    pub column: u32,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {:?}", self.line, self.column, self.kind)
    }
}

/// What went wrong while parsing WebAssembly text format source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    AllocError,
    DuplicateIdentifier,
    InvalidEscape,
    InvalidFloatLiteral,
    InvalidIntegerLiteral,
    UnexpectedByte,
    UnexpectedEof,
    UnexpectedToken,
    UndefinedIdentifier,
    UnknownMnemonic,
    UnterminatedBlockComment,
    UnterminatedString,
}

impl From<crate::core_compat::alloc::collections::TryReserveError> for Error {
    fn from(_: crate::core_compat::alloc::collections::TryReserveError) -> Self {
        Error {
            kind: ErrorKind::AllocError,
            line: 0,
            column: 0,
        }
    }
}

// The parser's working state: a token stream plus the symbol tables
// computed by the pre-scan pass, and the allocator the resulting AST is
// built with.
struct Parser<'a, A: Allocator> {
    lexer: Lexer<'a>,
    symbols: ModuleSymbols<'a>,
    alloc: A,
}

impl<'a, A: Allocator + Clone> Parser<'a, A> {
    fn err(&self, pos: Pos, kind: ErrorKind) -> Error {
        Error {
            kind,
            line: pos.line,
            column: pos.column,
        }
    }

    fn next_tok(&mut self) -> Result<(Tok<'a>, Pos), Error> {
        let here = self.lexer.peek()?.map(|(_, p)| p).unwrap_or_default();
        self.lexer
            .next()?
            .ok_or_else(|| self.err(here, ErrorKind::UnexpectedEof))
    }

    fn peek_tok(&self) -> Result<Option<(Tok<'a>, Pos)>, Error> {
        self.lexer.peek()
    }

    fn expect_lparen(&mut self) -> Result<(), Error> {
        let (tok, pos) = self.next_tok()?;
        match tok {
            Tok::LParen => Ok(()),
            _ => Err(self.err(pos, ErrorKind::UnexpectedToken)),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), Error> {
        let (tok, pos) = self.next_tok()?;
        match tok {
            Tok::RParen => Ok(()),
            _ => Err(self.err(pos, ErrorKind::UnexpectedToken)),
        }
    }

    // True, and consumed, if the next token is `)`.
    fn eat_rparen(&mut self) -> Result<bool, Error> {
        match self.peek_tok()? {
            Some((Tok::RParen, _)) => {
                self.next_tok()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn expect_atom(&mut self) -> Result<(&'a str, Pos), Error> {
        let (tok, pos) = self.next_tok()?;
        match tok {
            Tok::Atom(s) => Ok((s, pos)),
            _ => Err(self.err(pos, ErrorKind::UnexpectedToken)),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), Error> {
        let (atom, pos) = self.expect_atom()?;
        if atom == keyword {
            Ok(())
        } else {
            Err(self.err(pos, ErrorKind::UnexpectedToken))
        }
    }

    // If the next token is the list `(keyword ...)`, consumes the opening
    // paren and keyword and returns true, leaving the parser positioned to
    // read the clause's contents. Otherwise, consumes nothing.
    fn eat_clause(&mut self, keyword: &str) -> Result<bool, Error> {
        let checkpoint = self.lexer.clone();
        if let Some((Tok::LParen, _)) = self.peek_tok()? {
            self.next_tok()?;
            if let Some((Tok::Atom(atom), _)) = self.peek_tok()?
                && atom == keyword
            {
                self.next_tok()?;
                return Ok(true);
            }
        }
        self.lexer = checkpoint;
        Ok(false)
    }

    // Consumes a `$name` identifier atom, if present.
    fn eat_id(&mut self) -> Result<Option<&'a str>, Error> {
        if let Some((Tok::Atom(atom), _)) = self.peek_tok()?
            && atom.starts_with('$')
        {
            self.next_tok()?;
            return Ok(Some(atom));
        }
        Ok(None)
    }

    fn expect_string(&mut self) -> Result<Vec<u8, A>, Error> {
        let (tok, pos) = self.next_tok()?;
        match tok {
            Tok::Str(raw) => {
                lexer::unescape_string(raw, pos, self.alloc.clone()).map_err(|_| {
                    self.err(pos, ErrorKind::InvalidEscape)
                })
            }
            _ => Err(self.err(pos, ErrorKind::UnexpectedToken)),
        }
    }

    fn expect_name(&mut self) -> Result<Name<A>, Error> {
        let bytes = self.expect_string()?;
        let s = core::str::from_utf8(&bytes).map_err(|_| Error {
            kind: ErrorKind::InvalidEscape,
            line: 0,
            column: 0,
        })?;
        let boxed: Box<str, A> = {
            let (ptr, len, _, alloc) = bytes.into_raw_parts_with_alloc();
            debug_assert_eq!(len, s.len());
            // Safety: validated UTF-8 above; byte buffer is reused as-is.
            unsafe {
                Box::from_raw_in(
                    core::str::from_utf8_unchecked_mut(core::slice::from_raw_parts_mut(
                        ptr, len,
                    )),
                    alloc,
                )
            }
        };
        Ok(Name::new(boxed))
    }

    // Parses a numeric literal or `$name` reference for the given index
    // space, already resolved to its final u32 index.
    fn expect_idx(&mut self, space: symbols::Space) -> Result<u32, Error> {
        let (atom, pos) = self.expect_atom()?;
        self.resolve_idx(atom, pos, space)
    }

    fn resolve_idx(&self, atom: &str, pos: Pos, space: symbols::Space) -> Result<u32, Error> {
        if let Some(name) = atom.strip_prefix('$') {
            self.symbols
                .lookup(space, name)
                .ok_or_else(|| self.err(pos, ErrorKind::UndefinedIdentifier))
        } else {
            lexer::parse_u32(atom).ok_or_else(|| self.err(pos, ErrorKind::InvalidIntegerLiteral))
        }
    }

    fn parse_val_type(&mut self) -> Result<crate::types::ValType, Error> {
        use crate::types::ValType;
        let (atom, pos) = self.expect_atom()?;
        match atom {
            "i32" => Ok(ValType::I32),
            "i64" => Ok(ValType::I64),
            "f32" => Ok(ValType::F32),
            "f64" => Ok(ValType::F64),
            "funcref" => Ok(ValType::FuncRef),
            "externref" => Ok(ValType::ExternRef),
            _ => Err(self.err(pos, ErrorKind::UnexpectedToken)),
        }
    }

    fn parse_ref_type(&mut self) -> Result<crate::types::RefType, Error> {
        use crate::types::RefType;
        let (atom, pos) = self.expect_atom()?;
        match atom {
            "funcref" => Ok(RefType::Func),
            "externref" => Ok(RefType::Extern),
            _ => Err(self.err(pos, ErrorKind::UnexpectedToken)),
        }
    }

    fn parse_limits(&mut self) -> Result<crate::types::Limits, Error> {
        let (min_atom, min_pos) = self.expect_atom()?;
        let min = lexer::parse_u32(min_atom)
            .ok_or_else(|| self.err(min_pos, ErrorKind::InvalidIntegerLiteral))?;
        let max = match self.peek_tok()? {
            Some((Tok::Atom(atom), pos)) if lexer::parse_u32(atom).is_some() => {
                self.next_tok()?;
                Some(lexer::parse_u32(atom).ok_or_else(|| self.err(pos, ErrorKind::InvalidIntegerLiteral))?)
            }
            _ => None,
        };
        Ok(crate::types::Limits { min, max })
    }

    fn parse_table_type(&mut self) -> Result<TableType, Error> {
        let limits = self.parse_limits()?;
        let reftype = self.parse_ref_type()?;
        Ok(TableType { reftype, limits })
    }

    fn parse_mem_type(&mut self) -> Result<MemType, Error> {
        Ok(MemType::new(self.parse_limits()?))
    }

    fn parse_global_type(&mut self) -> Result<crate::types::GlobalType, Error> {
        use crate::types::{GlobalType, GlobalTypeMutability};
        if self.eat_clause("mut")? {
            let value = self.parse_val_type()?;
            self.expect_rparen()?;
            Ok(GlobalType {
                value,
                mutability: GlobalTypeMutability::Var,
            })
        } else {
            let value = self.parse_val_type()?;
            Ok(GlobalType {
                value,
                mutability: GlobalTypeMutability::Const,
            })
        }
    }

    // Parses a `(param ...)*  (result ...)*` sequence (each individual
    // `(param $id? t)` or `(result t)*`), recording any parameter
    // identifiers into `param_names` for later local resolution.
    fn parse_func_signature(
        &mut self,
        param_names: &mut Vec<Option<&'a str>, crate::core_compat::alloc::Global>,
    ) -> Result<crate::types::FunctionType<A>, Error> {
        let mut parameters = Vec::new_in(self.alloc.clone());
        while self.eat_clause("param")? {
            if let Some(id) = self.eat_id()? {
                let ty = self.parse_val_type()?;
                parameters.try_reserve(1)?;
                parameters.push(ty);
                param_names.try_reserve(1)?;
                param_names.push(Some(id));
            } else {
                // An un-named `(param t1 t2 ...)` clause may list several
                // types at once; none of them are nameable.
                loop {
                    if self.eat_rparen()? {
                        break;
                    }
                    let ty = self.parse_val_type()?;
                    parameters.try_reserve(1)?;
                    parameters.push(ty);
                    param_names.try_reserve(1)?;
                    param_names.push(None);
                    continue;
                }
                continue;
            }
            self.expect_rparen()?;
        }
        let mut results = Vec::new_in(self.alloc.clone());
        while self.eat_clause("result")? {
            loop {
                if self.eat_rparen()? {
                    break;
                }
                let ty = self.parse_val_type()?;
                results.try_reserve(1)?;
                results.push(ty);
            }
        }
        Ok(crate::types::FunctionType {
            parameters,
            results: crate::types::ResultType::new(results),
        })
    }
}

/// Parses a complete WebAssembly text format module.
pub(crate) fn parse_module<A: Allocator + Clone>(source: &str, alloc: A) -> Result<Module<A>, Error> {
    let symbols = symbols::scan(source)?;
    let mut parser = Parser {
        lexer: Lexer::new(source),
        symbols,
        alloc: alloc.clone(),
    };

    parser.expect_lparen()?;
    parser.expect_keyword("module")?;
    let _module_name = parser.eat_id()?;

    let mut typesec = TypeSection::new(Vec::new_in(alloc.clone()));
    let mut importsec_func = Vec::new_in(alloc.clone());
    let mut importsec_table = Vec::new_in(alloc.clone());
    let mut importsec_mem = Vec::new_in(alloc.clone());
    let mut importsec_global = Vec::new_in(alloc.clone());
    let mut funcsec = FunctionSection::new(Vec::new_in(alloc.clone()));
    let mut tablesec = TableSection::new(Vec::new_in(alloc.clone()));
    let mut memsec = MemorySection::new(Vec::new_in(alloc.clone()));
    let mut globalsec = GlobalSection::new(Vec::new_in(alloc.clone()));
    let mut exportsec = ExportSection::new(Vec::new_in(alloc.clone()));
    let mut startsec = None;
    let mut elemsec = ElementSection::new(Vec::new_in(alloc.clone()));
    let mut codesec = CodeSection::new(Vec::new_in(alloc.clone()));
    let mut datasec = DataSection::new(Vec::new_in(alloc.clone()));

    loop {
        if parser.eat_rparen()? {
            break;
        }
        parser.expect_lparen()?;
        let (keyword, pos) = parser.expect_atom()?;
        match keyword {
            "type" => {
                let _id = parser.eat_id()?;
                parser.expect_lparen()?;
                parser.expect_keyword("func")?;
                let mut param_names = Vec::new();
                let ty = parser.parse_func_signature(&mut param_names)?;
                parser.expect_rparen()?;
                typesec.0.try_reserve(1)?;
                typesec.0.push(ty);
            }
            "import" => {
                let module = parser.expect_name()?;
                let field = parser.expect_name()?;
                parser.expect_lparen()?;
                let (kind, kind_pos) = parser.expect_atom()?;
                let descriptor = match kind {
                    "func" => {
                        let _id = parser.eat_id()?;
                        crate::types::ImportDescriptor::Function(
                            parse_typeuse_only(&mut parser, &mut typesec)?,
                        )
                    }
                    "table" => {
                        let _id = parser.eat_id()?;
                        crate::types::ImportDescriptor::Table(parser.parse_table_type()?)
                    }
                    "memory" => {
                        let _id = parser.eat_id()?;
                        crate::types::ImportDescriptor::Memory(parser.parse_mem_type()?)
                    }
                    "global" => {
                        let _id = parser.eat_id()?;
                        crate::types::ImportDescriptor::Global(parser.parse_global_type()?)
                    }
                    _ => return Err(parser.err(kind_pos, ErrorKind::UnexpectedToken)),
                };
                parser.expect_rparen()?;
                parser.expect_rparen()?;
                let import = crate::types::Import {
                    module,
                    field,
                    descriptor,
                };
                match descriptor {
                    crate::types::ImportDescriptor::Function(_) => importsec_func.push(import),
                    crate::types::ImportDescriptor::Table(_) => importsec_table.push(import),
                    crate::types::ImportDescriptor::Memory(_) => importsec_mem.push(import),
                    crate::types::ImportDescriptor::Global(_) => importsec_global.push(import),
                }
            }
            "func" => {
                parse_func_field(
                    &mut parser,
                    pos,
                    &mut typesec,
                    &mut importsec_func,
                    &mut funcsec,
                    &mut codesec,
                    &mut exportsec,
                )?;
            }
            "table" => {
                parse_table_field(&mut parser, &mut importsec_table, &mut tablesec, &mut exportsec)?;
            }
            "memory" => {
                parse_memory_field(&mut parser, &mut importsec_mem, &mut memsec, &mut exportsec)?;
            }
            "global" => {
                parse_global_field(
                    &mut parser,
                    &mut importsec_global,
                    &mut globalsec,
                    &mut exportsec,
                )?;
            }
            "export" => {
                let field = parser.expect_name()?;
                parser.expect_lparen()?;
                let (kind, kind_pos) = parser.expect_atom()?;
                let descriptor = match kind {
                    "func" => crate::types::ExportDescriptor::Function(crate::types::FuncIdx::new(
                        parser.expect_idx(symbols::Space::Func)?,
                    )),
                    "table" => crate::types::ExportDescriptor::Table(crate::types::TableIdx::new(
                        parser.expect_idx(symbols::Space::Table)?,
                    )),
                    "memory" => crate::types::ExportDescriptor::Memory(crate::types::MemIdx::new(
                        parser.expect_idx(symbols::Space::Mem)?,
                    )),
                    "global" => crate::types::ExportDescriptor::Global(crate::types::GlobalIdx::new(
                        parser.expect_idx(symbols::Space::Global)?,
                    )),
                    _ => return Err(parser.err(kind_pos, ErrorKind::UnexpectedToken)),
                };
                parser.expect_rparen()?;
                parser.expect_rparen()?;
                exportsec.0.try_reserve(1)?;
                exportsec.0.push(crate::types::Export { field, descriptor });
            }
            "start" => {
                let idx = parser.expect_idx(symbols::Space::Func)?;
                parser.expect_rparen()?;
                startsec = Some(StartSection::new(crate::types::FuncIdx::new(idx)));
            }
            "elem" => {
                parse_elem_field(&mut parser, &mut elemsec)?;
            }
            "data" => {
                parse_data_field(&mut parser, &mut datasec)?;
            }
            _ => return Err(parser.err(pos, ErrorKind::UnexpectedToken)),
        }
    }

    // Group imports by kind, in textual order within each kind, matching
    // the order validate::prepare_module_for_validation would stably sort
    // a binary-decoded import section into (and the order the symbol scan
    // assumed when numbering each index space).
    let mut importsec = Vec::new_in(alloc.clone());
    importsec.try_reserve(
        importsec_func.len() + importsec_table.len() + importsec_mem.len() + importsec_global.len(),
    )?;
    importsec.extend(importsec_func);
    importsec.extend(importsec_table);
    importsec.extend(importsec_mem);
    importsec.extend(importsec_global);

    Ok(Module {
        version: Version::V1,
        typesec,
        importsec: ImportSection::new(importsec),
        funcsec,
        tablesec,
        memsec,
        globalsec,
        exportsec,
        startsec,
        elemsec,
        datacountsec: None,
        codesec,
        datasec,
    })
}

// Parses a typeuse that must resolve to a function type without binding any
// parameter names (the shape import descriptors need): either `(type idx)`,
// or an inline `(param ...)* (result ...)*` signature, which is appended to
// `typesec` as a fresh anonymous type.
fn parse_typeuse_only<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    typesec: &mut TypeSection<A>,
) -> Result<crate::types::TypeIdx, Error> {
    if parser.eat_clause("type")? {
        let idx = parser.expect_idx(symbols::Space::Type)?;
        parser.expect_rparen()?;
        // Any inline param/result clauses alongside an explicit `(type idx)`
        // are redundant restatements of that type's signature; skip them.
        let mut dummy = Vec::new();
        let _ = parser.parse_func_signature(&mut dummy)?;
        return Ok(crate::types::TypeIdx::new(idx));
    }
    let mut dummy = Vec::new();
    let ty = parser.parse_func_signature(&mut dummy)?;
    let idx = typesec.0.len() as u32;
    typesec.0.try_reserve(1)?;
    typesec.0.push(ty);
    Ok(crate::types::TypeIdx::new(idx))
}

#[allow(clippy::too_many_arguments)]
fn parse_func_field<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    _pos: Pos,
    typesec: &mut TypeSection<A>,
    importsec_func: &mut Vec<crate::types::Import<A>, A>,
    funcsec: &mut FunctionSection<A>,
    codesec: &mut CodeSection<A>,
    exportsec: &mut ExportSection<A>,
) -> Result<(), Error> {
    let _id = parser.eat_id()?;

    // Inline exports: `(export "name")*`.
    let mut pending_exports = Vec::new_in(parser.alloc.clone());
    loop {
        if parser.eat_clause("export")? {
            let name = parser.expect_name()?;
            parser.expect_rparen()?;
            pending_exports.try_reserve(1)?;
            pending_exports.push(name);
        } else {
            break;
        }
    }

    // Inline import: `(import "module" "name")`, in which case this field
    // declares no body of its own.
    if parser.eat_clause("import")? {
        let module = parser.expect_name()?;
        let field = parser.expect_name()?;
        parser.expect_rparen()?;
        let typeidx = parse_typeuse_only(parser, typesec)?;
        parser.expect_rparen()?;
        let funcidx = importsec_func.len() as u32;
        importsec_func.try_reserve(1)?;
        importsec_func.push(crate::types::Import {
            module,
            field,
            descriptor: crate::types::ImportDescriptor::Function(typeidx),
        });
        for name in pending_exports {
            exportsec.0.try_reserve(1)?;
            exportsec.0.push(crate::types::Export {
                field: name,
                descriptor: crate::types::ExportDescriptor::Function(crate::types::FuncIdx::new(
                    funcidx,
                )),
            });
        }
        return Ok(());
    }

    let funcidx = (importsec_func.len() + funcsec.0.len()) as u32;
    for name in pending_exports {
        exportsec.0.try_reserve(1)?;
        exportsec.0.push(crate::types::Export {
            field: name,
            descriptor: crate::types::ExportDescriptor::Function(crate::types::FuncIdx::new(
                funcidx,
            )),
        });
    }

    let mut param_names = Vec::new();
    let typeidx = if parser.eat_clause("type")? {
        let idx = parser.expect_idx(symbols::Space::Type)?;
        parser.expect_rparen()?;
        // Still consumed to bind any parameter identifiers used in the body.
        let _ = parser.parse_func_signature(&mut param_names)?;
        crate::types::TypeIdx::new(idx)
    } else {
        let ty = parser.parse_func_signature(&mut param_names)?;
        let idx = typesec.0.len() as u32;
        typesec.0.try_reserve(1)?;
        typesec.0.push(ty);
        crate::types::TypeIdx::new(idx)
    };

    // `(local $id? t)*` declarations, each contributing to the same flat
    // local namespace the parameters started.
    let mut local_names = Vec::new();
    let mut locals = Vec::new_in(parser.alloc.clone());
    while parser.eat_clause("local")? {
        if let Some(id) = parser.eat_id()? {
            let ty = parser.parse_val_type()?;
            local_names.try_reserve(1)?;
            local_names.push(Some(id));
            locals.try_reserve(1)?;
            locals.push(default_local(ty));
        } else {
            loop {
                if parser.eat_rparen()? {
                    break;
                }
                let ty = parser.parse_val_type()?;
                local_names.try_reserve(1)?;
                local_names.push(None);
                locals.try_reserve(1)?;
                locals.push(default_local(ty));
                continue;
            }
            continue;
        }
        parser.expect_rparen()?;
    }

    let mut locals_scope = expr::LocalsScope::new();
    locals_scope.extend(param_names);
    locals_scope.extend(local_names);
    let code = expr::parse_function_body(parser, &locals_scope)?;
    parser.expect_rparen()?;

    funcsec.0.try_reserve(1)?;
    funcsec.0.push(typeidx);
    codesec.0.try_reserve(1)?;
    codesec.0.push(crate::types::Function {
        locals: crate::types::Locals::new(locals),
        code,
    });
    Ok(())
}

fn default_local(ty: crate::types::ValType) -> crate::types::Local {
    use crate::types::{Local, ValType};
    match ty {
        ValType::I32 => Local::I32(0),
        ValType::I64 => Local::I64(0),
        ValType::F32 => Local::F32(0.0),
        ValType::F64 => Local::F64(0.0),
        ValType::FuncRef | ValType::ExternRef => Local::FuncRef(u32::MAX),
        ValType::Vec => Local::I64(0), // unsupported value type; never reached post-validation
    }
}

fn parse_table_field<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    importsec_table: &mut Vec<crate::types::Import<A>, A>,
    tablesec: &mut TableSection<A>,
    exportsec: &mut ExportSection<A>,
) -> Result<(), Error> {
    let _id = parser.eat_id()?;
    let mut pending_exports = Vec::new_in(parser.alloc.clone());
    while parser.eat_clause("export")? {
        let name = parser.expect_name()?;
        parser.expect_rparen()?;
        pending_exports.try_reserve(1)?;
        pending_exports.push(name);
    }

    if parser.eat_clause("import")? {
        let module = parser.expect_name()?;
        let field = parser.expect_name()?;
        parser.expect_rparen()?;
        let ty = parser.parse_table_type()?;
        parser.expect_rparen()?;
        let idx = importsec_table.len() as u32;
        importsec_table.try_reserve(1)?;
        importsec_table.push(crate::types::Import {
            module,
            field,
            descriptor: crate::types::ImportDescriptor::Table(ty),
        });
        push_exports(
            exportsec,
            pending_exports,
            crate::types::ExportDescriptor::Table(crate::types::TableIdx::new(idx)),
        )?;
        return Ok(());
    }

    let idx = (importsec_table.len() + tablesec.0.len()) as u32;
    push_exports(
        exportsec,
        pending_exports,
        crate::types::ExportDescriptor::Table(crate::types::TableIdx::new(idx)),
    )?;
    let ty = parser.parse_table_type()?;
    parser.expect_rparen()?;
    tablesec.0.try_reserve(1)?;
    tablesec.0.push(ty);
    Ok(())
}

fn parse_memory_field<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    importsec_mem: &mut Vec<crate::types::Import<A>, A>,
    memsec: &mut MemorySection<A>,
    exportsec: &mut ExportSection<A>,
) -> Result<(), Error> {
    let _id = parser.eat_id()?;
    let mut pending_exports = Vec::new_in(parser.alloc.clone());
    while parser.eat_clause("export")? {
        let name = parser.expect_name()?;
        parser.expect_rparen()?;
        pending_exports.try_reserve(1)?;
        pending_exports.push(name);
    }

    if parser.eat_clause("import")? {
        let module = parser.expect_name()?;
        let field = parser.expect_name()?;
        parser.expect_rparen()?;
        let ty = parser.parse_mem_type()?;
        parser.expect_rparen()?;
        let idx = importsec_mem.len() as u32;
        importsec_mem.try_reserve(1)?;
        importsec_mem.push(crate::types::Import {
            module,
            field,
            descriptor: crate::types::ImportDescriptor::Memory(ty),
        });
        push_exports(
            exportsec,
            pending_exports,
            crate::types::ExportDescriptor::Memory(crate::types::MemIdx::new(idx)),
        )?;
        return Ok(());
    }

    let idx = (importsec_mem.len() + memsec.0.len()) as u32;
    push_exports(
        exportsec,
        pending_exports,
        crate::types::ExportDescriptor::Memory(crate::types::MemIdx::new(idx)),
    )?;
    let ty = parser.parse_mem_type()?;
    parser.expect_rparen()?;
    memsec.0.try_reserve(1)?;
    memsec.0.push(ty);
    Ok(())
}

fn parse_global_field<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    importsec_global: &mut Vec<crate::types::Import<A>, A>,
    globalsec: &mut GlobalSection<A>,
    exportsec: &mut ExportSection<A>,
) -> Result<(), Error> {
    let _id = parser.eat_id()?;
    let mut pending_exports = Vec::new_in(parser.alloc.clone());
    while parser.eat_clause("export")? {
        let name = parser.expect_name()?;
        parser.expect_rparen()?;
        pending_exports.try_reserve(1)?;
        pending_exports.push(name);
    }

    if parser.eat_clause("import")? {
        let module = parser.expect_name()?;
        let field = parser.expect_name()?;
        parser.expect_rparen()?;
        let ty = parser.parse_global_type()?;
        parser.expect_rparen()?;
        let idx = importsec_global.len() as u32;
        importsec_global.try_reserve(1)?;
        importsec_global.push(crate::types::Import {
            module,
            field,
            descriptor: crate::types::ImportDescriptor::Global(ty),
        });
        push_exports(
            exportsec,
            pending_exports,
            crate::types::ExportDescriptor::Global(crate::types::GlobalIdx::new(idx)),
        )?;
        return Ok(());
    }

    let idx = (importsec_global.len() + globalsec.0.len()) as u32;
    push_exports(
        exportsec,
        pending_exports,
        crate::types::ExportDescriptor::Global(crate::types::GlobalIdx::new(idx)),
    )?;
    let ty = parser.parse_global_type()?;
    let init = expr::parse_const_expr(parser)?;
    parser.expect_rparen()?;
    globalsec.0.try_reserve(1)?;
    globalsec.0.push(crate::types::Global { ty, init });
    Ok(())
}

fn push_exports<A: Allocator + Clone>(
    exportsec: &mut ExportSection<A>,
    names: Vec<Name<A>, A>,
    descriptor: crate::types::ExportDescriptor,
) -> Result<(), Error> {
    for field in names {
        exportsec.0.try_reserve(1)?;
        exportsec.0.push(crate::types::Export { field, descriptor });
    }
    Ok(())
}

fn parse_elem_field<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    elemsec: &mut ElementSection<A>,
) -> Result<(), Error> {
    use crate::types::{ElementInit, ElementMode, ElementModeActive, ElementSegment, RefType};

    let _id = parser.eat_id()?;

    let declarative = if let Some((Tok::Atom("declare"), _)) = parser.peek_tok()? {
        parser.next_tok()?;
        true
    } else {
        false
    };

    let table = if parser.eat_clause("table")? {
        let idx = parser.expect_idx(symbols::Space::Table)?;
        parser.expect_rparen()?;
        Some(crate::types::TableIdx::new(idx))
    } else {
        None
    };

    let offset = if parser.eat_clause("offset")? {
        let e = expr::parse_instr_sequence_as_expr(parser)?;
        parser.expect_rparen()?;
        Some(e)
    } else if let Some((Tok::LParen, _)) = parser.peek_tok()? {
        // Abbreviated single-instruction offset, e.g. `(i32.const 0)`.
        if table.is_some() || declarative {
            None
        } else {
            Some(expr::parse_single_folded_instr_as_expr(parser)?)
        }
    } else {
        None
    };

    // Optional reftype/funcref-list element kind marker preceding the
    // element list itself.
    let ty = if let Some((Tok::Atom(atom), _)) = parser.peek_tok()?
        && (atom == "func" || atom == "funcref" || atom == "externref")
    {
        parser.next_tok()?;
        if atom == "func" {
            RefType::Func
        } else if atom == "funcref" {
            RefType::Func
        } else {
            RefType::Extern
        }
    } else {
        RefType::Func
    };

    let mut indices = Vec::new_in(parser.alloc.clone());
    loop {
        if parser.eat_rparen()? {
            break;
        }
        let idx = parser.expect_idx(symbols::Space::Func)?;
        indices.try_reserve(1)?;
        indices.push(crate::types::FuncIdx::new(idx));
    }

    let mode = if declarative {
        ElementMode::Declarative
    } else if let (Some(table), Some(offset)) = (table, offset) {
        ElementMode::Active(ElementModeActive { table, offset })
    } else if let Some(offset) = offset {
        ElementMode::Active(ElementModeActive {
            table: crate::types::TableIdx::new(0),
            offset,
        })
    } else {
        ElementMode::Passive
    };

    elemsec.0.try_reserve(1)?;
    elemsec.0.push(ElementSegment {
        ty,
        init: ElementInit::FunctionIndices(indices),
        mode,
    });
    Ok(())
}

fn parse_data_field<'a, A: Allocator + Clone>(
    parser: &mut Parser<'a, A>,
    datasec: &mut DataSection<A>,
) -> Result<(), Error> {
    use crate::types::{DataMode, DataModeActive, DataSegment};

    let _id = parser.eat_id()?;

    let memory = if parser.eat_clause("memory")? {
        let idx = parser.expect_idx(symbols::Space::Mem)?;
        parser.expect_rparen()?;
        Some(crate::types::MemIdx::new(idx))
    } else {
        None
    };

    let offset = if parser.eat_clause("offset")? {
        let e = expr::parse_instr_sequence_as_expr(parser)?;
        parser.expect_rparen()?;
        Some(e)
    } else if let Some((Tok::LParen, _)) = parser.peek_tok()? {
        Some(expr::parse_single_folded_instr_as_expr(parser)?)
    } else {
        None
    };

    let mut init = Vec::new_in(parser.alloc.clone());
    loop {
        if parser.eat_rparen()? {
            break;
        }
        let chunk = parser.expect_string()?;
        init.try_reserve(chunk.len())?;
        init.extend(chunk);
    }

    let mode = if let Some(offset) = offset {
        DataMode::Active(DataModeActive {
            memory: memory.unwrap_or(crate::types::MemIdx::new(0)),
            offset,
        })
    } else {
        DataMode::Passive()
    };

    datasec.0.try_reserve(1)?;
    datasec.0.push(DataSegment { init, mode });
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::Module;
    use crate::core_compat::alloc::Global;

    #[test]
    fn folded_instructions_expand_to_post_order() {
        let module = Module::parse(
            r#"(module
                 (func (result i32)
                   (i32.add (i32.const 1) (i32.const 2))))"#,
            Global,
        )
        .expect("parses");
        module.validate().expect("folded arithmetic should validate");
        assert_eq!(module.funcsec.len(), 1);
    }

    #[test]
    fn inline_export_is_expanded_into_export_section() {
        let module = Module::parse(
            r#"(module (func $f (export "f") (result i32) i32.const 0))"#,
            Global,
        )
        .expect("parses");
        assert_eq!(module.exportsec.len(), 1);
        assert_eq!(module.exportsec.iter().next().unwrap().field.as_ref(), "f");
    }

    #[test]
    fn inline_import_is_expanded_into_import_section() {
        let module = Module::parse(
            r#"(module (func (import "env" "f") (param i32) (result i32)))"#,
            Global,
        )
        .expect("parses");
        assert_eq!(module.importsec.len(), 1);
        let import = module.importsec.iter().next().unwrap();
        assert_eq!(import.module.as_ref(), "env");
        assert_eq!(import.field.as_ref(), "f");
        // An imported function occupies a function-index-space slot but has
        // no entry in funcsec/codesec (those are for module-defined bodies).
        assert_eq!(module.funcsec.len(), 0);
        module.validate().expect("import-only module should validate");
    }

    #[test]
    fn line_and_block_comments_are_whitespace() {
        let module = Module::parse(
            r#"(module
                 ;; a line comment
                 (func (export "f") (result i32) (; a block (; nested ;) comment ;) i32.const 0))"#,
            Global,
        )
        .expect("comments should be skipped");
        assert_eq!(module.funcsec.len(), 1);
    }

    #[test]
    fn hex_and_underscore_integer_literals_parse() {
        let module = Module::parse(
            r#"(module (func (result i32) i32.const 0x1_000))"#,
            Global,
        )
        .expect("parses");
        module.validate().expect("validates");
    }

    #[test]
    fn undefined_identifier_is_a_parse_error() {
        let result = Module::parse(r#"(module (func call $nonexistent))"#, Global);
        assert!(result.is_err());
    }
}
