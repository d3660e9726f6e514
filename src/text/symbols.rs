// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The pre-scan pass: a lightweight walk over a module's top-level fields
//! that records every `$name` binding without doing a full grammar-aware
//! parse, so the real parser can resolve a forward reference (`call
//! $later`) the first time it sees it rather than patching it up after the
//! fact.
//!
//! Each of the four importable index spaces is numbered import-first, per
//! §2's "index space" rule: imports of a kind occupy the low indices in the
//! order they appear in the source, followed by that module's own
//! definitions of the same kind, also in source order. This holds even
//! though imports and definitions may be textually interleaved, so the scan
//! keeps two queues per kind and concatenates them once the whole module
//! has been walked.

use crate::core_compat::vec::Vec;

use super::lexer::{Lexer, Tok};
use super::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Space {
    Type,
    Func,
    Table,
    Mem,
    Global,
    Elem,
    Data,
}

// A flat `$name -> index` table. Module symbol counts are small enough
// that a linear scan beats the bookkeeping of a sorted structure.
struct Table<'a> {
    entries: Vec<(&'a str, u32), crate::core_compat::alloc::Global>,
}

impl<'a> Table<'a> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn push(&mut self, name: &'a str) -> Result<(), Error> {
        let index = self.entries.len() as u32;
        self.entries
            .try_reserve(1)
            .map_err(|_| alloc_err())?;
        self.entries.push((name, index));
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, i)| *i)
    }
}

pub(super) struct ModuleSymbols<'a> {
    types: Table<'a>,
    funcs: Table<'a>,
    tables: Table<'a>,
    mems: Table<'a>,
    globals: Table<'a>,
    elems: Table<'a>,
    datas: Table<'a>,
}

impl<'a> ModuleSymbols<'a> {
    pub(super) fn lookup(&self, space: Space, name: &str) -> Option<u32> {
        match space {
            Space::Type => self.types.lookup(name),
            Space::Func => self.funcs.lookup(name),
            Space::Table => self.tables.lookup(name),
            Space::Mem => self.mems.lookup(name),
            Space::Global => self.globals.lookup(name),
            Space::Elem => self.elems.lookup(name),
            Space::Data => self.datas.lookup(name),
        }
    }
}

fn alloc_err() -> Error {
    Error {
        kind: ErrorKind::AllocError,
        line: 0,
        column: 0,
    }
}

// Per-kind bookkeeping during the scan: two ordered id lists, imports and
// local definitions, concatenated at the end.
struct Kind<'a> {
    imports: Table<'a>,
    locals: Table<'a>,
}

impl<'a> Kind<'a> {
    fn new() -> Self {
        Self {
            imports: Table::new(),
            locals: Table::new(),
        }
    }

    fn finish(self) -> Table<'a> {
        let Kind { mut imports, locals } = self;
        for (name, _) in locals.entries {
            imports.push(name).ok();
        }
        imports
    }
}

pub(super) fn scan(source: &str) -> Result<ModuleSymbols<'_>, Error> {
    let mut lexer = Lexer::new(source);

    let mut types = Table::new();
    let mut funcs = Kind::new();
    let mut tables = Kind::new();
    let mut mems = Kind::new();
    let mut globals = Kind::new();
    let mut elems = Table::new();
    let mut datas = Table::new();

    // `(module`
    expect_lparen(&mut lexer)?;
    expect_atom(&mut lexer, "module")?;
    skip_optional_id(&mut lexer)?;

    loop {
        match lexer.next()? {
            None => break,
            Some((Tok::RParen, _)) => break,
            Some((Tok::LParen, _)) => {}
            Some(_) => return Err(err(&lexer, ErrorKind::UnexpectedToken)),
        }
        let (keyword, pos) = match lexer.next()? {
            Some((Tok::Atom(a), p)) => (a, p),
            _ => return Err(err(&lexer, ErrorKind::UnexpectedToken)),
        };
        match keyword {
            "type" => {
                if let Some(id) = peek_id(&mut lexer)? {
                    types.push(id)?;
                }
                skip_balanced(&mut lexer, 1)?;
            }
            "import" => {
                // (import "module" "name" (kind $id? ...))
                skip_string(&mut lexer)?;
                skip_string(&mut lexer)?;
                expect_lparen(&mut lexer)?;
                let (kind, _) = match lexer.next()? {
                    Some((Tok::Atom(a), p)) => (a, p),
                    _ => return Err(err(&lexer, ErrorKind::UnexpectedToken)),
                };
                let id = peek_id(&mut lexer)?;
                skip_balanced(&mut lexer, 1)?; // closes the `(kind ...)` clause
                skip_balanced(&mut lexer, 1)?; // closes the `(import ...)` field
                if let Some(id) = id {
                    match kind {
                        "func" => funcs.imports.push(id)?,
                        "table" => tables.imports.push(id)?,
                        "memory" => mems.imports.push(id)?,
                        "global" => globals.imports.push(id)?,
                        _ => return Err(err(&lexer, ErrorKind::UnexpectedToken)),
                    }
                } else {
                    match kind {
                        "func" => {}
                        "table" => {}
                        "memory" => {}
                        "global" => {}
                        _ => return Err(err(&lexer, ErrorKind::UnexpectedToken)),
                    }
                }
                let _ = pos;
            }
            "func" => scan_importable(&mut lexer, &mut funcs)?,
            "table" => scan_importable(&mut lexer, &mut tables)?,
            "memory" => scan_importable(&mut lexer, &mut mems)?,
            "global" => scan_importable(&mut lexer, &mut globals)?,
            "export" | "start" => {
                skip_balanced(&mut lexer, 1)?;
            }
            "elem" => {
                if let Some(id) = peek_id(&mut lexer)? {
                    elems.push(id)?;
                }
                skip_balanced(&mut lexer, 1)?;
            }
            "data" => {
                if let Some(id) = peek_id(&mut lexer)? {
                    datas.push(id)?;
                }
                skip_balanced(&mut lexer, 1)?;
            }
            _ => return Err(err(&lexer, ErrorKind::UnexpectedToken)),
        }
    }

    Ok(ModuleSymbols {
        types,
        funcs: funcs.finish(),
        tables: tables.finish(),
        mems: mems.finish(),
        globals: globals.finish(),
        elems,
        datas,
    })
}

// Scans a `func`/`table`/`memory`/`global` field (the keyword already
// consumed): an optional `$id`, then zero or more `(export ...)` clauses,
// then either `(import "mod" "name" ...)` or the field's own local
// content, either way registering the id under the right queue.
fn scan_importable<'a>(lexer: &mut Lexer<'a>, kind: &mut Kind<'a>) -> Result<(), Error> {
    let id = peek_id(lexer)?;
    loop {
        match lexer.peek()? {
            Some((Tok::LParen, _)) => {
                let checkpoint = lexer.clone();
                lexer.next()?;
                match lexer.peek()? {
                    Some((Tok::Atom("export"), _)) => {
                        skip_balanced(lexer, 1)?;
                        continue;
                    }
                    Some((Tok::Atom("import"), _)) => {
                        lexer.next()?;
                        skip_balanced(lexer, 1)?; // rest of `(import ...)`
                        skip_balanced(lexer, 1)?; // rest of the outer field
                        if let Some(id) = id {
                            kind.imports.push(id)?;
                        }
                        return Ok(());
                    }
                    _ => {
                        *lexer = checkpoint;
                        break;
                    }
                }
            }
            _ => break,
        }
    }
    skip_balanced(lexer, 1)?;
    if let Some(id) = id {
        kind.locals.push(id)?;
    }
    Ok(())
}

fn peek_id<'a>(lexer: &mut Lexer<'a>) -> Result<Option<&'a str>, Error> {
    if let Some((Tok::Atom(atom), _)) = lexer.peek()?
        && atom.starts_with('$')
    {
        lexer.next()?;
        return Ok(Some(atom));
    }
    Ok(None)
}

fn expect_lparen(lexer: &mut Lexer<'_>) -> Result<(), Error> {
    match lexer.next()? {
        Some((Tok::LParen, _)) => Ok(()),
        _ => Err(err(lexer, ErrorKind::UnexpectedToken)),
    }
}

fn expect_atom(lexer: &mut Lexer<'_>, keyword: &str) -> Result<(), Error> {
    match lexer.next()? {
        Some((Tok::Atom(a), _)) if a == keyword => Ok(()),
        _ => Err(err(lexer, ErrorKind::UnexpectedToken)),
    }
}

fn skip_optional_id(lexer: &mut Lexer<'_>) -> Result<(), Error> {
    peek_id(lexer).map(|_| ())
}

fn skip_string(lexer: &mut Lexer<'_>) -> Result<(), Error> {
    match lexer.next()? {
        Some((Tok::Str(_), _)) => Ok(()),
        _ => Err(err(lexer, ErrorKind::UnexpectedToken)),
    }
}

// Consumes tokens until the paren nesting returns to zero, given we are
// currently `depth` parens deep (the caller has already consumed the
// opening paren(s) that put us there).
fn skip_balanced(lexer: &mut Lexer<'_>, mut depth: i32) -> Result<(), Error> {
    while depth > 0 {
        match lexer.next()? {
            Some((Tok::LParen, _)) => depth += 1,
            Some((Tok::RParen, _)) => depth -= 1,
            Some(_) => {}
            None => return Err(err(lexer, ErrorKind::UnexpectedEof)),
        }
    }
    Ok(())
}

fn err(lexer: &Lexer<'_>, kind: ErrorKind) -> Error {
    let pos = lexer.peek().ok().flatten().map(|(_, p)| p).unwrap_or_default();
    Error {
        kind,
        line: pos.line,
        column: pos.column,
    }
}
