// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The text format's tokenizer.
//!
//! WebAssembly text tokens fall into a small number of shapes: parens,
//! quoted strings, and "atoms" (a maximal run of `idchar`s, per §6's
//! identifier character class). Numbers, keywords, and `$name` identifiers
//! are all atoms lexically; the parser, not the lexer, decides which of
//! those a given atom is allowed to be at each grammar position. This
//! keeps the lexer itself tiny.

use crate::Allocator;
use crate::core_compat::vec::Vec;

use super::{Error, ErrorKind};

/// Whether a byte belongs to the WebAssembly text format's `idchar` class,
/// per §6: `[0-9A-Za-z!#$%&'*+\-./:<=>?@\^_\`|~]`.
fn is_idchar(b: u8) -> bool {
    matches!(
        b,
        b'0'..=b'9'
            | b'A'..=b'Z'
            | b'a'..=b'z'
            | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'/'
            | b':' | b'<' | b'=' | b'>' | b'?' | b'@' | b'\\' | b'^' | b'_' | b'`' | b'|' | b'~'
    )
}

/// A lexical token, borrowing directly from the source text.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Tok<'a> {
    LParen,
    RParen,
    /// A maximal run of `idchar`s: covers keywords, `$name` identifiers,
    /// and numeric literals alike. Classified by the parser.
    Atom(&'a str),
    /// The raw, still-escaped contents between a pair of `"`s.
    Str(&'a str),
}

/// A source position, for error reporting.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(super) struct Pos {
    pub(super) line: u32,
    pub(super) column: u32,
}

/// A streaming tokenizer with one token of lookahead.
#[derive(Clone)]
pub(super) struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub(super) fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn here(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn err(&self, kind: ErrorKind) -> Error {
        let pos = self.here();
        Error {
            kind,
            line: pos.line,
            column: pos.column,
        }
    }

    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes().get(self.pos).copied()
    }

    fn bump_byte(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    // Skips whitespace, line comments (`;; ...`), and nested block comments
    // (`(; ... ;)`).
    fn skip_trivia(&mut self) -> Result<(), Error> {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump_byte();
                }
                Some(b';') if self.bytes().get(self.pos + 1) == Some(&b';') => {
                    while !matches!(self.peek_byte(), None | Some(b'\n')) {
                        self.bump_byte();
                    }
                }
                Some(b'(') if self.bytes().get(self.pos + 1) == Some(&b';') => {
                    let start = self.here();
                    self.bump_byte();
                    self.bump_byte();
                    let mut depth = 1u32;
                    while depth > 0 {
                        match (self.peek_byte(), self.bytes().get(self.pos + 1).copied()) {
                            (Some(b'('), Some(b';')) => {
                                self.bump_byte();
                                self.bump_byte();
                                depth += 1;
                            }
                            (Some(b';'), Some(b')')) => {
                                self.bump_byte();
                                self.bump_byte();
                                depth -= 1;
                            }
                            (Some(_), _) => {
                                self.bump_byte();
                            }
                            (None, _) => {
                                return Err(Error {
                                    kind: ErrorKind::UnterminatedBlockComment,
                                    line: start.line,
                                    column: start.column,
                                });
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    // Scans a quoted string's raw (still-escaped) contents, leaving `pos`
    // just past the closing quote.
    fn scan_string(&mut self) -> Result<&'a str, Error> {
        let start_pos = self.here();
        debug_assert_eq!(self.peek_byte(), Some(b'"'));
        self.bump_byte();
        let content_start = self.pos;
        loop {
            match self.peek_byte() {
                Some(b'"') => {
                    let content = &self.src[content_start..self.pos];
                    self.bump_byte();
                    return Ok(content);
                }
                Some(b'\\') => {
                    self.bump_byte();
                    if self.bump_byte().is_none() {
                        break;
                    }
                }
                Some(_) => {
                    self.bump_byte();
                }
                None => break,
            }
        }
        Err(Error {
            kind: ErrorKind::UnterminatedString,
            line: start_pos.line,
            column: start_pos.column,
        })
    }

    /// Returns the next token without consuming it.
    pub(super) fn peek(&self) -> Result<Option<(Tok<'a>, Pos)>, Error> {
        self.clone().next()
    }

    /// Returns the next token, consuming it.
    pub(super) fn next(&mut self) -> Result<Option<(Tok<'a>, Pos)>, Error> {
        self.skip_trivia()?;
        let pos = self.here();
        let tok = match self.peek_byte() {
            None => return Ok(None),
            Some(b'(') => {
                self.bump_byte();
                Tok::LParen
            }
            Some(b')') => {
                self.bump_byte();
                Tok::RParen
            }
            Some(b'"') => Tok::Str(self.scan_string()?),
            Some(b) if is_idchar(b) => {
                let start = self.pos;
                while matches!(self.peek_byte(), Some(b) if is_idchar(b)) {
                    self.bump_byte();
                }
                Tok::Atom(&self.src[start..self.pos])
            }
            Some(_) => return Err(self.err(ErrorKind::UnexpectedByte)),
        };
        Ok(Some((tok, pos)))
    }
}

/// Decodes a string literal's escape sequences into raw bytes, per §6
/// ("string literals (with escape sequences)"). Recognizes `\n`, `\t`,
/// `\r`, `\\`, `\'`, `\"`, two-hex-digit byte escapes (`\XX`), and Unicode
/// scalar escapes (`\u{XXXX}`, encoded as UTF-8).
pub(super) fn unescape_string<A: Allocator>(
    raw: &str,
    pos: Pos,
    alloc: A,
) -> Result<Vec<u8, A>, Error> {
    let bytes = raw.as_bytes();
    let mut out = Vec::new_in(alloc);
    let mut i = 0;
    let err = || Error {
        kind: ErrorKind::InvalidEscape,
        line: pos.line,
        column: pos.column,
    };
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        match bytes.get(i) {
            Some(b'n') => {
                out.push(b'\n');
                i += 1;
            }
            Some(b't') => {
                out.push(b'\t');
                i += 1;
            }
            Some(b'r') => {
                out.push(b'\r');
                i += 1;
            }
            Some(b'\\') => {
                out.push(b'\\');
                i += 1;
            }
            Some(b'\'') => {
                out.push(b'\'');
                i += 1;
            }
            Some(b'"') => {
                out.push(b'"');
                i += 1;
            }
            Some(b'u') if bytes.get(i + 1) == Some(&b'{') => {
                let close = bytes[i + 2..].iter().position(|&b| b == b'}').ok_or_else(err)?;
                let hex = core::str::from_utf8(&bytes[i + 2..i + 2 + close]).map_err(|_| err())?;
                let scalar = u32::from_str_radix(hex, 16).map_err(|_| err())?;
                let ch = char::from_u32(scalar).ok_or_else(err)?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                i += 2 + close + 1;
            }
            Some(&h1) if h1.is_ascii_hexdigit() => {
                let h2 = *bytes.get(i + 1).ok_or_else(err)?;
                if !h2.is_ascii_hexdigit() {
                    return Err(err());
                }
                let hi = (h1 as char).to_digit(16).ok_or_else(err)?;
                let lo = (h2 as char).to_digit(16).ok_or_else(err)?;
                out.push(((hi << 4) | lo) as u8);
                i += 2;
            }
            _ => return Err(err()),
        }
    }
    Ok(out)
}

// Strips `_` digit-group separators, per §6's `num` production, returning a
// small fixed buffer (WAT numeric literals are never long enough to need
// dynamic allocation just to delete a few underscores).
fn strip_underscores(s: &str, buf: &mut [u8; 128]) -> Option<&str> {
    let mut len = 0;
    for b in s.bytes().filter(|&b| b != b'_') {
        *buf.get_mut(len)? = b;
        len += 1;
    }
    core::str::from_utf8(&buf[..len]).ok()
}

/// Parses a `u32` integer literal (decimal or `0x`-prefixed hex, with
/// optional `_` separators). Does not accept a leading sign.
pub(super) fn parse_u32(atom: &str) -> Option<u32> {
    let mut buf = [0u8; 128];
    let digits = strip_underscores(atom, &mut buf)?;
    if let Some(hex) = digits.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        digits.parse().ok()
    }
}

/// Parses a signed 32-bit integer literal per §6's `i32` production: a
/// decimal or hex literal, optionally signed, wrapping into range the way
/// the binary format's signed fields do (so e.g. `4294967295` and
/// `-1` both parse to the same bit pattern).
pub(super) fn parse_i32(atom: &str) -> Option<i32> {
    parse_signed_int(atom).map(|v| v as i32)
}

/// As [`parse_i32`], but for 64-bit integers.
pub(super) fn parse_i64(atom: &str) -> Option<i64> {
    parse_signed_int(atom)
}

fn parse_signed_int(atom: &str) -> Option<i64> {
    let (neg, rest) = match atom.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, atom.strip_prefix('+').unwrap_or(atom)),
    };
    let mut buf = [0u8; 128];
    let digits = strip_underscores(rest, &mut buf)?;
    let magnitude: u64 = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse().ok()?
    };
    if neg {
        Some((magnitude as i64).wrapping_neg())
    } else {
        Some(magnitude as i64)
    }
}

/// Parses an `f32` literal, per §6's `fN` production: decimal or hex
/// floating point, or one of `inf`, `nan`, `nan:0xHHH...`.
pub(super) fn parse_f32(atom: &str) -> Option<f32> {
    parse_f64(atom).map(|v| v as f32)
}

/// As [`parse_f32`], but for 64-bit floats.
pub(super) fn parse_f64(atom: &str) -> Option<f64> {
    let (neg, rest) = match atom.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, atom.strip_prefix('+').unwrap_or(atom)),
    };
    let sign = if neg { -1.0 } else { 1.0 };

    if let Some(nan_rest) = rest.strip_prefix("nan") {
        return if nan_rest.is_empty() {
            Some(sign * f64::NAN)
        } else {
            let payload_hex = nan_rest.strip_prefix(":0x")?;
            let mut buf = [0u8; 128];
            let digits = strip_underscores(payload_hex, &mut buf)?;
            let payload = u64::from_str_radix(digits, 16).ok()?;
            // Quiet NaN with an explicit mantissa payload, per the `nan:0xH`
            // literal form; sign folded into the top bit.
            let bits = (0x7ff0_0000_0000_0000u64 | (payload & 0x000f_ffff_ffff_ffff))
                | if neg { 0x8000_0000_0000_0000 } else { 0 };
            Some(f64::from_bits(bits))
        };
    }
    if rest == "inf" {
        return Some(sign * f64::INFINITY);
    }

    let mut buf = [0u8; 128];
    let digits = strip_underscores(rest, &mut buf)?;
    if let Some(hex) = digits.strip_prefix("0x") {
        parse_hex_float(hex).map(|v| sign * v)
    } else {
        digits.parse::<f64>().ok().map(|v| sign * v)
    }
}

// Parses a `0x`-prefixed hex float's remainder: `HHH.HHHp±DDD`, where the
// fractional part and the `p` exponent are each optional.
fn parse_hex_float(hex: &str) -> Option<f64> {
    let (mantissa_str, exponent) = match hex.split_once(['p', 'P']) {
        Some((m, e)) => (m, e.parse::<i32>().ok()?),
        None => (hex, 0),
    };
    let (int_part, frac_part) = match mantissa_str.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa_str, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut mantissa = 0f64;
    for c in int_part.chars() {
        mantissa = mantissa * 16.0 + c.to_digit(16)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        mantissa += c.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    Some(mantissa * 2f64.powi(exponent))
}
