// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The decoded module AST and its public entry points.
//!
//! A [`Module`] is the single representation produced by both the binary and
//! text decoders (§3 "Module (AST)"); everything downstream (the validator,
//! the interpreter's flattening pass, the embedder's instantiation routine)
//! operates on this one type regardless of which format it came from.

use crate::core_compat::vec::Vec;
use crate::decode;
use crate::storage::{Buffer, Stream};
use crate::text;
use crate::types::{
    CodeSection, DataSection, ElementSection, ExportSection, FunctionSection, GlobalSection,
    ImportSection, MemorySection, StartSection, TableSection, TypeSection, Version,
};
use crate::validate;
use crate::{Allocator, ValidationError};

pub use decode::{CustomSectionVisitor, Error as DecodeError, NoCustomSectionVisitor};

/// A decoded WebAssembly module, in the uniform abstract syntax shared by the
/// binary and text decoders.
///
/// Entities within each of the module's index spaces (types, functions,
/// tables, memories, globals) appear in declaration order: imports first,
/// then module-defined entities, per §9 "Index spaces and late binding".
#[derive(Debug)]
pub struct Module<A: Allocator> {
    /// The WebAssembly format version this module was decoded as.
    pub version: Version,
    /// Function type declarations.
    pub typesec: TypeSection<A>,
    /// Imported functions, tables, memories, and globals.
    pub importsec: ImportSection<A>,
    /// Type indices for module-defined functions.
    pub funcsec: FunctionSection<A>,
    /// Module-defined table declarations.
    pub tablesec: TableSection<A>,
    /// Module-defined memory declarations.
    pub memsec: MemorySection<A>,
    /// Module-defined global declarations.
    pub globalsec: GlobalSection<A>,
    /// Export declarations.
    pub exportsec: ExportSection<A>,
    /// The start function, if any.
    pub startsec: Option<StartSection>,
    /// Element segments used to initialize tables.
    pub elemsec: ElementSection<A>,
    /// The declared count of data segments, if the format recorded one ahead
    /// of the data section (only the binary format does; checked against
    /// `datasec.len()` during validation).
    pub datacountsec: Option<u32>,
    /// Function bodies, indexed in parallel with `funcsec`.
    pub codesec: CodeSection<A>,
    /// Data segments used to initialize linear memory.
    pub datasec: DataSection<A>,
}

impl<A: Allocator + Clone> Module<A> {
    /// Decodes a module from its WebAssembly binary representation.
    ///
    /// `customsec_visitor` is given the opportunity to capture custom
    /// sections by name; sections it declines are skipped without
    /// allocation.
    pub fn decode<Storage, CustomSecVisitor>(
        storage: Storage,
        customsec_visitor: &mut CustomSecVisitor,
        alloc: A,
    ) -> Result<Self, decode::ErrorWithContext<Storage>>
    where
        Storage: Stream,
        CustomSecVisitor: CustomSectionVisitor<A>,
    {
        let mut context = decode::ContextStack::default();
        let mut module = decode::decode_module(storage, &mut context, customsec_visitor, alloc)
            .map_err(|error| decode::ErrorWithContext { error, context })?;
        validate::prepare_module_for_validation(&mut module);
        Ok(module)
    }

    /// Parses a module from its WebAssembly text representation.
    ///
    /// Abbreviated forms (inline imports/exports, folded instructions,
    /// inline types, inline element/data segments) are expanded to their
    /// canonical forms per §4.1; the result is indistinguishable from a
    /// module produced by [`Module::decode`] of the equivalent binary.
    pub fn parse(source: &str, alloc: A) -> Result<Self, text::Error> {
        let mut module = text::parse_module(source, alloc)?;
        validate::prepare_module_for_validation(&mut module);
        Ok(module)
    }

    /// Type-checks this module's structure and every instruction sequence it
    /// contains against the WebAssembly typing rules.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate::validate_module(self)
    }
}

// Convenience accessors shared by the validator and the runtime's
// instantiation routine for mapping a module's index spaces to their
// import/local split. Kept here (rather than duplicated in `runtime`) since
// both consumers need exactly the same counts.
impl<A: Allocator> Module<A> {
    pub(crate) fn local_function_count(&self) -> usize {
        self.funcsec.len()
    }

    pub(crate) fn local_table_count(&self) -> usize {
        self.tablesec.len()
    }

    pub(crate) fn local_memory_count(&self) -> usize {
        self.memsec.len()
    }

    pub(crate) fn local_global_count(&self) -> usize {
        self.globalsec.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_compat::alloc::Global;

    fn add_wasm() -> Vec<u8> {
        // (module
        //   (func (export "add") (param i32 i32) (result i32)
        //     local.get 0
        //     local.get 1
        //     i32.add))
        vec![
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x07, 0x01, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f, // type section
            0x03, 0x02, 0x01, 0x00, // function section
            0x07, 0x07, 0x01, 0x03, b'a', b'd', b'd', 0x00, 0x00, // export section
            0x0a, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b, // code section
        ]
    }

    #[test]
    fn decode_and_validate_simple_module() {
        let bytes = add_wasm();
        let module = Module::decode(Buffer::new(bytes.as_slice()), &mut NoCustomSectionVisitor {}, Global)
            .expect("decode should succeed");
        module.validate().expect("module should validate");
        assert_eq!(module.typesec.len(), 1);
        assert_eq!(module.codesec.len(), 1);
    }
}
