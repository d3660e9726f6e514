// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

mod expr;
mod validate_impls;

use crate::types::{
    FuncIdx, FunctionType, GlobalIdx, GlobalType, ImportDescriptor, Limits, SectionId, TableIdx,
    TableType, TypeIdx, ValType,
};
use crate::{Allocator, Module};

pub(crate) use expr::{ExpressionValidationContext, validate_expression};

/// Represents errors that can arise during module validation.
#[derive(Clone, Copy, Debug)]
pub enum Error {
    DataCountMismatch {
        expected: usize,
        actual: usize,
    },
    DuplicateExportName {
        exportsec_idx: u32,
    },
    FunctionAndCodeSectionMismatch {
        funcsec_size: u32,
        codesec_size: u32,
    },
    IndexOutOfBounds {
        id: SectionId,
        index: u32,
        capacity: u32,
    },
    /// A global assignment (`global.set`) targeted a global declared `const`.
    ImmutableGlobalAssignment {
        globalidx: u32,
    },
    /// A constant expression (global initializer, element/data offset) used an
    /// instruction other than the handful the spec permits there.
    InvalidConstantExpression,
    InvalidMemType(Limits),
    /// A memory instruction was used in a module with no memory section.
    InvalidMemoryIndex,
    InvalidStartFunction(FuncIdx),
    InvalidTableLimits(Limits),
    /// A `t.load`/`t.store[N]`'s declared alignment (`2^align`) exceeded the
    /// instruction's natural width `N/8` in bytes.
    MisalignedMemoryAccess {
        align: u32,
        natural_align: u32,
    },
    /// The operand stack underflowed the current control frame's height.
    OperandStackUnderflow,
    /// More than one memory was declared (counting imports). The MVP
    /// supports only a single linear memory per module.
    TooManyMemories {
        count: u32,
    },
    /// More than one table was declared (counting imports). The MVP
    /// supports only a single table per module.
    TooManyTables {
        count: u32,
    },
    /// An operand's type didn't match what the instruction required.
    TypeMismatch {
        expected: Option<ValType>,
        actual: Option<ValType>,
    },
    /// A branch, `end`, or implicit `else` left the control/operand stack in
    /// a shape other than what its frame's type requires.
    UnbalancedControlStack,
    /// A 0xfd-prefixed vector (SIMD) instruction appeared in the expression.
    UnsupportedVectorInstruction,
    /// A function type declared more than one result, which this runtime
    /// (fixed at the MVP's single-value-result restriction) can't represent.
    UnsupportedMultiValueResult {
        typeidx: u32,
    },
}

// Called at the end of Module::decode() to reorder the import and export
// sections in a way convenient for validation:
// * imports are *stably* reordered by type, since logical grouping makes for
//   O(1) access by funcidx/tableidx/memidx/globalidx, easier determination of
//   the number of imports by type, and easier separaton later on.
// * exports are reordered by field name, making it easier to determine whether
//   they are all unique.
pub(crate) fn prepare_module_for_validation<A: Allocator>(module: &mut Module<A>) {
    module
        .importsec
        .0
        .sort_by_key(|import| import.descriptor.discriminant());
    module
        .exportsec
        .0
        .sort_by(|a, b| a.field.as_ref().cmp(b.field.as_ref()));
}

pub(crate) struct Validator<'module, A: Allocator> {
    module: &'module Module<A>,

    // The exclusive ending index within the import section of the functions, or
    // `import_tableidx_end` if there are none.
    import_funcidx_end: usize,

    // The exclusive ending index within the import section of the tables, or
    // `import_memidx_end` if there are none.
    import_tableidx_end: usize,

    // The exclusive ending index within the import section of the memories, or
    // the end index of the whole section if there are none.
    import_memidx_end: usize,
}

impl<'module, A: Allocator> Validator<'module, A> {
    fn new(module: &'module Module<A>) -> Self {
        // Recall that the import section was stably sorted by type in
        // prepare_module_for_validation().
        let mut import_tableidx_start = None;
        let mut import_memidx_start = None;
        let mut import_globalidx_start = None;
        for (idx, import) in module.importsec.iter().enumerate() {
            match import.descriptor {
                ImportDescriptor::Function(_) => {}
                ImportDescriptor::Table(_) => {
                    if import_tableidx_start.is_none() {
                        import_tableidx_start = Some(idx);
                    }
                }
                ImportDescriptor::Memory(_) => {
                    if import_memidx_start.is_none() {
                        import_memidx_start = Some(idx);
                    }
                }
                ImportDescriptor::Global(_) => {
                    import_globalidx_start = Some(idx);
                    break;
                }
            }
        }

        let import_memidx_end = import_globalidx_start.unwrap_or(module.importsec.len());
        let import_tableidx_end = import_memidx_start.unwrap_or(import_memidx_end);
        let import_funcidx_end = import_tableidx_start.unwrap_or(import_tableidx_end);
        Self {
            module,
            import_funcidx_end,
            import_tableidx_end,
            import_memidx_end,
        }
    }

    fn data_count(&self) -> usize {
        self.module.datasec.len()
    }

    fn element_count(&self) -> usize {
        self.module.elemsec.len()
    }

    fn function_count(&self) -> usize {
        self.module.funcsec.len() + self.import_funcidx_end
    }

    fn global_count(&self) -> usize {
        self.module.globalsec.len() + (self.module.importsec.len() - self.import_memidx_end)
    }

    fn memory_count(&self) -> usize {
        self.module.memsec.len() + (self.import_memidx_end - self.import_tableidx_end)
    }

    fn table_count(&self) -> usize {
        self.module.tablesec.len() + (self.import_tableidx_end - self.import_funcidx_end)
    }

    fn type_count(&self) -> usize {
        self.module.typesec.len()
    }

    fn function_type(&self, typeidx: TypeIdx) -> &'module FunctionType<A> {
        &self.module.typesec[*typeidx as usize]
    }

    fn allocator(&self) -> A
    where
        A: Clone,
    {
        self.module.typesec.allocator().clone()
    }

    // Whether `globalidx` names an imported global, as opposed to one the
    // module itself declares. Constant expressions may only reference the
    // former.
    fn global_is_imported(&self, globalidx: GlobalIdx) -> bool {
        let num_imported = self.module.importsec.len() - self.import_memidx_end;
        (*globalidx as usize) < num_imported
    }

    fn global_type(&self, globalidx: GlobalIdx) -> GlobalType {
        let idx = *globalidx as usize;
        let num_imported = self.module.importsec.len() - self.import_memidx_end;
        if idx < num_imported {
            let import = &self.module.importsec[self.import_memidx_end + idx];
            let ImportDescriptor::Global(ty) = import.descriptor else {
                unreachable!();
            };
            ty
        } else {
            self.module.globalsec[idx - num_imported].ty
        }
    }

    fn table_type(&self, tableidx: TableIdx) -> TableType {
        let idx = *tableidx as usize;
        let num_imported = self.import_tableidx_end - self.import_funcidx_end;
        if idx < num_imported {
            let import = &self.module.importsec[self.import_funcidx_end + idx];
            let ImportDescriptor::Table(ty) = import.descriptor else {
                unreachable!();
            };
            ty
        } else {
            self.module.tablesec[idx - num_imported]
        }
    }

    fn function_signature(&self, funcidx: FuncIdx) -> &'module FunctionType<A> {
        let idx = *funcidx as usize;
        let typeidx = if idx < self.import_funcidx_end {
            let import = &self.module.importsec[idx];
            let ImportDescriptor::Function(typeidx) = &import.descriptor else {
                unreachable!();
            };
            *typeidx
        } else {
            let idx = idx - self.import_funcidx_end;
            debug_assert!(idx < self.module.funcsec.len());
            self.module.funcsec[idx]
        };
        self.function_type(typeidx)
    }

    fn validate<T: Validate<A>>(&mut self, value: &T) -> Result<(), Error> {
        value.validate(self)
    }
}

trait Validate<A: Allocator> {
    fn validate(&self, validator: &mut Validator<A>) -> Result<(), Error>;
}

pub(crate) fn validate_module<A: Allocator>(module: &Module<A>) -> Result<(), Error> {
    let mut validator = Validator::new(module);

    let memory_count = validator.memory_count() as u32;
    if memory_count > 1 {
        return Err(Error::TooManyMemories {
            count: memory_count,
        });
    }

    let table_count = validator.table_count() as u32;
    if table_count > 1 {
        return Err(Error::TooManyTables { count: table_count });
    }

    validator.validate(&module.typesec)?;
    validator.validate(&module.importsec)?;
    validator.validate(&module.funcsec)?;
    validator.validate(&module.tablesec)?;
    validator.validate(&module.memsec)?;
    validator.validate(&module.globalsec)?;
    validator.validate(&module.exportsec)?;
    if let Some(startsec) = &module.startsec {
        validator.validate(startsec)?;
    }
    validator.validate(&module.elemsec)?;
    validator.validate(&module.codesec)?;
    validator.validate(&module.datasec)?;

    if let Some(count) = module.datacountsec
        && (count as usize) != module.datasec.len()
    {
        return Err(Error::DataCountMismatch {
            expected: count as usize,
            actual: module.datasec.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::Module;
    use crate::core_compat::alloc::Global;

    use super::Error;

    fn validate(text: &str) -> Result<(), super::Error> {
        let module = Module::parse(text, Global).expect("text parses");
        module.validate()
    }

    #[test]
    fn well_typed_function_validates() {
        validate(
            r#"(module
                 (func (export "add") (param i32 i32) (result i32)
                   local.get 0
                   local.get 1
                   i32.add))"#,
        )
        .expect("well-typed module should validate");
    }

    #[test]
    fn result_type_mismatch_is_rejected() {
        // Declares a result of i32 but leaves an i64 on the stack.
        let result = validate(r#"(module (func (result i32) i64.const 0))"#);
        assert!(result.is_err());
    }

    #[test]
    fn operand_stack_underflow_is_rejected() {
        // i32.add with only one operand on the stack.
        let result = validate(r#"(module (func (result i32) i32.const 1 i32.add))"#);
        assert!(result.is_err());
    }

    #[test]
    fn global_set_on_immutable_global_is_rejected() {
        let result = validate(
            r#"(module
                 (global $g i32 (i32.const 0))
                 (func
                   i32.const 1
                   global.set $g))"#,
        );
        assert!(matches!(
            result,
            Err(Error::ImmutableGlobalAssignment { .. })
        ));
    }

    #[test]
    fn global_set_on_mutable_global_validates() {
        validate(
            r#"(module
                 (global $g (mut i32) (i32.const 0))
                 (func
                   i32.const 1
                   global.set $g))"#,
        )
        .expect("mutable global assignment should validate");
    }

    #[test]
    fn duplicate_export_names_are_rejected() {
        let result = validate(
            r#"(module
                 (func (export "f"))
                 (func (export "f")))"#,
        );
        assert!(matches!(result, Err(Error::DuplicateExportName { .. })));
    }

    #[test]
    fn branch_out_of_range_is_rejected() {
        // br 1 with only the implicit function-level label (0) in scope.
        let result = validate(r#"(module (func br 1))"#);
        assert!(result.is_err());
    }

    #[test]
    fn block_result_mismatch_is_rejected() {
        let result = validate(
            r#"(module
                 (func
                   (block (result i32)
                     i64.const 0)
                   drop))"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn second_memory_is_rejected() {
        let result = validate(r#"(module (memory 1) (memory 1))"#);
        assert!(matches!(result, Err(Error::TooManyMemories { count: 2 })));
    }

    #[test]
    fn second_table_is_rejected() {
        let result = validate(r#"(module (table 1 funcref) (table 1 funcref))"#);
        assert!(matches!(result, Err(Error::TooManyTables { count: 2 })));
    }

    #[test]
    fn memory_instruction_without_memory_is_rejected() {
        let result = validate(r#"(module (func (result i32) i32.const 0 i32.load))"#);
        assert!(matches!(result, Err(Error::InvalidMemoryIndex)));
    }

    #[test]
    fn over_aligned_memory_access_is_rejected() {
        // i32.load's natural alignment is 4 bytes; align=8 exceeds it.
        let result = validate(
            r#"(module (memory 1) (func (result i32) i32.const 0 i32.load align=8))"#,
        );
        assert!(matches!(
            result,
            Err(Error::MisalignedMemoryAccess {
                align: 3,
                natural_align: 4
            })
        ));
    }

    #[test]
    fn naturally_aligned_memory_access_validates() {
        validate(r#"(module (memory 1) (func (result i32) i32.const 0 i32.load align=4))"#)
            .expect("natural alignment should validate");
    }

    #[test]
    fn call_indirect_requires_a_table() {
        let result = validate(
            r#"(module
                 (type $t (func (param i32) (result i32)))
                 (func (param i32) (result i32)
                   local.get 0
                   i32.const 0
                   call_indirect (type $t)))"#,
        );
        assert!(result.is_err());
    }
}
