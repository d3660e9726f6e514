// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The embedder surface: a registry mapping `(module, field)` names to
//! host-provided or previously-instantiated externs, and the instantiation
//! routine that resolves a module's imports against it, allocates its
//! store entities, applies its element/data segments, and runs its start
//! function, per §4.6.

use core::fmt;
use std::collections::HashMap;
use std::string::String;
use std::sync::Arc;

use crate::Allocator;
use crate::Module;
use crate::core_compat::vec::Vec;
use crate::types::{
    DataMode, ElementInit, ElementMode, ExportDescriptor, FuncIdx, FunctionType, GlobalType, ImportDescriptor, Limits, TableType,
};

use super::const_eval::eval_const;
use super::interpreter;
use super::{
    FuncAddr, FunctionInstance, GlobalAddr, GlobalInstance, HostFunctionInstance, MemAddr, MemoryInstance, ModuleInstance,
    Store, TableAddr, TableInstance, Trap, Value, WasmFunction, function_types_equal,
};

/// A tagged reference to a store entity of any kind, per the glossary's
/// "Extern val" entry.
#[derive(Clone, Copy, Debug)]
pub enum ExternVal {
    Func(FuncAddr),
    Table(TableAddr),
    Memory(MemAddr),
    Global(GlobalAddr),
}

/// A host-provided callable, together with the signature an importing
/// module's type-use is checked against at link time.
pub struct HostFunction<A: Allocator> {
    ty: FunctionType<A>,
    callback: std::boxed::Box<dyn Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync>,
}

impl<A: Allocator> HostFunction<A> {
    /// Wraps `callback` as a host function of the given type. The callback
    /// receives its arguments positionally and returns either the single
    /// result value its type declares (or `None` for a void signature) or a
    /// trap signal, per §4.6 and §6 "Host interface".
    pub fn new(ty: FunctionType<A>, callback: impl Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync + 'static) -> Self {
        Self {
            ty,
            callback: std::boxed::Box::new(callback),
        }
    }
}

/// A registry of `(module_name, export_name) -> ExternVal` used to resolve
/// a module's imports at instantiation time, per §6 "Host interface".
pub struct Linker<A: Allocator> {
    alloc: A,
    externs: HashMap<(String, String), ExternVal>,
}

impl<A: Allocator + Clone> Linker<A> {
    /// Creates an empty linker using `alloc` for any store entities it
    /// allocates on the embedder's behalf (currently, host functions).
    pub fn new(alloc: A) -> Self {
        Self {
            alloc,
            externs: HashMap::new(),
        }
    }

    /// Registers a host function under `(module, name)`, allocating it into
    /// `store` and returning its address.
    pub fn define_func(&mut self, store: &mut Store<A>, module: &str, name: &str, host: HostFunction<A>) -> FuncAddr {
        let addr = store.allocate_function(FunctionInstance::Host(HostFunctionInstance::new(host.ty, host.callback)));
        self.externs.insert((String::from(module), String::from(name)), ExternVal::Func(addr));
        addr
    }

    /// Registers an arbitrary extern (typically a table, memory, or global
    /// already resident in the store from another instance) under
    /// `(module, name)`.
    pub fn define(&mut self, module: &str, name: &str, value: ExternVal) {
        self.externs.insert((String::from(module), String::from(name)), value);
    }

    fn resolve(&self, module: &str, name: &str) -> Option<ExternVal> {
        self.externs.get(&(String::from(module), String::from(name))).copied()
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.alloc
    }
}

/// A mismatch between an import's declared type and the provided extern
/// val, or an element/data segment that ran out of bounds against the
/// table/memory it targets, per §7 "LinkError".
#[derive(Clone)]
pub enum LinkError {
    /// No extern was registered under the import's `(module, name)` pair.
    MissingImport { module: String, name: String },
    /// A registered extern existed but was the wrong entity kind, or its
    /// type didn't match (structurally, for functions; by limit/mutability
    /// subtyping, for tables/memories/globals) the import's declaration.
    IncompatibleImportType { module: String, name: String },
    /// An active element segment's offset plus length exceeded the target
    /// table's current size.
    ElementSegmentOutOfBounds { segment: usize },
    /// An active data segment's offset plus length exceeded the target
    /// memory's current size.
    DataSegmentOutOfBounds { segment: usize },
}

impl fmt::Debug for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::MissingImport { module, name } => write!(f, "missing import \"{module}\".\"{name}\""),
            LinkError::IncompatibleImportType { module, name } => {
                write!(f, "incompatible import type for \"{module}\".\"{name}\"")
            }
            LinkError::ElementSegmentOutOfBounds { segment } => {
                write!(f, "element segment {segment} out of bounds of its target table")
            }
            LinkError::DataSegmentOutOfBounds { segment } => {
                write!(f, "data segment {segment} out of bounds of its target memory")
            }
        }
    }
}

// Standard WebAssembly limit-matching: the imported entity's actual limits
// must be at least as permissive as the importing module declared, i.e. its
// minimum is no smaller and its maximum (if the import requires one) is no
// larger.
fn limits_compatible(actual: Limits, expected: Limits) -> bool {
    if actual.min < expected.min {
        return false;
    }
    match (actual.max, expected.max) {
        (_, None) => true,
        (Some(actual_max), Some(expected_max)) => actual_max <= expected_max,
        (None, Some(_)) => false,
    }
}

fn table_type_compatible(actual: TableType, expected: TableType) -> bool {
    actual.reftype == expected.reftype && limits_compatible(actual.limits, expected.limits)
}

/// A module instantiated against a [`Store`]: its resolved index spaces
/// (owned by the shared [`ModuleInstance`]) and its export table.
pub struct Instance<A: Allocator> {
    module_instance: Arc<ModuleInstance<A>>,
    exports: HashMap<String, ExternVal>,
}

impl<A: Allocator + Clone> Instance<A> {
    /// Looks up an export by name.
    pub fn get_export(&self, name: &str) -> Option<ExternVal> {
        self.exports.get(name).copied()
    }

    /// Instantiates `module` against `store`, resolving its imports through
    /// `linker`, applying its element and data segments, and invoking its
    /// start function (if any), per §4.6 and §6 "Module instantiation entry
    /// point".
    ///
    /// On success, returns the new instance together with the trap (if any)
    /// the start function raised. Per DESIGN NOTES' resolution of the
    /// "start-function trap" open question, the store is *not* rolled back
    /// on such a trap: every write completed before the trapping instruction
    /// persists.
    pub fn instantiate(module: Arc<Module<A>>, store: &mut Store<A>, linker: &Linker<A>) -> Result<(Self, Option<Trap>), LinkError> {
        let alloc = linker.allocator().clone();

        let mut funcaddrs: Vec<FuncAddr, A> = Vec::new_in(alloc.clone());
        let mut tableaddrs: Vec<TableAddr, A> = Vec::new_in(alloc.clone());
        let mut memaddrs: Vec<MemAddr, A> = Vec::new_in(alloc.clone());
        let mut globaladdrs: Vec<GlobalAddr, A> = Vec::new_in(alloc.clone());

        for import in module.importsec.iter() {
            let module_name: &str = &import.module;
            let field_name: &str = &import.field;
            let resolved = linker.resolve(module_name, field_name).ok_or_else(|| LinkError::MissingImport {
                module: String::from(module_name),
                name: String::from(field_name),
            })?;
            let incompatible = || LinkError::IncompatibleImportType {
                module: String::from(module_name),
                name: String::from(field_name),
            };
            match (import.descriptor, resolved) {
                (ImportDescriptor::Function(typeidx), ExternVal::Func(addr)) => {
                    let expected = &module.typesec[*typeidx as usize];
                    if !function_types_equal(expected, store.function(addr).signature()) {
                        return Err(incompatible());
                    }
                    funcaddrs.push(addr);
                }
                (ImportDescriptor::Table(expected), ExternVal::Table(addr)) => {
                    let actual = store.table(addr).lock().expect("table lock poisoned").ty();
                    if !table_type_compatible(actual, expected) {
                        return Err(incompatible());
                    }
                    tableaddrs.push(addr);
                }
                (ImportDescriptor::Memory(expected), ExternVal::Memory(addr)) => {
                    let guard = store.memory(addr).lock();
                    let actual = Limits {
                        min: guard.size_pages(),
                        max: store.memory(addr).max_pages(),
                    };
                    drop(guard);
                    let expected_limits = Limits {
                        min: expected.min,
                        max: expected.max,
                    };
                    if !limits_compatible(actual, expected_limits) {
                        return Err(incompatible());
                    }
                    memaddrs.push(addr);
                }
                (ImportDescriptor::Global(expected), ExternVal::Global(addr)) => {
                    let actual: GlobalType = store.global(addr).lock().expect("global lock poisoned").ty();
                    if actual.value != expected.value || actual.mutability != expected.mutability {
                        return Err(incompatible());
                    }
                    globaladdrs.push(addr);
                }
                _ => return Err(incompatible()),
            }
        }

        let func_base = store.function_count();
        for i in 0..module.local_function_count() {
            funcaddrs.push(FuncAddr(func_base + i));
        }
        let table_base = store.table_count();
        for i in 0..module.local_table_count() {
            tableaddrs.push(TableAddr(table_base + i));
        }
        let mem_base = store.memory_count();
        for i in 0..module.local_memory_count() {
            memaddrs.push(MemAddr(mem_base + i));
        }
        let global_base = store.global_count();
        for i in 0..module.local_global_count() {
            globaladdrs.push(GlobalAddr(global_base + i));
        }

        let module_instance = Arc::new(ModuleInstance::new(module.clone(), funcaddrs, tableaddrs, memaddrs, globaladdrs));

        for funcidx in 0..module.local_function_count() {
            let addr = store.allocate_function(FunctionInstance::Wasm(WasmFunction::new(module_instance.clone(), funcidx)));
            debug_assert_eq!(addr, FuncAddr(func_base + funcidx));
        }
        for ty in module.tablesec.iter().copied() {
            let addr = store.allocate_table(TableInstance::new(ty, alloc.clone()));
            debug_assert!(addr.0 >= table_base);
        }
        for ty in module.memsec.iter().copied() {
            let addr = store.allocate_memory(MemoryInstance::new(ty, alloc.clone()));
            debug_assert!(addr.0 >= mem_base);
        }
        // Global initializers may only reference earlier (necessarily
        // imported, per the validator's constant-expression whitelist)
        // globals, so evaluating them in declaration order against the
        // module instance built above is safe even though this module's own
        // globals aren't allocated yet.
        for global in module.globalsec.iter() {
            let value = eval_const(store, &module_instance, &global.init);
            let addr = store.allocate_global(GlobalInstance::new(global.ty, value));
            debug_assert!(addr.0 >= global_base);
        }

        for (idx, segment) in module.elemsec.iter().enumerate() {
            let ElementMode::Active(active) = &segment.mode else {
                continue;
            };
            let table_addr = module_instance.table_addr(*active.table as usize);
            let offset = eval_const(store, &module_instance, &active.offset).as_i32();
            let values: std::vec::Vec<Value> = match &segment.init {
                ElementInit::FunctionIndices(indices) => indices
                    .iter()
                    .map(|i| Value::FuncRef(Some(module_instance.func_addr(**i as usize))))
                    .collect(),
                ElementInit::Expressions(exprs) => exprs.iter().map(|e| eval_const(store, &module_instance, e)).collect(),
            };
            let mut table = store.table(table_addr).lock().expect("table lock poisoned");
            offset
                .checked_add(values.len() as u32)
                .filter(|&e| e <= table.size())
                .ok_or(LinkError::ElementSegmentOutOfBounds { segment: idx })?;
            for (i, value) in values.into_iter().enumerate() {
                table.set(offset + i as u32, value).map_err(|_| LinkError::ElementSegmentOutOfBounds { segment: idx })?;
            }
        }

        for (idx, segment) in module.datasec.iter().enumerate() {
            let DataMode::Active(active) = &segment.mode else {
                continue;
            };
            let mem_addr = module_instance.mem_addr(*active.memory as usize);
            let offset = eval_const(store, &module_instance, &active.offset).as_i32();
            store
                .memory(mem_addr)
                .lock()
                .write_bytes(offset as u64, &segment.init)
                .map_err(|_| LinkError::DataSegmentOutOfBounds { segment: idx })?;
        }

        let mut exports = HashMap::new();
        for export in module.exportsec.iter() {
            let value = match export.descriptor {
                ExportDescriptor::Function(idx) => ExternVal::Func(module_instance.func_addr(*idx as usize)),
                ExportDescriptor::Table(idx) => ExternVal::Table(module_instance.table_addr(*idx as usize)),
                ExportDescriptor::Memory(idx) => ExternVal::Memory(module_instance.mem_addr(*idx as usize)),
                ExportDescriptor::Global(idx) => ExternVal::Global(module_instance.global_addr(*idx as usize)),
            };
            let field_name: &str = &export.field;
            exports.insert(String::from(field_name), value);
        }

        let trap = if let Some(start) = &module.startsec {
            let funcidx: FuncIdx = **start;
            let addr = module_instance.func_addr(*funcidx as usize);
            interpreter::call(store, addr, &[]).err()
        } else {
            None
        };

        Ok((Self { module_instance, exports }, trap))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::core_compat::alloc::Global;
    use crate::storage::Buffer;
    use crate::{Module, decode};

    use super::*;

    fn load(bytes: std::vec::Vec<u8>) -> Module<Global> {
        let module = Module::decode(Buffer::new(bytes.as_slice()), &mut decode::NoCustomSectionVisitor {}, Global).expect("decode");
        module.validate().expect("validate");
        module
    }

    fn instantiate(bytes: std::vec::Vec<u8>) -> (Store<Global>, Instance<Global>) {
        let module = Arc::new(load(bytes));
        let mut store = Store::new(Global);
        let linker = Linker::new(Global);
        let (instance, trap) = Instance::instantiate(module, &mut store, &linker).expect("instantiate");
        assert!(trap.is_none());
        (store, instance)
    }

    // (module
    //   (global $g (mut i32) (i32.const 0))
    //   (func (export "run")
    //     (local $i i32)
    //     (block
    //       (loop
    //         local.get 0
    //         i32.const 10
    //         i32.ge_s
    //         br_if 1
    //         global.get 0
    //         i32.const 1
    //         i32.add
    //         global.set 0
    //         local.get 0
    //         i32.const 1
    //         i32.add
    //         local.set 0
    //         br 0)))
    //   (func (export "get_g") (result i32) global.get 0))
    #[test]
    fn global_mutated_by_loop_reaches_ten() {
        let bytes: std::vec::Vec<u8> = vec![
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x08, 0x02, 0x60, 0x00, 0x00, 0x60, 0x00, 0x01, 0x7f, // type section
            0x03, 0x03, 0x02, 0x00, 0x01, // function section
            0x06, 0x06, 0x01, 0x7f, 0x01, 0x41, 0x00, 0x0b, // global section
            0x07, 0x10, 0x02, 0x03, b'r', b'u', b'n', 0x00, 0x00, 0x06, b'g', b'e', b't', b'_', b'g', 0x00, 0x01, // export section
            0x0a, 0x28, 0x02, // code section
            0x21, 0x01, 0x01, 0x7f, // run: locals
            0x02, 0x40, 0x03, 0x40, 0x20, 0x00, 0x41, 0x0a, 0x4e, 0x0d, 0x01, 0x23, 0x00, 0x41, 0x01, 0x6a, 0x24, 0x00, 0x20, 0x00, 0x41, 0x01, 0x6a, 0x21,
            0x00, 0x0c, 0x00, 0x0b, 0x0b, 0x0b, // run: expr
            0x04, 0x00, 0x23, 0x00, 0x0b, // get_g: locals + expr
        ];
        let (store, instance) = instantiate(bytes);
        let ExternVal::Func(run) = instance.get_export("run").expect("run exported") else {
            panic!("expected function export");
        };
        let ExternVal::Func(get_g) = instance.get_export("get_g").expect("get_g exported") else {
            panic!("expected function export");
        };
        interpreter::call(&store, run, &[]).expect("run succeeds");
        assert_eq!(interpreter::call(&store, get_g, &[]).unwrap(), Some(Value::I32(10)));
    }

    // (module
    //   (memory 1)
    //   (data (i32.const 0) "hello")
    //   (func (export "load8") (result i32) i32.const 0 i32.load8_u)
    //   (func (export "load32") (result i32) i32.const 0 i32.load))
    #[test]
    fn data_segment_initializes_memory() {
        let bytes: std::vec::Vec<u8> = vec![
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f, // type section: () -> i32
            0x03, 0x03, 0x02, 0x00, 0x00, // function section
            0x05, 0x03, 0x01, 0x00, 0x01, // memory section: 1 memory, min 1
            0x07, 0x13, 0x02, 0x05, b'l', b'o', b'a', b'd', b'8', 0x00, 0x00, 0x06, b'l', b'o', b'a', b'd', b'3', b'2', 0x00, 0x01, // exports
            0x0a, 0x10, 0x02, // code section
            0x06, 0x00, 0x41, 0x00, 0x2d, 0x00, 0x00, 0x0b, // load8: i32.const 0; i32.load8_u align=0 offset=0
            0x07, 0x00, 0x41, 0x00, 0x28, 0x02, 0x00, 0x0b, // load32: i32.const 0; i32.load align=2 offset=0
            0x0b, 0x06, 0x01, 0x00, 0x41, 0x00, 0x0b, 0x05, b'h', b'e', b'l', b'l', b'o', // data section: active, mem 0, offset 0, "hello"
        ];
        let (store, instance) = instantiate(bytes);
        let ExternVal::Func(load8) = instance.get_export("load8").expect("export exists") else {
            panic!("expected function export");
        };
        let ExternVal::Func(load32) = instance.get_export("load32").expect("export exists") else {
            panic!("expected function export");
        };
        assert_eq!(interpreter::call(&store, load8, &[]).unwrap(), Some(Value::I32(0x68)));
        assert_eq!(interpreter::call(&store, load32, &[]).unwrap(), Some(Value::I32(0x6c6c_6568)));
    }

    // (module
    //   (type $ii (func (param i32) (result i32)))
    //   (type $ll (func (param i64) (result i32)))
    //   (table 2 funcref)
    //   (elem (i32.const 0) $identity)
    //   (func $identity (export "identity") (param i32) (result i32) local.get 0)
    //   (func (export "call_it") (param i32 i32) (result i32)
    //     local.get 0
    //     local.get 1
    //     call_indirect (type $ii)))
    #[test]
    fn call_indirect_traps_on_oob_and_type_mismatch() {
        let bytes: std::vec::Vec<u8> = vec![
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x0c, 0x02, 0x60, 0x01, 0x7f, 0x01, 0x7f, 0x60, 0x01, 0x7e, 0x01, 0x7f, // types: (i32)->i32, (i64)->i32
            0x03, 0x03, 0x02, 0x00, 0x00, // functions: both type 0
            0x04, 0x04, 0x01, 0x70, 0x00, 0x02, // table section: funcref, min 2
            0x07, 0x15, 0x02, 0x08, b'i', b'd', b'e', b'n', b't', b'i', b't', b'y', 0x00, 0x00, 0x07, b'c', b'a', b'l', b'l', b'_', b'i', b't', 0x00, 0x01, // exports
            0x09, 0x07, 0x01, 0x00, 0x41, 0x00, 0x0b, 0x01, 0x00, // elem section: active table 0, offset 0, [func 0]
            0x0a, 0x10, 0x02, // code section
            0x04, 0x00, 0x20, 0x00, 0x0b, // identity: local.get 0
            0x09, 0x00, 0x20, 0x00, 0x20, 0x01, 0x11, 0x00, 0x00, 0x0b, // call_it: local.get 0; local.get 1; call_indirect (type 0) (table 0)
        ];
        let (store, instance) = instantiate(bytes);
        let ExternVal::Func(call_it) = instance.get_export("call_it").expect("export exists") else {
            panic!("expected function export");
        };
        assert_eq!(interpreter::call(&store, call_it, &[Value::I32(42), Value::I32(0)]).unwrap(), Some(Value::I32(42)));
        assert_eq!(
            interpreter::call(&store, call_it, &[Value::I32(42), Value::I32(1)]),
            Err(Trap::TableOutOfBounds)
        );
    }
}
