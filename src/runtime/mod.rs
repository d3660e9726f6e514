// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The runtime tier: store, linear memory, instruction interpretation, and
//! the embedder surface.
//!
//! Everything here requires `feature = "std"`: the store shares mutable
//! content (tables, globals, memory) across invocations via `std::sync`
//! primitives, which a `no_std` core has no business depending on. Decoders,
//! the AST, and the validator stay allocator-generic and `no_std`.

mod const_eval;
mod flatten;
mod interpreter;
mod linker;
mod memory;
mod numeric;

pub use linker::{HostFunction, Instance, LinkError, Linker};
pub use memory::MemoryInstance;

use core::fmt;
use std::sync::{Arc, Mutex};

use crate::core_compat::vec::Vec;
use crate::types::{FunctionType, GlobalType, Local, RefType, TableType, ValType};
use crate::{Allocator, Module};

use flatten::FlatCode;

/// A runtime value of one of the types this interpreter supports.
///
/// Integers carry their bit pattern; signedness is an instruction-level
/// interpretation, per §3 "Value". Reference values are opaque: a `FuncRef`
/// is a store address, an `ExternRef` is a host-assigned id the interpreter
/// never inspects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I32(u32),
    I64(u64),
    F32(f32),
    F64(f64),
    FuncRef(Option<FuncAddr>),
    ExternRef(Option<u32>),
}

impl Value {
    /// The value type this value inhabits.
    pub fn value_type(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::FuncRef(_) => ValType::FuncRef,
            Value::ExternRef(_) => ValType::ExternRef,
        }
    }

    pub(crate) fn default_for_reftype(rt: RefType) -> Self {
        match rt {
            RefType::Func => Value::FuncRef(None),
            RefType::Extern => Value::ExternRef(None),
        }
    }

    pub(crate) fn as_i32(self) -> u32 {
        match self {
            Value::I32(v) => v,
            _ => unreachable!("validator guarantees operand types"),
        }
    }

    pub(crate) fn as_i64(self) -> u64 {
        match self {
            Value::I64(v) => v,
            _ => unreachable!("validator guarantees operand types"),
        }
    }

    pub(crate) fn as_f32(self) -> f32 {
        match self {
            Value::F32(v) => v,
            _ => unreachable!("validator guarantees operand types"),
        }
    }

    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Value::F64(v) => v,
            _ => unreachable!("validator guarantees operand types"),
        }
    }
}

impl From<Local> for Value {
    fn from(local: Local) -> Self {
        match local {
            Local::I32(v) => Value::I32(v as u32),
            Local::I64(v) => Value::I64(v as u64),
            Local::F32(v) => Value::F32(v),
            Local::F64(v) => Value::F64(v),
            Local::FuncRef(v) => Value::FuncRef(if v == u32::MAX { None } else { Some(FuncAddr(v as usize)) }),
            Local::ExternRef(v) => Value::ExternRef(if v == u32::MAX { None } else { Some(v) }),
        }
    }
}

// Dense, zero-based, never-reused addresses into a Store's instance vectors.
macro_rules! addr_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq)]
        pub struct $name(pub(crate) usize);
    };
}
addr_newtype!(
    /// The address of a function instance within a [`Store`].
    FuncAddr
);
addr_newtype!(
    /// The address of a table instance within a [`Store`].
    TableAddr
);
addr_newtype!(
    /// The address of a memory instance within a [`Store`].
    MemAddr
);
addr_newtype!(
    /// The address of a global instance within a [`Store`].
    GlobalAddr
);

/// A runtime failure that aborts the current invocation without corrupting
/// the store, per the glossary's "Trap" entry.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Trap {
    /// `unreachable` was executed.
    Unreachable,
    /// `i32.div_s`/`i32.div_u`/`i64.div_s`/`i64.div_u` by zero.
    IntegerDivideByZero,
    /// `INT_MIN / -1` in a signed division or remainder.
    IntegerOverflow,
    /// A trapping float-to-int conversion saw NaN, infinity, or an
    /// out-of-range value.
    InvalidConversionToInteger,
    /// A memory access fell outside the memory's current size.
    MemoryOutOfBounds,
    /// A table access fell outside the table's current size.
    TableOutOfBounds,
    /// `call_indirect` read an unfilled table slot.
    UninitializedElement,
    /// `call_indirect`'s declared type didn't structurally match the callee.
    IndirectCallTypeMismatch,
    /// The interpreter's operand/label/frame stack exceeded its bound.
    StackExhausted,
    /// A host function signaled failure.
    HostFunction,
}

impl fmt::Debug for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::Unreachable => write!(f, "unreachable instruction executed"),
            Trap::IntegerDivideByZero => write!(f, "integer divide by zero"),
            Trap::IntegerOverflow => write!(f, "integer overflow"),
            Trap::InvalidConversionToInteger => write!(f, "invalid conversion to integer"),
            Trap::MemoryOutOfBounds => write!(f, "out of bounds memory access"),
            Trap::TableOutOfBounds => write!(f, "out of bounds table access"),
            Trap::UninitializedElement => write!(f, "uninitialized element"),
            Trap::IndirectCallTypeMismatch => write!(f, "indirect call type mismatch"),
            Trap::StackExhausted => write!(f, "call stack exhausted"),
            Trap::HostFunction => write!(f, "host function trapped"),
        }
    }
}

/// A module's index spaces resolved to store addresses, shared by every
/// [`WasmFunction`] it defines.
pub(crate) struct ModuleInstance<A: Allocator> {
    module: Arc<Module<A>>,
    funcaddrs: Vec<FuncAddr, A>,
    tableaddrs: Vec<TableAddr, A>,
    memaddrs: Vec<MemAddr, A>,
    globaladdrs: Vec<GlobalAddr, A>,
}

impl<A: Allocator> ModuleInstance<A> {
    pub(crate) fn new(
        module: Arc<Module<A>>,
        funcaddrs: Vec<FuncAddr, A>,
        tableaddrs: Vec<TableAddr, A>,
        memaddrs: Vec<MemAddr, A>,
        globaladdrs: Vec<GlobalAddr, A>,
    ) -> Self {
        Self {
            module,
            funcaddrs,
            tableaddrs,
            memaddrs,
            globaladdrs,
        }
    }

    pub(crate) fn module(&self) -> &Module<A> {
        &self.module
    }

    pub(crate) fn func_addr(&self, idx: usize) -> FuncAddr {
        self.funcaddrs[idx]
    }

    pub(crate) fn table_addr(&self, idx: usize) -> TableAddr {
        self.tableaddrs[idx]
    }

    pub(crate) fn mem_addr(&self, idx: usize) -> MemAddr {
        self.memaddrs[idx]
    }

    pub(crate) fn global_addr(&self, idx: usize) -> GlobalAddr {
        self.globaladdrs[idx]
    }
}

/// A callable in the store: either module-defined code or a host callback.
pub(crate) enum FunctionInstance<A: Allocator> {
    Wasm(WasmFunction<A>),
    Host(HostFunctionInstance<A>),
}

impl<A: Allocator> FunctionInstance<A> {
    pub(crate) fn signature(&self) -> &FunctionType<A> {
        match self {
            FunctionInstance::Wasm(f) => f.signature(),
            FunctionInstance::Host(f) => &f.ty,
        }
    }
}

/// A module-defined function: its owning module instance (for resolving the
/// indices its body references), the type/locals/code it was declared with
/// (read straight from the module's AST), and a lazily-computed flattened
/// form of its code cached for repeat invocations.
pub(crate) struct WasmFunction<A: Allocator> {
    module: Arc<ModuleInstance<A>>,
    funcidx: usize,
    flattened: Mutex<Option<Arc<FlatCode<A>>>>,
}

impl<A: Allocator + Clone> WasmFunction<A> {
    pub(crate) fn new(module: Arc<ModuleInstance<A>>, funcidx: usize) -> Self {
        Self {
            module,
            funcidx,
            flattened: Mutex::new(None),
        }
    }

    pub(crate) fn module_instance(&self) -> &Arc<ModuleInstance<A>> {
        &self.module
    }

    pub(crate) fn signature(&self) -> &FunctionType<A> {
        let typeidx = self.module.module().funcsec[self.funcidx];
        &self.module.module().typesec[*typeidx as usize]
    }

    pub(crate) fn locals(&self) -> &crate::types::Locals<A> {
        &self.module.module().codesec[self.funcidx].locals
    }

    pub(crate) fn code(&self) -> &crate::types::Expression<A> {
        &self.module.module().codesec[self.funcidx].code
    }

    // Returns this function's flattened instruction stream, computing and
    // caching it on first call.
    pub(crate) fn flattened(&self) -> Arc<FlatCode<A>> {
        let mut cached = self.flattened.lock().expect("flatten cache lock poisoned");
        if let Some(flat) = cached.as_ref() {
            return flat.clone();
        }
        let alloc = self.module.module().typesec.allocator().clone();
        let flat = Arc::new(flatten::flatten(self.module.module(), self.code(), alloc));
        *cached = Some(flat.clone());
        flat
    }
}

/// A host-provided callable, registered through [`Linker`].
pub(crate) struct HostFunctionInstance<A: Allocator> {
    ty: FunctionType<A>,
    callback: std::boxed::Box<dyn Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync>,
}

impl<A: Allocator> HostFunctionInstance<A> {
    pub(crate) fn new(
        ty: FunctionType<A>,
        callback: std::boxed::Box<dyn Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync>,
    ) -> Self {
        Self { ty, callback }
    }

    pub(crate) fn call(&self, args: &[Value]) -> Result<Option<Value>, Trap> {
        (self.callback)(args)
    }
}

/// Sparse mapping from table position to an optional reference value,
/// bounded by its declared [`TableType`].
pub(crate) struct TableInstance<A: Allocator> {
    ty: TableType,
    elements: Vec<Value, A>,
}

impl<A: Allocator> TableInstance<A> {
    pub(crate) fn new(ty: TableType, alloc: A) -> Self {
        let default = Value::default_for_reftype(ty.reftype);
        let mut elements = Vec::new_in(alloc);
        elements.resize(ty.min_elements() as usize, default);
        Self { ty, elements }
    }

    pub(crate) fn ty(&self) -> TableType {
        self.ty
    }

    pub(crate) fn size(&self) -> u32 {
        self.elements.len() as u32
    }

    pub(crate) fn get(&self, idx: u32) -> Result<Value, Trap> {
        self.elements.get(idx as usize).copied().ok_or(Trap::TableOutOfBounds)
    }

    pub(crate) fn set(&mut self, idx: u32, value: Value) -> Result<(), Trap> {
        let slot = self.elements.get_mut(idx as usize).ok_or(Trap::TableOutOfBounds)?;
        *slot = value;
        Ok(())
    }

}

/// `(ValueType, mutability, current Value)`, per §3 "GlobalInstance".
pub(crate) struct GlobalInstance {
    ty: GlobalType,
    value: Value,
}

impl GlobalInstance {
    pub(crate) fn new(ty: GlobalType, value: Value) -> Self {
        Self { ty, value }
    }

    pub(crate) fn ty(&self) -> GlobalType {
        self.ty
    }

    pub(crate) fn get(&self) -> Value {
        self.value
    }

    pub(crate) fn set(&mut self, value: Value) {
        self.value = value;
    }
}

// `FunctionType` has no `PartialEq` (its fields are allocator-generic
// `Vec`s, and deriving would require `A: PartialEq`), so `call_indirect`'s
// structural type check and import type-checking share this instead.
pub(crate) fn function_types_equal<A: Allocator>(a: &FunctionType<A>, b: &FunctionType<A>) -> bool {
    a.parameters.len() == b.parameters.len()
        && a.parameters.iter().zip(b.parameters.iter()).all(|(x, y)| x == y)
        && a.results.len() == b.results.len()
        && a.results.iter().zip(b.results.iter()).all(|(x, y)| x == y)
}

/// The process-wide pool of runtime instances manipulated by executing
/// modules. Allocation requires exclusive access (`&mut self`, used only
/// during instantiation); invocation only ever needs shared access, with
/// mutable content protected per-entity so independent invocations can
/// proceed concurrently against a `Store` shared behind an `Arc`.
pub struct Store<A: Allocator> {
    functions: Vec<FunctionInstance<A>, A>,
    tables: Vec<Mutex<TableInstance<A>>, A>,
    memories: Vec<MemoryInstance<A>, A>,
    globals: Vec<Mutex<GlobalInstance>, A>,
}

impl<A: Allocator + Clone> Store<A> {
    /// Creates an empty store using the given allocator for its instance
    /// vectors.
    pub fn new(alloc: A) -> Self {
        Self {
            functions: Vec::new_in(alloc.clone()),
            tables: Vec::new_in(alloc.clone()),
            memories: Vec::new_in(alloc.clone()),
            globals: Vec::new_in(alloc),
        }
    }
}

impl<A: Allocator> Store<A> {
    pub(crate) fn allocate_function(&mut self, instance: FunctionInstance<A>) -> FuncAddr {
        self.functions.push(instance);
        FuncAddr(self.functions.len() - 1)
    }

    pub(crate) fn allocate_table(&mut self, instance: TableInstance<A>) -> TableAddr {
        self.tables.push(Mutex::new(instance));
        TableAddr(self.tables.len() - 1)
    }

    pub(crate) fn allocate_memory(&mut self, instance: MemoryInstance<A>) -> MemAddr {
        self.memories.push(instance);
        MemAddr(self.memories.len() - 1)
    }

    pub(crate) fn allocate_global(&mut self, instance: GlobalInstance) -> GlobalAddr {
        self.globals.push(Mutex::new(instance));
        GlobalAddr(self.globals.len() - 1)
    }

    pub(crate) fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub(crate) fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub(crate) fn memory_count(&self) -> usize {
        self.memories.len()
    }

    pub(crate) fn global_count(&self) -> usize {
        self.globals.len()
    }

    pub(crate) fn function(&self, addr: FuncAddr) -> &FunctionInstance<A> {
        &self.functions[addr.0]
    }

    pub(crate) fn table(&self, addr: TableAddr) -> &Mutex<TableInstance<A>> {
        &self.tables[addr.0]
    }

    pub(crate) fn memory(&self, addr: MemAddr) -> &MemoryInstance<A> {
        &self.memories[addr.0]
    }

    pub(crate) fn global(&self, addr: GlobalAddr) -> &Mutex<GlobalInstance> {
        &self.globals[addr.0]
    }
}
