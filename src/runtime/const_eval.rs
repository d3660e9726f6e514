// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Evaluation of the constant-expression subset used by global initializers
//! and active element/data segment offsets: `i32.const`, `i64.const`,
//! `f32.const`, `f64.const`, and `global.get` of an imported immutable
//! global. This mirrors the whitelist the validator enforces in
//! `validate::expr`; nothing else can appear here in a module that passed
//! validation.

use crate::Allocator;
use crate::bytecode::Reader;
use crate::types::{Expression, Opcode};

use super::{ModuleInstance, Store, Value};

pub(crate) fn eval_const<A: Allocator + Clone>(
    store: &Store<A>,
    module_instance: &ModuleInstance<A>,
    expr: &Expression<A>,
) -> Value {
    let mut reader = Reader::new(expr);
    let value = match reader.read_opcode() {
        Opcode::I32Const => Value::I32(reader.read_i32() as u32),
        Opcode::I64Const => Value::I64(reader.read_i64() as u64),
        Opcode::F32Const => Value::F32(reader.read_f32()),
        Opcode::F64Const => Value::F64(reader.read_f64()),
        Opcode::GlobalGet => {
            let idx = reader.read_u32() as usize;
            let addr = module_instance.global_addr(idx);
            store.global(addr).lock().expect("global lock poisoned").get()
        }
        other => unreachable!("validator restricts constant expressions to a fixed opcode set, got {other:?}"),
    };
    debug_assert_eq!(reader.read_opcode(), Opcode::End);
    value
}
