use super::{emit, emit_c, load_instr, store_instr, Codegen, Storage};
use crate::ir::{Instr, LocalRef, Op, ValType};
use crate::runtime::{EXIT_CODE_GLOBAL, RUNTIME_FAILURE};
use crate::{codegen_error, CodegenError, ErrorKind};
use hygge_core::{Type, TypeEnv};

impl<'a> Codegen<'a> {
    /// Failure idiom shared by assertions, bounds checks, zero divisors and
    /// unmatched scrutinees: record the sentinel in the exported global,
    /// then leave the current function. `_start` returns the sentinel
    /// itself; other functions return a zero of their result type.
    pub(super) fn emit_check_failure(&mut self, code: &mut Vec<Instr>, why: &str) {
        emit(code, Op::I32Const(RUNTIME_FAILURE));
        emit_c(code, Op::GlobalSet(EXIT_CODE_GLOBAL.to_string()), why);
        if self.in_start() {
            emit(code, Op::I32Const(RUNTIME_FAILURE));
        } else {
            match self.frame.results.first() {
                None => {}
                Some(ValType::I32) => emit(code, Op::I32Const(0)),
                Some(ValType::F32) => emit(code, Op::F32Const(0.0)),
            }
        }
        emit(code, Op::Return);
    }

    pub(super) fn check_failure_block(&mut self, why: &str) -> Vec<Instr> {
        let mut buf = Vec::new();
        self.emit_check_failure(&mut buf, why);
        buf
    }

    /// Variable read, dispatching on the storage kind of the binding.
    pub(super) fn lower_var(
        &mut self,
        name: &str,
        env: &TypeEnv,
        ty: &Type,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let Some(storage) = self.vars.lookup(name).cloned() else {
            return Err(codegen_error(
                ErrorKind::UnresolvedIdentifier,
                format!("variable '{name}' has no storage"),
            ));
        };
        let Some(vt) = self.val_type(env, ty) else {
            // unit-typed reads produce no value
            return Ok(());
        };
        match storage {
            Storage::Label(label) => {
                if self.is_local(&label) {
                    emit(code, Op::LocalGet(LocalRef::name(&label)));
                } else if self.module.has_global(&label) {
                    emit(code, Op::GlobalGet(label));
                } else {
                    return Err(codegen_error(
                        ErrorKind::StorageKindMismatch,
                        format!("label '{label}' for '{name}' is neither local nor global"),
                    ));
                }
            }
            Storage::Offset(index) => emit(code, Op::LocalGet(LocalRef::Index(index))),
            Storage::Memory(addr) => {
                emit_c(code, Op::I32Const(addr as i32), format!("static {name}"));
                emit(code, load_instr(vt, 0));
            }
            Storage::Id(value) => emit(code, Op::I32Const(value)),
            Storage::TableEntry { label, index } => {
                let cell = self.ensure_func_cell(&label, index)?;
                emit_c(
                    code,
                    Op::I32Const(cell as i32),
                    format!("closure cell of {label}"),
                );
            }
            Storage::FuncRef { cell, .. } => {
                emit_c(code, Op::I32Const(cell as i32), "closure cell");
            }
            Storage::Boxed(ptr) => {
                emit_c(code, Op::LocalGet(LocalRef::name(&ptr)), format!("boxed {name}"));
                emit(code, load_instr(vt, 0));
            }
        }
        Ok(())
    }

    /// Stores the value on top of the stack into a variable and leaves the
    /// stored value behind as the expression result.
    pub(super) fn store_var_leaving_value(
        &mut self,
        name: &str,
        env: &TypeEnv,
        ty: &Type,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let Some(vt) = self.val_type(env, ty) else {
            return Ok(());
        };
        let Some(storage) = self.vars.lookup(name).cloned() else {
            return Err(codegen_error(
                ErrorKind::UnresolvedIdentifier,
                format!("variable '{name}' has no storage"),
            ));
        };
        match storage {
            Storage::Label(label) => {
                if self.is_local(&label) {
                    emit(code, Op::LocalTee(LocalRef::name(&label)));
                } else if self.module.has_global(&label) {
                    emit(code, Op::GlobalSet(label.clone()));
                    emit(code, Op::GlobalGet(label));
                } else {
                    return Err(codegen_error(
                        ErrorKind::StorageKindMismatch,
                        format!("label '{label}' for '{name}' is neither local nor global"),
                    ));
                }
            }
            Storage::Offset(index) => emit(code, Op::LocalTee(LocalRef::Index(index))),
            Storage::Memory(addr) => {
                let tmp = self.new_local("tmp", vt);
                emit(code, Op::LocalSet(LocalRef::name(&tmp)));
                emit(code, Op::I32Const(addr as i32));
                emit(code, Op::LocalGet(LocalRef::name(&tmp)));
                emit(code, store_instr(vt, 0));
                emit(code, Op::LocalGet(LocalRef::name(&tmp)));
            }
            Storage::Boxed(ptr) => {
                let tmp = self.new_local("tmp", vt);
                emit(code, Op::LocalSet(LocalRef::name(&tmp)));
                emit(code, Op::LocalGet(LocalRef::name(&ptr)));
                emit(code, Op::LocalGet(LocalRef::name(&tmp)));
                emit_c(code, store_instr(vt, 0), format!("store boxed {name}"));
                emit(code, Op::LocalGet(LocalRef::name(&tmp)));
            }
            other => {
                return Err(codegen_error(
                    ErrorKind::StorageKindMismatch,
                    format!("'{name}' ({other:?}) is not assignable"),
                ))
            }
        }
        Ok(())
    }

    /// As above, but the stored value is consumed.
    pub(super) fn store_var_discarding(
        &mut self,
        name: &str,
        env: &TypeEnv,
        ty: &Type,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let Some(vt) = self.val_type(env, ty) else {
            return Ok(());
        };
        let Some(storage) = self.vars.lookup(name).cloned() else {
            return Err(codegen_error(
                ErrorKind::UnresolvedIdentifier,
                format!("variable '{name}' has no storage"),
            ));
        };
        match storage {
            Storage::Label(label) => {
                if self.is_local(&label) {
                    emit(code, Op::LocalSet(LocalRef::name(&label)));
                } else if self.module.has_global(&label) {
                    emit(code, Op::GlobalSet(label));
                } else {
                    return Err(codegen_error(
                        ErrorKind::StorageKindMismatch,
                        format!("label '{label}' for '{name}' is neither local nor global"),
                    ));
                }
            }
            Storage::Offset(index) => emit(code, Op::LocalSet(LocalRef::Index(index))),
            Storage::Memory(addr) => {
                let tmp = self.new_local("tmp", vt);
                emit(code, Op::LocalSet(LocalRef::name(&tmp)));
                emit(code, Op::I32Const(addr as i32));
                emit(code, Op::LocalGet(LocalRef::name(&tmp)));
                emit(code, store_instr(vt, 0));
            }
            Storage::Boxed(ptr) => {
                let tmp = self.new_local("tmp", vt);
                emit(code, Op::LocalSet(LocalRef::name(&tmp)));
                emit(code, Op::LocalGet(LocalRef::name(&ptr)));
                emit(code, Op::LocalGet(LocalRef::name(&tmp)));
                emit(code, store_instr(vt, 0));
            }
            other => {
                return Err(codegen_error(
                    ErrorKind::StorageKindMismatch,
                    format!("'{name}' ({other:?}) is not assignable"),
                ))
            }
        }
        Ok(())
    }

    /// Byte offset and type of a struct field, from the target's static
    /// type.
    pub(super) fn field_offset(
        &self,
        env: &TypeEnv,
        ty: &Type,
        field: &str,
    ) -> Result<(u32, Type), CodegenError> {
        match self.resolve(env, ty) {
            Type::Struct(fields) => fields
                .iter()
                .position(|(name, _)| name == field)
                .map(|i| ((4 * i) as u32, fields[i].1.clone()))
                .ok_or_else(|| {
                    codegen_error(
                        ErrorKind::InvalidAst,
                        format!("no field '{field}' on the target struct"),
                    )
                }),
            other => Err(codegen_error(
                ErrorKind::InvalidAst,
                format!("field access on non-struct type {other:?}"),
            )),
        }
    }

    /// `0 <= idx < length` or the function leaves with the failure
    /// sentinel. `arr` holds the header address, `idx` the index.
    pub(super) fn emit_bounds_check(&mut self, code: &mut Vec<Instr>, arr: &str, idx: &str) {
        let below = self.check_failure_block("array index below zero");
        emit(code, Op::LocalGet(LocalRef::name(idx)));
        emit(code, Op::I32Const(0));
        emit(code, Op::I32LtS);
        emit(
            code,
            Op::If {
                results: vec![],
                then_body: below,
                else_body: vec![],
            },
        );
        let beyond = self.check_failure_block("array index out of bounds");
        emit(code, Op::LocalGet(LocalRef::name(idx)));
        emit(code, Op::LocalGet(LocalRef::name(arr)));
        emit_c(code, Op::I32Load { offset: 4 }, "array length");
        emit(code, Op::I32GeS);
        emit(
            code,
            Op::If {
                results: vec![],
                then_body: beyond,
                else_body: vec![],
            },
        );
    }

    /// Address of element `idx`: `data_pointer + idx * 4`.
    pub(super) fn emit_elem_address(&mut self, code: &mut Vec<Instr>, arr: &str, idx: &str) {
        emit(code, Op::LocalGet(LocalRef::name(arr)));
        emit_c(code, Op::I32Load { offset: 0 }, "data pointer");
        emit(code, Op::LocalGet(LocalRef::name(idx)));
        emit(code, Op::I32Const(4));
        emit(code, Op::I32Mul);
        emit(code, Op::I32Add);
    }
}
