use super::{emit, emit_c, load_instr, store_instr, Codegen, Storage};
use crate::ir::{Instr, LocalRef, Op, ValType};
use crate::runtime::{self, MALLOC, READ_FLOAT, READ_INT, WRITE_FLOAT, WRITE_INT, WRITE_S};
use crate::{codegen_error, CodegenError, ErrorKind};
use hygge_core::{BinOp, Expr, MatchCase, Type, TypedExpr, UnOp};

impl<'a> Codegen<'a> {
    /// The recursive lowering. Every arm leaves exactly the Wasm image of
    /// the node's value on the stack: one `i32`/`f32`, or nothing for unit.
    pub(crate) fn lower(
        &mut self,
        node: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        match &node.kind {
            Expr::UnitVal => {}
            Expr::IntVal(value) => emit(code, Op::I32Const(*value)),
            Expr::BoolVal(value) => emit(code, Op::I32Const(if *value { 1 } else { 0 })),
            Expr::FloatVal(value) => emit(code, Op::F32Const(*value)),
            Expr::StringVal(value) => self.lower_string_literal(value, code)?,
            Expr::Var(name) => self.lower_var(name, &node.env, &node.ty, code)?,
            Expr::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, code)?,
            Expr::Unary { op, expr } => {
                self.lower(expr, code)?;
                match op {
                    UnOp::Not => emit(code, Op::I32Eqz),
                    UnOp::Sqrt => emit(code, Op::F32Sqrt),
                }
            }
            Expr::ScAnd { lhs, rhs } => {
                self.lower(lhs, code)?;
                let mut rhs_code = Vec::new();
                self.lower(rhs, &mut rhs_code)?;
                emit_c(
                    code,
                    Op::If {
                        results: vec![ValType::I32],
                        then_body: rhs_code,
                        else_body: vec![Instr::new(Op::I32Const(0))],
                    },
                    "short-circuit and",
                );
            }
            Expr::ScOr { lhs, rhs } => {
                self.lower(lhs, code)?;
                let mut rhs_code = Vec::new();
                self.lower(rhs, &mut rhs_code)?;
                emit_c(
                    code,
                    Op::If {
                        results: vec![ValType::I32],
                        then_body: vec![Instr::new(Op::I32Const(1))],
                        else_body: rhs_code,
                    },
                    "short-circuit or",
                );
            }
            Expr::Cond {
                cond,
                then_branch,
                else_branch,
            } => {
                self.lower(cond, code)?;
                let results = self.results_of(&node.env, &node.ty);
                let mut then_code = Vec::new();
                self.lower(then_branch, &mut then_code)?;
                let mut else_code = Vec::new();
                self.lower(else_branch, &mut else_code)?;
                emit(
                    code,
                    Op::If {
                        results,
                        then_body: then_code,
                        else_body: else_code,
                    },
                );
            }
            Expr::Seq(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.lower(item, code)?;
                    let intermediate = i + 1 < items.len();
                    if intermediate && self.val_type(&item.env, &item.ty).is_some() {
                        emit_c(code, Op::Drop, "unused sequence value");
                    }
                }
            }
            Expr::Ascription(inner) => self.lower(inner, code)?,
            Expr::Assertion(cond) => {
                self.lower(cond, code)?;
                let failure = self.check_failure_block("assertion failed");
                emit(
                    code,
                    Op::If {
                        results: vec![],
                        then_body: vec![],
                        else_body: failure,
                    },
                );
            }
            Expr::Print(arg) | Expr::PrintLn(arg) => self.lower_print(arg, code)?,
            Expr::ReadInt => {
                runtime::declare_read_int(&mut self.module)?;
                emit(code, Op::Call(READ_INT.to_string()));
            }
            Expr::ReadFloat => {
                runtime::declare_read_float(&mut self.module)?;
                emit(code, Op::Call(READ_FLOAT.to_string()));
            }
            Expr::Let {
                name,
                mutable,
                init,
                scope,
            } => self.lower_let(name, *mutable, init, scope, code)?,
            Expr::LetRec { name, init, scope } => self.lower_let_rec(name, init, scope, code)?,
            Expr::TypeAlias { name, def, scope } => {
                let previous = self.aliases.insert(name.clone(), def.clone());
                let result = self.lower(scope, code);
                match previous {
                    Some(def) => {
                        self.aliases.insert(name.clone(), def);
                    }
                    None => {
                        self.aliases.remove(name);
                    }
                }
                result?;
            }
            Expr::Lambda { params, body } => self.lower_lambda_value(node, params, body, code)?,
            Expr::Application { callee, args } => self.lower_application(callee, args, code)?,
            Expr::StructCons(fields) => self.lower_struct_cons(fields, code)?,
            Expr::FieldSelect { target, field } => {
                self.lower(target, code)?;
                let (offset, field_ty) = self.field_offset(&target.env, &target.ty, field)?;
                match self.val_type(&node.env, &field_ty) {
                    None => emit_c(code, Op::Drop, format!("unit field {field}")),
                    Some(vt) => {
                        emit(code, Op::I32Const(offset as i32));
                        emit(code, Op::I32Add);
                        emit_c(code, load_instr(vt, 0), format!("select .{field}"));
                    }
                }
            }
            Expr::ArrayCons { length, init } => self.lower_array_cons(length, init, code)?,
            Expr::ArrayLength(target) => {
                self.lower(target, code)?;
                emit_c(code, Op::I32Load { offset: 4 }, "array length");
            }
            Expr::ArrayElem { target, index } => {
                self.lower(target, code)?;
                let arr = self.new_local("arr", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&arr)));
                self.lower(index, code)?;
                let idx = self.new_local("idx", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&idx)));
                self.emit_bounds_check(code, &arr, &idx);
                if let Some(vt) = self.val_type(&node.env, &node.ty) {
                    self.emit_elem_address(code, &arr, &idx);
                    emit(code, load_instr(vt, 0));
                }
            }
            Expr::ArraySlice { target, start, end } => {
                self.lower_array_slice(target, start, end, code)?
            }
            Expr::UnionCons { label, expr } => self.lower_union_cons(label, expr, code)?,
            Expr::Match { scrutinee, cases } => self.lower_match(node, scrutinee, cases, code)?,
            Expr::Assign { target, expr } => self.lower_assign(target, expr, code)?,
            Expr::OpAssign { op, target, expr } => {
                self.lower_op_assign(*op, target, expr, code)?
            }
            Expr::While { cond, body } => self.lower_while(cond, body, code)?,
            Expr::DoWhile { body, cond } => {
                self.lower(body, code)?;
                if self.val_type(&body.env, &body.ty).is_some() {
                    emit_c(code, Op::Drop, "unused loop value");
                }
                self.lower_while(cond, body, code)?;
            }
            Expr::For {
                init,
                cond,
                update,
                body,
            } => {
                self.lower(init, code)?;
                if self.val_type(&init.env, &init.ty).is_some() {
                    emit_c(code, Op::Drop, "unused loop init value");
                }
                let exit = self.fresh("exit");
                let begin = self.fresh("loop");
                let mut loop_body = Vec::new();
                self.lower(cond, &mut loop_body)?;
                emit(&mut loop_body, Op::I32Eqz);
                emit_c(&mut loop_body, Op::BrIf(exit.clone()), "loop exit");
                self.lower(body, &mut loop_body)?;
                if self.val_type(&body.env, &body.ty).is_some() {
                    emit(&mut loop_body, Op::Drop);
                }
                self.lower(update, &mut loop_body)?;
                if self.val_type(&update.env, &update.ty).is_some() {
                    emit(&mut loop_body, Op::Drop);
                }
                emit(&mut loop_body, Op::Br(begin.clone()));
                emit(
                    code,
                    Op::Block {
                        label: exit,
                        results: vec![],
                        body: vec![Instr::new(Op::Loop {
                            label: begin,
                            results: vec![],
                            body: loop_body,
                        })],
                    },
                );
            }
            Expr::PreIncr(target) => self.lower_incr_decr(target, false, true, code)?,
            Expr::PostIncr(target) => self.lower_incr_decr(target, false, false, code)?,
            Expr::PreDecr(target) => self.lower_incr_decr(target, true, true, code)?,
            Expr::PostDecr(target) => self.lower_incr_decr(target, true, false, code)?,
            Expr::Pointer(_) => {
                return Err(codegen_error(
                    ErrorKind::InvalidAst,
                    format!("pointer expression at {}:{}", node.pos.line, node.pos.col),
                ))
            }
        }
        Ok(())
    }

    fn lower_string_literal(
        &mut self,
        value: &str,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let bytes = value.as_bytes();
        let header = self.alloc.allocate(8)?;
        let payload = if bytes.is_empty() {
            self.alloc.high_water_mark()
        } else {
            self.alloc.allocate(bytes.len() as u32)?
        };
        let mut header_bytes = Vec::with_capacity(8);
        header_bytes.extend_from_slice(&payload.to_le_bytes());
        header_bytes.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.module.add_data(header, header_bytes);
        if !bytes.is_empty() {
            self.module.add_data(payload, bytes.to_vec());
        }
        emit_c(
            code,
            Op::I32Const(header as i32),
            format!("string literal ({} bytes)", bytes.len()),
        );
        Ok(())
    }

    fn lower_binary(
        &mut self,
        op: BinOp,
        lhs: &TypedExpr,
        rhs: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let float = matches!(self.resolve(&lhs.env, &lhs.ty), Type::Float);
        match op {
            BinOp::Min | BinOp::Max if !float => {
                let a = self.new_local("a", ValType::I32);
                let b = self.new_local("b", ValType::I32);
                self.lower(lhs, code)?;
                emit(code, Op::LocalSet(LocalRef::name(&a)));
                self.lower(rhs, code)?;
                emit(code, Op::LocalSet(LocalRef::name(&b)));
                emit(code, Op::LocalGet(LocalRef::name(&a)));
                emit(code, Op::LocalGet(LocalRef::name(&b)));
                emit(code, Op::LocalGet(LocalRef::name(&a)));
                emit(code, Op::LocalGet(LocalRef::name(&b)));
                emit(
                    code,
                    if op == BinOp::Min {
                        Op::I32LtS
                    } else {
                        Op::I32GtS
                    },
                );
                emit_c(code, Op::Select, if op == BinOp::Min { "min" } else { "max" });
            }
            _ => {
                self.lower(lhs, code)?;
                self.lower(rhs, code)?;
                self.emit_arith_or_compare(op, float, code)?;
            }
        }
        Ok(())
    }

    /// Emits the operator for two operands already on the stack. Integer
    /// division and remainder get an inline zero-divisor check first.
    pub(super) fn emit_arith_or_compare(
        &mut self,
        op: BinOp,
        float: bool,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        if !float && matches!(op, BinOp::Div | BinOp::Rem) {
            let divisor = self.new_local("divisor", ValType::I32);
            emit(code, Op::LocalTee(LocalRef::name(&divisor)));
            emit(code, Op::I32Eqz);
            let failure = self.check_failure_block("division by zero");
            emit(
                code,
                Op::If {
                    results: vec![],
                    then_body: failure,
                    else_body: vec![],
                },
            );
            emit(code, Op::LocalGet(LocalRef::name(&divisor)));
            emit(
                code,
                if op == BinOp::Div {
                    Op::I32DivS
                } else {
                    Op::I32RemS
                },
            );
            return Ok(());
        }
        if float && op == BinOp::Rem {
            // a - trunc(a / b) * b
            let b = self.new_local("b", ValType::F32);
            let a = self.new_local("a", ValType::F32);
            emit(code, Op::LocalSet(LocalRef::name(&b)));
            emit(code, Op::LocalSet(LocalRef::name(&a)));
            emit(code, Op::LocalGet(LocalRef::name(&a)));
            emit(code, Op::LocalGet(LocalRef::name(&a)));
            emit(code, Op::LocalGet(LocalRef::name(&b)));
            emit(code, Op::F32Div);
            emit(code, Op::F32Trunc);
            emit(code, Op::LocalGet(LocalRef::name(&b)));
            emit(code, Op::F32Mul);
            emit_c(code, Op::F32Sub, "float remainder");
            return Ok(());
        }
        let instr = match (op, float) {
            (BinOp::Add, false) => Op::I32Add,
            (BinOp::Add, true) => Op::F32Add,
            (BinOp::Sub, false) => Op::I32Sub,
            (BinOp::Sub, true) => Op::F32Sub,
            (BinOp::Mul, false) => Op::I32Mul,
            (BinOp::Mul, true) => Op::F32Mul,
            (BinOp::Div, true) => Op::F32Div,
            (BinOp::Min, true) => Op::F32Min,
            (BinOp::Max, true) => Op::F32Max,
            (BinOp::And, _) => Op::I32And,
            (BinOp::Or, _) => Op::I32Or,
            (BinOp::Xor, _) => Op::I32Xor,
            (BinOp::Eq, false) => Op::I32Eq,
            (BinOp::Eq, true) => Op::F32Eq,
            (BinOp::Less, false) => Op::I32LtS,
            (BinOp::Less, true) => Op::F32Lt,
            (BinOp::LessEq, false) => Op::I32LeS,
            (BinOp::LessEq, true) => Op::F32Le,
            (BinOp::Greater, false) => Op::I32GtS,
            (BinOp::Greater, true) => Op::F32Gt,
            (BinOp::GreaterEq, false) => Op::I32GeS,
            (BinOp::GreaterEq, true) => Op::F32Ge,
            (other, _) => {
                return Err(codegen_error(
                    ErrorKind::InvalidAst,
                    format!("operator {other:?} has no lowering here"),
                ))
            }
        };
        emit(code, instr);
        Ok(())
    }

    fn lower_print(&mut self, arg: &TypedExpr, code: &mut Vec<Instr>) -> Result<(), CodegenError> {
        match self.resolve(&arg.env, &arg.ty) {
            Type::Int | Type::Bool => {
                self.lower(arg, code)?;
                runtime::declare_write_int(&mut self.module)?;
                emit(code, Op::Call(WRITE_INT.to_string()));
            }
            Type::Float => {
                self.lower(arg, code)?;
                runtime::declare_write_float(&mut self.module)?;
                emit(code, Op::Call(WRITE_FLOAT.to_string()));
            }
            Type::Str => {
                self.lower(arg, code)?;
                let header = self.new_local("str", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&header)));
                emit(code, Op::LocalGet(LocalRef::name(&header)));
                emit_c(code, Op::I32Load { offset: 0 }, "string bytes");
                emit(code, Op::LocalGet(LocalRef::name(&header)));
                emit_c(code, Op::I32Load { offset: 4 }, "byte length");
                runtime::declare_write_s(&mut self.module)?;
                emit(code, Op::Call(WRITE_S.to_string()));
            }
            other => {
                return Err(codegen_error(
                    ErrorKind::InvalidAst,
                    format!("cannot print a value of type {other:?}"),
                ))
            }
        }
        Ok(())
    }

    fn lower_application(
        &mut self,
        callee: &TypedExpr,
        args: &[TypedExpr],
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        if let Expr::Var(name) = &callee.kind {
            match self.vars.lookup(name).cloned() {
                Some(Storage::TableEntry { label, .. }) => {
                    emit_c(code, Op::I32Const(0), "no captured environment");
                    for arg in args {
                        self.lower(arg, code)?;
                    }
                    emit(code, Op::Call(label));
                    return Ok(());
                }
                Some(Storage::FuncRef { label, cell }) => {
                    emit_c(code, Op::I32Const(cell as i32), "closure cell");
                    emit_c(code, Op::I32Load { offset: 4 }, "environment pointer");
                    for arg in args {
                        self.lower(arg, code)?;
                    }
                    emit(code, Op::Call(label));
                    return Ok(());
                }
                _ => {}
            }
        }

        let Type::Fun {
            args: arg_tys,
            ret,
        } = self.resolve(&callee.env, &callee.ty)
        else {
            return Err(codegen_error(
                ErrorKind::InvalidAst,
                "application of a non-function value",
            ));
        };

        self.lower(callee, code)?;
        let cell = self.new_local("clo", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&cell)));
        emit(code, Op::LocalGet(LocalRef::name(&cell)));
        emit_c(code, Op::I32Load { offset: 4 }, "environment pointer");
        for arg in args {
            self.lower(arg, code)?;
        }
        emit(code, Op::LocalGet(LocalRef::name(&cell)));
        emit_c(code, Op::I32Load { offset: 0 }, "table index");
        let sig = self.closure_func_type(&callee.env, &arg_tys, &ret);
        let type_name = self.module.register_func_type(sig);
        emit(code, Op::CallIndirect(type_name));
        Ok(())
    }

    fn lower_struct_cons(
        &mut self,
        fields: &[(String, TypedExpr)],
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let size = (4 * fields.len().max(1)) as i32;
        self.use_malloc()?;
        emit_c(code, Op::I32Const(size), "struct allocation");
        emit(code, Op::Call(MALLOC.to_string()));
        let base = self.new_local("struct", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&base)));
        for (i, (name, field)) in fields.iter().enumerate() {
            match self.val_type(&field.env, &field.ty) {
                None => self.lower(field, code)?,
                Some(vt) => {
                    emit(code, Op::LocalGet(LocalRef::name(&base)));
                    emit(code, Op::I32Const((4 * i) as i32));
                    emit(code, Op::I32Add);
                    self.lower(field, code)?;
                    emit_c(code, store_instr(vt, 0), format!("field {name}"));
                }
            }
        }
        emit(code, Op::LocalGet(LocalRef::name(&base)));
        Ok(())
    }

    fn lower_array_cons(
        &mut self,
        length: &TypedExpr,
        init: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        self.lower(length, code)?;
        let len = self.new_local("len", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&len)));
        let failure = self.check_failure_block("array length must be at least 1");
        emit(code, Op::LocalGet(LocalRef::name(&len)));
        emit(code, Op::I32Const(1));
        emit(code, Op::I32LtS);
        emit(
            code,
            Op::If {
                results: vec![],
                then_body: failure,
                else_body: vec![],
            },
        );
        self.use_malloc()?;
        emit_c(code, Op::I32Const(8), "array header");
        emit(code, Op::Call(MALLOC.to_string()));
        let header = self.new_local("arr", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&header)));
        emit(code, Op::LocalGet(LocalRef::name(&header)));
        emit(code, Op::LocalGet(LocalRef::name(&len)));
        emit(code, Op::I32Const(4));
        emit(code, Op::I32Mul);
        emit(code, Op::Call(MALLOC.to_string()));
        emit_c(code, Op::I32Store { offset: 0 }, "data pointer");
        emit(code, Op::LocalGet(LocalRef::name(&header)));
        emit(code, Op::LocalGet(LocalRef::name(&len)));
        emit_c(code, Op::I32Store { offset: 4 }, "length");

        match self.val_type(&init.env, &init.ty) {
            None => self.lower(init, code)?,
            Some(vt) => {
                self.lower(init, code)?;
                let value = self.new_local("elem", vt);
                emit(code, Op::LocalSet(LocalRef::name(&value)));
                let idx = self.new_local("idx", ValType::I32);
                emit(code, Op::I32Const(0));
                emit(code, Op::LocalSet(LocalRef::name(&idx)));
                let exit = self.fresh("fill_exit");
                let begin = self.fresh("fill_loop");
                let mut fill = Vec::new();
                emit(&mut fill, Op::LocalGet(LocalRef::name(&idx)));
                emit(&mut fill, Op::LocalGet(LocalRef::name(&len)));
                emit(&mut fill, Op::I32GeS);
                emit(&mut fill, Op::BrIf(exit.clone()));
                self.emit_elem_address(&mut fill, &header, &idx);
                emit(&mut fill, Op::LocalGet(LocalRef::name(&value)));
                emit(&mut fill, store_instr(vt, 0));
                emit(&mut fill, Op::LocalGet(LocalRef::name(&idx)));
                emit(&mut fill, Op::I32Const(1));
                emit(&mut fill, Op::I32Add);
                emit(&mut fill, Op::LocalSet(LocalRef::name(&idx)));
                emit(&mut fill, Op::Br(begin.clone()));
                emit(
                    code,
                    Op::Block {
                        label: exit,
                        results: vec![],
                        body: vec![Instr::commented(
                            Op::Loop {
                                label: begin,
                                results: vec![],
                                body: fill,
                            },
                            "initialise elements",
                        )],
                    },
                );
            }
        }
        emit_c(code, Op::LocalGet(LocalRef::name(&header)), "array value");
        Ok(())
    }

    fn lower_array_slice(
        &mut self,
        target: &TypedExpr,
        start: &TypedExpr,
        end: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        self.lower(target, code)?;
        let arr = self.new_local("arr", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&arr)));
        self.lower(start, code)?;
        let lo = self.new_local("start", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&lo)));
        self.lower(end, code)?;
        let hi = self.new_local("end", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&hi)));

        let below = self.check_failure_block("slice start below zero");
        emit(code, Op::LocalGet(LocalRef::name(&lo)));
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
        let beyond = self.check_failure_block("slice end past array length");
        emit(code, Op::LocalGet(LocalRef::name(&hi)));
        emit(code, Op::LocalGet(LocalRef::name(&arr)));
        emit(code, Op::I32Load { offset: 4 });
        emit(code, Op::I32GtS);
        emit(
            code,
            Op::If {
                results: vec![],
                then_body: beyond,
                else_body: vec![],
            },
        );
        let empty = self.check_failure_block("slice is empty or inverted");
        emit(code, Op::LocalGet(LocalRef::name(&hi)));
        emit(code, Op::LocalGet(LocalRef::name(&lo)));
        emit(code, Op::I32LeS);
        emit(
            code,
            Op::If {
                results: vec![],
                then_body: empty,
                else_body: vec![],
            },
        );

        self.use_malloc()?;
        emit_c(code, Op::I32Const(8), "slice header");
        emit(code, Op::Call(MALLOC.to_string()));
        let header = self.new_local("slice", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&header)));
        emit(code, Op::LocalGet(LocalRef::name(&header)));
        emit(code, Op::LocalGet(LocalRef::name(&arr)));
        emit(code, Op::I32Load { offset: 0 });
        emit(code, Op::LocalGet(LocalRef::name(&lo)));
        emit(code, Op::I32Const(4));
        emit(code, Op::I32Mul);
        emit(code, Op::I32Add);
        emit_c(code, Op::I32Store { offset: 0 }, "shared data pointer");
        emit(code, Op::LocalGet(LocalRef::name(&header)));
        emit(code, Op::LocalGet(LocalRef::name(&hi)));
        emit(code, Op::LocalGet(LocalRef::name(&lo)));
        emit(code, Op::I32Sub);
        emit_c(code, Op::I32Store { offset: 4 }, "slice length");
        emit(code, Op::LocalGet(LocalRef::name(&header)));
        Ok(())
    }

    fn lower_union_cons(
        &mut self,
        label: &str,
        payload: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let tag = self.tag_id(label);
        self.use_malloc()?;
        emit_c(code, Op::I32Const(8), format!("union value '{label}'"));
        emit(code, Op::Call(MALLOC.to_string()));
        let cell = self.new_local("union", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&cell)));
        emit(code, Op::LocalGet(LocalRef::name(&cell)));
        emit(code, Op::I32Const(tag));
        emit_c(code, Op::I32Store { offset: 0 }, format!("tag '{label}' = {tag}"));
        match self.val_type(&payload.env, &payload.ty) {
            None => self.lower(payload, code)?,
            Some(vt) => {
                emit(code, Op::LocalGet(LocalRef::name(&cell)));
                self.lower(payload, code)?;
                emit_c(code, store_instr(vt, 4), "payload");
            }
        }
        emit(code, Op::LocalGet(LocalRef::name(&cell)));
        Ok(())
    }

    fn lower_match(
        &mut self,
        node: &TypedExpr,
        scrutinee: &TypedExpr,
        cases: &[MatchCase],
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        self.lower(scrutinee, code)?;
        let scrut = self.new_local("scrut", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&scrut)));
        let results = self.results_of(&node.env, &node.ty);
        let chain = self.lower_match_arms(scrutinee, cases, 0, &scrut, &results)?;
        code.extend(chain);
        Ok(())
    }

    fn lower_match_arms(
        &mut self,
        scrutinee: &TypedExpr,
        cases: &[MatchCase],
        index: usize,
        scrut: &str,
        results: &[ValType],
    ) -> Result<Vec<Instr>, CodegenError> {
        let mut buf = Vec::new();
        if index == cases.len() {
            self.emit_check_failure(&mut buf, "unmatched union value");
            return Ok(buf);
        }
        let case = &cases[index];
        let tag = self.tag_id(&case.label);
        emit_c(
            &mut buf,
            Op::LocalGet(LocalRef::name(scrut)),
            format!("match arm '{}'", case.label),
        );
        emit(&mut buf, Op::I32Load { offset: 0 });
        emit(&mut buf, Op::I32Const(tag));
        emit(&mut buf, Op::I32Eq);

        let payload_ty = self.union_payload_type(scrutinee, &case.label)?;
        let mut arm = Vec::new();
        match self.val_type(&scrutinee.env, &payload_ty) {
            Some(vt) => {
                self.new_local(&case.var, vt);
                let slot = self.last_local_index();
                emit(&mut arm, Op::LocalGet(LocalRef::name(scrut)));
                emit_c(&mut arm, load_instr(vt, 4), "payload");
                emit(&mut arm, Op::LocalSet(LocalRef::Index(slot)));
                self.vars.bind(&case.var, Storage::Offset(slot));
            }
            None => self.vars.bind(&case.var, Storage::Id(0)),
        }
        let lowered = self.lower(&case.body, &mut arm);
        self.vars.unbind(&case.var);
        lowered?;

        let else_body = self.lower_match_arms(scrutinee, cases, index + 1, scrut, results)?;
        emit(
            &mut buf,
            Op::If {
                results: results.to_vec(),
                then_body: arm,
                else_body,
            },
        );
        Ok(buf)
    }

    fn union_payload_type(
        &self,
        scrutinee: &TypedExpr,
        label: &str,
    ) -> Result<Type, CodegenError> {
        match self.resolve(&scrutinee.env, &scrutinee.ty) {
            Type::Union(cases) => cases
                .iter()
                .find(|(case_label, _)| case_label == label)
                .map(|(_, ty)| ty.clone())
                .ok_or_else(|| {
                    codegen_error(
                        ErrorKind::InvalidAst,
                        format!("union label '{label}' missing from scrutinee type"),
                    )
                }),
            other => Err(codegen_error(
                ErrorKind::InvalidAst,
                format!("match on non-union type {other:?}"),
            )),
        }
    }

    fn lower_assign(
        &mut self,
        target: &TypedExpr,
        value: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        match &target.kind {
            Expr::Var(name) => {
                self.lower(value, code)?;
                self.store_var_leaving_value(name, &target.env, &target.ty, code)
            }
            Expr::FieldSelect {
                target: object,
                field,
            } => {
                self.lower(object, code)?;
                let obj = self.new_local("obj", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&obj)));
                let (offset, field_ty) = self.field_offset(&object.env, &object.ty, field)?;
                match self.val_type(&target.env, &field_ty) {
                    None => self.lower(value, code)?,
                    Some(vt) => {
                        self.lower(value, code)?;
                        let val = self.new_local("val", vt);
                        emit(code, Op::LocalSet(LocalRef::name(&val)));
                        emit(code, Op::LocalGet(LocalRef::name(&obj)));
                        emit(code, Op::I32Const(offset as i32));
                        emit(code, Op::I32Add);
                        emit(code, Op::LocalGet(LocalRef::name(&val)));
                        emit_c(code, store_instr(vt, 0), format!("store .{field}"));
                        emit(code, Op::LocalGet(LocalRef::name(&val)));
                    }
                }
                Ok(())
            }
            Expr::ArrayElem {
                target: array,
                index,
            } => {
                self.lower(array, code)?;
                let arr = self.new_local("arr", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&arr)));
                self.lower(index, code)?;
                let idx = self.new_local("idx", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&idx)));
                self.emit_bounds_check(code, &arr, &idx);
                match self.val_type(&target.env, &target.ty) {
                    None => self.lower(value, code)?,
                    Some(vt) => {
                        self.lower(value, code)?;
                        let val = self.new_local("val", vt);
                        emit(code, Op::LocalSet(LocalRef::name(&val)));
                        self.emit_elem_address(code, &arr, &idx);
                        emit(code, Op::LocalGet(LocalRef::name(&val)));
                        emit(code, store_instr(vt, 0));
                        emit(code, Op::LocalGet(LocalRef::name(&val)));
                    }
                }
                Ok(())
            }
            _ => Err(codegen_error(
                ErrorKind::InvalidAst,
                "assignment target must be a variable, field or array element",
            )),
        }
    }

    fn lower_op_assign(
        &mut self,
        op: BinOp,
        target: &TypedExpr,
        value: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let float = matches!(self.resolve(&target.env, &target.ty), Type::Float);
        match &target.kind {
            Expr::Var(name) => {
                self.lower_var(name, &target.env, &target.ty, code)?;
                self.lower(value, code)?;
                self.emit_arith_or_compare(op, float, code)?;
                self.store_var_leaving_value(name, &target.env, &target.ty, code)
            }
            Expr::FieldSelect {
                target: object,
                field,
            } => {
                self.lower(object, code)?;
                let obj = self.new_local("obj", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&obj)));
                let (offset, field_ty) = self.field_offset(&object.env, &object.ty, field)?;
                let Some(vt) = self.val_type(&target.env, &field_ty) else {
                    return Err(codegen_error(
                        ErrorKind::InvalidAst,
                        "compound assignment to a unit field",
                    ));
                };
                emit(code, Op::LocalGet(LocalRef::name(&obj)));
                emit(code, Op::I32Const(offset as i32));
                emit(code, Op::I32Add);
                emit(code, load_instr(vt, 0));
                self.lower(value, code)?;
                self.emit_arith_or_compare(op, float, code)?;
                let val = self.new_local("val", vt);
                emit(code, Op::LocalSet(LocalRef::name(&val)));
                emit(code, Op::LocalGet(LocalRef::name(&obj)));
                emit(code, Op::I32Const(offset as i32));
                emit(code, Op::I32Add);
                emit(code, Op::LocalGet(LocalRef::name(&val)));
                emit_c(code, store_instr(vt, 0), format!("update .{field}"));
                emit(code, Op::LocalGet(LocalRef::name(&val)));
                Ok(())
            }
            Expr::ArrayElem {
                target: array,
                index,
            } => {
                self.lower(array, code)?;
                let arr = self.new_local("arr", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&arr)));
                self.lower(index, code)?;
                let idx = self.new_local("idx", ValType::I32);
                emit(code, Op::LocalSet(LocalRef::name(&idx)));
                self.emit_bounds_check(code, &arr, &idx);
                let Some(vt) = self.val_type(&target.env, &target.ty) else {
                    return Err(codegen_error(
                        ErrorKind::InvalidAst,
                        "compound assignment to a unit element",
                    ));
                };
                let addr = self.new_local("addr", ValType::I32);
                self.emit_elem_address(code, &arr, &idx);
                emit(code, Op::LocalSet(LocalRef::name(&addr)));
                emit(code, Op::LocalGet(LocalRef::name(&addr)));
                emit(code, load_instr(vt, 0));
                self.lower(value, code)?;
                self.emit_arith_or_compare(op, float, code)?;
                let val = self.new_local("val", vt);
                emit(code, Op::LocalSet(LocalRef::name(&val)));
                emit(code, Op::LocalGet(LocalRef::name(&addr)));
                emit(code, Op::LocalGet(LocalRef::name(&val)));
                emit(code, store_instr(vt, 0));
                emit(code, Op::LocalGet(LocalRef::name(&val)));
                Ok(())
            }
            _ => Err(codegen_error(
                ErrorKind::InvalidAst,
                "compound assignment target must be a variable, field or array element",
            )),
        }
    }

    fn lower_while(
        &mut self,
        cond: &TypedExpr,
        body: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let exit = self.fresh("exit");
        let begin = self.fresh("loop");
        let mut loop_body = Vec::new();
        self.lower(cond, &mut loop_body)?;
        emit(&mut loop_body, Op::I32Eqz);
        emit_c(&mut loop_body, Op::BrIf(exit.clone()), "loop exit");
        self.lower(body, &mut loop_body)?;
        if self.val_type(&body.env, &body.ty).is_some() {
            emit(&mut loop_body, Op::Drop);
        }
        emit(&mut loop_body, Op::Br(begin.clone()));
        emit(
            code,
            Op::Block {
                label: exit,
                results: vec![],
                body: vec![Instr::new(Op::Loop {
                    label: begin,
                    results: vec![],
                    body: loop_body,
                })],
            },
        );
        Ok(())
    }

    fn lower_incr_decr(
        &mut self,
        target: &TypedExpr,
        decrement: bool,
        prefix: bool,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let Expr::Var(name) = &target.kind else {
            return Err(codegen_error(
                ErrorKind::InvalidAst,
                "increment/decrement target must be a variable",
            ));
        };
        let float = matches!(self.resolve(&target.env, &target.ty), Type::Float);
        let one = if float {
            Op::F32Const(1.0)
        } else {
            Op::I32Const(1)
        };
        let step = match (decrement, float) {
            (false, false) => Op::I32Add,
            (false, true) => Op::F32Add,
            (true, false) => Op::I32Sub,
            (true, true) => Op::F32Sub,
        };
        if prefix {
            self.lower_var(name, &target.env, &target.ty, code)?;
            emit(code, one);
            emit(code, step);
            self.store_var_leaving_value(name, &target.env, &target.ty, code)
        } else {
            // old value stays as the result, then the update runs
            self.lower_var(name, &target.env, &target.ty, code)?;
            self.lower_var(name, &target.env, &target.ty, code)?;
            emit(code, one);
            emit(code, step);
            self.store_var_discarding(name, &target.env, &target.ty, code)
        }
    }
}
