//! Type-directed lowering from the typed AST to the Wasm IR. One recursive
//! `lower` drives everything; this module holds the compilation context,
//! variable storage, and the closure-conversion machinery.

mod expr;
mod helpers;

use crate::alloc::StaticAllocator;
use crate::analysis::{free_vars, lambda_captures};
use crate::ir::{
    Export, ExportKind, FuncType, Function, Global, Instr, LocalRef, Module, Op, ValType,
};
use crate::runtime::{
    self, EXIT_CODE_GLOBAL, HEAP_BASE_GLOBAL, HEAP_PTR_GLOBAL, MALLOC, START,
};
use crate::{codegen_error, AllocationStrategy, CodegenError, CompileConfig, ErrorKind};
use hygge_core::{Expr, Type, TypeEnv, TypedExpr};
use std::collections::{BTreeSet, HashMap};

/// Where the value of a source-level identifier lives.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Storage {
    /// A named local or global.
    Label(String),
    /// A local addressed by index.
    Offset(u32),
    /// A fixed linear-memory address holding the value.
    Memory(u32),
    /// A module function with a table slot; calls are direct.
    TableEntry { label: String, index: u32 },
    /// A module function whose closure cell sits at a known static address.
    FuncRef { label: String, cell: u32 },
    /// A compile-time constant (union tags, unit bindings).
    Id(i32),
    /// A named local holding a pointer to a one-cell heap record; the
    /// variable's value lives behind the pointer.
    Boxed(String),
}

/// Variable-storage map with shadow stacks per name, so scope exit restores
/// whatever binding was visible before.
#[derive(Default)]
pub(crate) struct VarEnv {
    map: HashMap<String, Vec<Storage>>,
}

impl VarEnv {
    pub(crate) fn bind(&mut self, name: &str, storage: Storage) {
        self.map.entry(name.to_string()).or_default().push(storage);
    }

    pub(crate) fn unbind(&mut self, name: &str) {
        if let Some(stack) = self.map.get_mut(name) {
            stack.pop();
            if stack.is_empty() {
                self.map.remove(name);
            }
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&Storage> {
        self.map.get(name).and_then(|stack| stack.last())
    }
}

struct Frame {
    label: String,
    results: Vec<ValType>,
    params: Vec<(String, ValType)>,
    locals: Vec<(String, ValType)>,
}

struct CapturedVar {
    name: String,
    storage: Storage,
    slot: ValType,
}

pub(crate) struct Codegen<'a> {
    config: &'a CompileConfig,
    module: Module,
    alloc: StaticAllocator,
    vars: VarEnv,
    frame: Frame,
    counter: usize,
    tags: Vec<String>,
    func_cells: HashMap<String, u32>,
    aliases: HashMap<String, Type>,
    malloc_used: bool,
}

/// Lowers a whole program into a fresh module: the top-level expression
/// becomes the body of an exported `_start : () -> i32`.
pub fn codegen(ast: &TypedExpr, config: &CompileConfig) -> Result<Module, CodegenError> {
    let mut cg = Codegen {
        config,
        module: Module::new(config.style),
        alloc: StaticAllocator::new(),
        vars: VarEnv::default(),
        frame: Frame {
            label: START.to_string(),
            results: vec![ValType::I32],
            params: Vec::new(),
            locals: Vec::new(),
        },
        counter: 0,
        tags: Vec::new(),
        func_cells: HashMap::new(),
        aliases: HashMap::new(),
        malloc_used: false,
    };

    let mut body = Vec::new();
    cg.lower(ast, &mut body)?;
    if cg.val_type(&ast.env, &ast.ty).is_some() {
        emit_c(&mut body, Op::Drop, "discard top-level value");
    }
    emit(&mut body, Op::I32Const(0));
    emit_c(&mut body, Op::Return, "exit code: success");

    let frame = std::mem::replace(
        &mut cg.frame,
        Frame {
            label: String::new(),
            results: Vec::new(),
            params: Vec::new(),
            locals: Vec::new(),
        },
    );
    cg.module.add_function(Function {
        label: START.to_string(),
        params: frame.params,
        results: frame.results,
        locals: frame.locals,
        body,
    })?;

    cg.finalize()?;
    Ok(cg.module)
}

impl<'a> Codegen<'a> {
    fn finalize(&mut self) -> Result<(), CodegenError> {
        let mark = self.alloc.high_water_mark();
        if self.malloc_used && self.config.alloc == AllocationStrategy::Internal {
            self.module.add_global(Global {
                label: HEAP_PTR_GLOBAL.to_string(),
                ty: ValType::I32,
                mutable: true,
                init: Instr::new(Op::I32Const(mark as i32)),
            })?;
            runtime::synthesize_malloc(&mut self.module)?;
        }
        self.module.add_global(Global {
            label: EXIT_CODE_GLOBAL.to_string(),
            ty: ValType::I32,
            mutable: true,
            init: Instr::new(Op::I32Const(0)),
        })?;
        self.module.add_global(Global {
            label: HEAP_BASE_GLOBAL.to_string(),
            ty: ValType::I32,
            mutable: false,
            init: Instr::new(Op::I32Const(mark as i32)),
        })?;
        self.module.add_memory(self.alloc.page_count(), None);
        self.module.add_export(Export {
            name: START.to_string(),
            kind: ExportKind::Func,
            target: START.to_string(),
        })?;
        self.module.add_export(Export {
            name: "memory".to_string(),
            kind: ExportKind::Memory,
            target: "mem".to_string(),
        })?;
        self.module.add_export(Export {
            name: "heap_base_ptr".to_string(),
            kind: ExportKind::Global,
            target: HEAP_BASE_GLOBAL.to_string(),
        })?;
        self.module.add_export(Export {
            name: EXIT_CODE_GLOBAL.to_string(),
            kind: ExportKind::Global,
            target: EXIT_CODE_GLOBAL.to_string(),
        })?;
        Ok(())
    }

    fn fresh(&mut self, prefix: &str) -> String {
        let n = self.counter;
        self.counter += 1;
        format!("{prefix}_{n}")
    }

    fn new_local(&mut self, hint: &str, ty: ValType) -> String {
        let name = self.fresh(hint);
        self.frame.locals.push((name.clone(), ty));
        name
    }

    fn in_start(&self) -> bool {
        self.frame.label == START
    }

    fn is_local(&self, name: &str) -> bool {
        self.local_val_type(name).is_some()
    }

    fn local_val_type(&self, name: &str) -> Option<ValType> {
        self.frame
            .params
            .iter()
            .chain(self.frame.locals.iter())
            .find(|(local, _)| local == name)
            .map(|(_, ty)| *ty)
    }

    fn local_type_by_index(&self, index: u32) -> Option<ValType> {
        self.frame
            .params
            .iter()
            .chain(self.frame.locals.iter())
            .nth(index as usize)
            .map(|(_, ty)| *ty)
    }

    /// Index of the most recently added local, counting params first.
    fn last_local_index(&self) -> u32 {
        (self.frame.params.len() + self.frame.locals.len() - 1) as u32
    }

    fn use_malloc(&mut self) -> Result<(), CodegenError> {
        self.malloc_used = true;
        if self.config.alloc == AllocationStrategy::External {
            runtime::declare_malloc(&mut self.module)?;
        }
        Ok(())
    }

    /// Alias-expanded view of a type, consulting both the node environment
    /// and the aliases met while lowering.
    fn resolve(&self, env: &TypeEnv, ty: &Type) -> Type {
        let mut current = env.expand(ty);
        let mut budget = self.aliases.len() + 1;
        while let Type::Var(name) = &current {
            if budget == 0 {
                break;
            }
            budget -= 1;
            match self.aliases.get(name) {
                Some(def) => current = env.expand(def),
                None => break,
            }
        }
        current
    }

    /// Wasm representation of a Hygge type: `f32` for floats, nothing for
    /// unit, `i32` for everything else.
    fn val_type(&self, env: &TypeEnv, ty: &Type) -> Option<ValType> {
        match self.resolve(env, ty) {
            Type::Unit => None,
            Type::Float => Some(ValType::F32),
            _ => Some(ValType::I32),
        }
    }

    fn results_of(&self, env: &TypeEnv, ty: &Type) -> Vec<ValType> {
        self.val_type(env, ty).into_iter().collect()
    }

    /// Signature of an indirect call through a closure cell: a leading
    /// `i32` environment pointer, then the Wasm image of each argument.
    fn closure_func_type(&self, env: &TypeEnv, args: &[Type], ret: &Type) -> FuncType {
        let mut params = vec![ValType::I32];
        params.extend(args.iter().filter_map(|arg| self.val_type(env, arg)));
        FuncType::new(params, self.results_of(env, ret))
    }

    /// Stable integer id for a union label, assigned on first sight.
    fn tag_id(&mut self, label: &str) -> i32 {
        if let Some(idx) = self.tags.iter().position(|tag| tag == label) {
            return idx as i32;
        }
        self.tags.push(label.to_string());
        (self.tags.len() - 1) as i32
    }

    /// Static closure cell for a function used as a value; created once per
    /// function label, with a zero environment pointer.
    fn ensure_func_cell(&mut self, label: &str, index: u32) -> Result<u32, CodegenError> {
        if let Some(cell) = self.func_cells.get(label) {
            return Ok(*cell);
        }
        let cell = self.alloc.allocate(8)?;
        self.module.add_data(cell, cell_bytes(index, 0));
        self.func_cells.insert(label.to_string(), cell);
        Ok(cell)
    }

    /// Free variables that live in the current frame and therefore must be
    /// copied into a closure environment. Globals, statics, functions and
    /// constants stay directly addressable.
    fn captured_locals(&self, fv: &BTreeSet<String>) -> Vec<CapturedVar> {
        let mut out = Vec::new();
        for name in fv {
            let Some(storage) = self.vars.lookup(name) else {
                continue;
            };
            let slot = match storage {
                Storage::Label(label) => match self.local_val_type(label) {
                    Some(ty) => ty,
                    None => continue,
                },
                Storage::Offset(index) => match self.local_type_by_index(*index) {
                    Some(ty) => ty,
                    None => continue,
                },
                Storage::Boxed(_) => ValType::I32,
                _ => continue,
            };
            out.push(CapturedVar {
                name: name.clone(),
                storage: storage.clone(),
                slot,
            });
        }
        out
    }

    /// Lowers a lambda to a new top-level function with the uniform
    /// signature `(cenv, args...)`. Captured variables are read back out of
    /// the environment record in the prologue and rebound as locals.
    fn emit_closure_function(
        &mut self,
        label: &str,
        params: &[(String, Type)],
        body: &TypedExpr,
        captured: &[CapturedVar],
        env: &TypeEnv,
    ) -> Result<(), CodegenError> {
        let results = self.results_of(&body.env, &body.ty);
        let mut wasm_params = vec![("cenv".to_string(), ValType::I32)];
        let mut bindings = Vec::new();
        for (name, ty) in params {
            match self.val_type(env, ty) {
                Some(vt) => {
                    wasm_params.push((name.clone(), vt));
                    bindings.push((name.clone(), Storage::Label(name.clone())));
                }
                None => bindings.push((name.clone(), Storage::Id(0))),
            }
        }

        let saved = std::mem::replace(
            &mut self.frame,
            Frame {
                label: label.to_string(),
                results: results.clone(),
                params: wasm_params,
                locals: Vec::new(),
            },
        );
        for (name, storage) in &bindings {
            self.vars.bind(name, storage.clone());
        }

        let mut buf = Vec::new();
        for (i, cap) in captured.iter().enumerate() {
            let local = self.new_local(&cap.name, cap.slot);
            emit_c(
                &mut buf,
                Op::LocalGet(LocalRef::name("cenv")),
                format!("captured {}", cap.name),
            );
            emit(&mut buf, load_instr(cap.slot, (4 * i) as u32));
            emit(&mut buf, Op::LocalSet(LocalRef::name(&local)));
            let binding = match cap.storage {
                Storage::Boxed(_) => Storage::Boxed(local),
                _ => Storage::Label(local),
            };
            self.vars.bind(&cap.name, binding);
        }

        self.lower(body, &mut buf)?;

        for cap in captured {
            self.vars.unbind(&cap.name);
        }
        for (name, _) in &bindings {
            self.vars.unbind(name);
        }
        let frame = std::mem::replace(&mut self.frame, saved);
        self.module.add_function(Function {
            label: label.to_string(),
            params: frame.params,
            results,
            locals: frame.locals,
            body: buf,
        })
    }

    /// Anonymous lambda in value position: closure-convert and leave the
    /// cell address on the stack.
    fn lower_lambda_value(
        &mut self,
        node: &TypedExpr,
        params: &[(String, Type)],
        body: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let fv = free_vars(node);
        let captured = self.captured_locals(&fv);
        let label = self.fresh("anon");
        let index = self.module.add_table_entry(&label);
        let cell = self.alloc.allocate(8)?;
        self.emit_closure_function(&label, params, body, &captured, &node.env)?;
        self.emit_cell_init(code, cell, index, &captured)?;
        emit_c(code, Op::I32Const(cell as i32), "closure cell");
        Ok(())
    }

    /// Fills a closure cell. With no captures the cell is pure data; with
    /// captures the environment record is built at runtime and both cell
    /// words are stored.
    fn emit_cell_init(
        &mut self,
        code: &mut Vec<Instr>,
        cell: u32,
        index: u32,
        captured: &[CapturedVar],
    ) -> Result<(), CodegenError> {
        if captured.is_empty() {
            self.module.add_data(cell, cell_bytes(index, 0));
            return Ok(());
        }
        self.use_malloc()?;
        emit_c(
            code,
            Op::I32Const((4 * captured.len()) as i32),
            "closure environment size",
        );
        emit(code, Op::Call(MALLOC.to_string()));
        let env_local = self.new_local("cenv_val", ValType::I32);
        emit(code, Op::LocalSet(LocalRef::name(&env_local)));
        for (i, cap) in captured.iter().enumerate() {
            emit(code, Op::LocalGet(LocalRef::name(&env_local)));
            match &cap.storage {
                Storage::Label(label) | Storage::Boxed(label) => {
                    emit_c(
                        code,
                        Op::LocalGet(LocalRef::name(label)),
                        format!("capture {}", cap.name),
                    );
                }
                Storage::Offset(idx) => {
                    emit_c(
                        code,
                        Op::LocalGet(LocalRef::Index(*idx)),
                        format!("capture {}", cap.name),
                    );
                }
                other => {
                    return Err(codegen_error(
                        ErrorKind::StorageKindMismatch,
                        format!("cannot capture '{}' stored as {other:?}", cap.name),
                    ))
                }
            }
            emit(code, store_instr(cap.slot, (4 * i) as u32));
        }
        emit(code, Op::I32Const(cell as i32));
        emit(code, Op::I32Const(index as i32));
        emit_c(code, Op::I32Store { offset: 0 }, "cell: table index");
        emit(code, Op::I32Const(cell as i32));
        emit(code, Op::LocalGet(LocalRef::name(&env_local)));
        emit_c(code, Op::I32Store { offset: 4 }, "cell: environment pointer");
        Ok(())
    }

    fn lower_let(
        &mut self,
        name: &str,
        mutable: bool,
        init: &TypedExpr,
        scope: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        // `let f = fn ... ` with no captured locals is hoisted to a named
        // top-level function; call sites stay direct.
        if !mutable {
            if let Expr::Lambda { params, body } = &init.kind {
                let fv = free_vars(init);
                if self.captured_locals(&fv).is_empty() {
                    let label = self.fresh(&format!("fun_{name}"));
                    let index = self.module.add_table_entry(&label);
                    self.emit_closure_function(&label, params, body, &[], &init.env)?;
                    self.vars.bind(name, Storage::TableEntry { label, index });
                    let result = self.lower(scope, code);
                    self.vars.unbind(name);
                    return result;
                }
            }
        }

        match self.val_type(&init.env, &init.ty) {
            None => {
                self.lower(init, code)?;
                self.vars.bind(name, Storage::Id(0));
            }
            Some(vt) if self.in_start() && mutable => {
                let global = self.fresh(name);
                self.module.add_global(Global {
                    label: global.clone(),
                    ty: vt,
                    mutable: true,
                    init: zero_const(vt),
                })?;
                self.lower(init, code)?;
                emit_c(code, Op::GlobalSet(global.clone()), format!("let mut {name}"));
                self.vars.bind(name, Storage::Label(global));
            }
            Some(vt) if self.in_start() => {
                let addr = self.alloc.allocate(4)?;
                emit_c(
                    code,
                    Op::I32Const(addr as i32),
                    format!("static cell for {name}"),
                );
                self.lower(init, code)?;
                emit(code, store_instr(vt, 0));
                self.vars.bind(name, Storage::Memory(addr));
            }
            Some(vt) if mutable && lambda_captures(name, scope) => {
                // A mutable captured by some closure lives in a one-cell
                // heap record; both sides go through the pointer.
                self.use_malloc()?;
                emit_c(code, Op::I32Const(4), format!("box for captured {name}"));
                emit(code, Op::Call(MALLOC.to_string()));
                let ptr = self.new_local(&format!("{name}_box"), ValType::I32);
                emit(code, Op::LocalTee(LocalRef::name(&ptr)));
                self.lower(init, code)?;
                emit(code, store_instr(vt, 0));
                self.vars.bind(name, Storage::Boxed(ptr));
            }
            Some(vt) => {
                let local = self.new_local(name, vt);
                self.lower(init, code)?;
                emit(code, Op::LocalSet(LocalRef::name(&local)));
                self.vars.bind(name, Storage::Label(local));
            }
        }
        let result = self.lower(scope, code);
        self.vars.unbind(name);
        result
    }

    /// `let rec` allocates the closure cell before the body is lowered, so
    /// recursive references resolve to a known address.
    fn lower_let_rec(
        &mut self,
        name: &str,
        init: &TypedExpr,
        scope: &TypedExpr,
        code: &mut Vec<Instr>,
    ) -> Result<(), CodegenError> {
        let Expr::Lambda { params, body } = &init.kind else {
            return Err(codegen_error(
                ErrorKind::InvalidAst,
                format!("let rec '{name}' must bind a function"),
            ));
        };
        let label = self.fresh(&format!("fun_{name}"));
        let index = self.module.add_table_entry(&label);
        let cell = self.alloc.allocate(8)?;
        self.vars.bind(
            name,
            Storage::FuncRef {
                label: label.clone(),
                cell,
            },
        );
        let mut fv = free_vars(init);
        fv.remove(name);
        let captured = self.captured_locals(&fv);
        self.emit_closure_function(&label, params, body, &captured, &init.env)?;
        self.emit_cell_init(code, cell, index, &captured)?;
        let result = self.lower(scope, code);
        self.vars.unbind(name);
        result
    }
}

pub(crate) fn emit(code: &mut Vec<Instr>, op: Op) {
    code.push(Instr::new(op));
}

pub(crate) fn emit_c(code: &mut Vec<Instr>, op: Op, comment: impl Into<String>) {
    code.push(Instr::commented(op, comment));
}

fn load_instr(ty: ValType, offset: u32) -> Op {
    match ty {
        ValType::I32 => Op::I32Load { offset },
        ValType::F32 => Op::F32Load { offset },
    }
}

fn store_instr(ty: ValType, offset: u32) -> Op {
    match ty {
        ValType::I32 => Op::I32Store { offset },
        ValType::F32 => Op::F32Store { offset },
    }
}

fn zero_const(ty: ValType) -> Instr {
    match ty {
        ValType::I32 => Instr::new(Op::I32Const(0)),
        ValType::F32 => Instr::new(Op::F32Const(0.0)),
    }
}

fn cell_bytes(index: u32, env: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8);
    bytes.extend_from_slice(&index.to_le_bytes());
    bytes.extend_from_slice(&env.to_le_bytes());
    bytes
}
