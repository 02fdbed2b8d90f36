//! Hygge → WebAssembly lowering: turns the typed AST into a WAT module.

mod alloc;
mod analysis;
mod codegen;
mod ir;
mod peephole;
pub mod run;
mod runtime;
mod writer;

pub use alloc::{StaticAllocator, PAGE_SIZE};
pub use codegen::codegen;
pub use ir::{
    DataSegment, Export, ExportKind, FuncType, Function, Global, Import, ImportDesc, Instr,
    LocalRef, Memory, Module, Op, ValType, WriteStyle,
};
pub use peephole::optimize;
pub use writer::write_module;

use hygge_core::TypedExpr;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidAst,
    UnresolvedIdentifier,
    StorageKindMismatch,
    DuplicateSymbol,
    ConflictingImport,
    InvalidSize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodegenError {
    pub kind: ErrorKind,
    pub message: String,
}

pub(crate) fn codegen_error(kind: ErrorKind, message: impl Into<String>) -> CodegenError {
    CodegenError {
        kind,
        message: message.into(),
    }
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CodegenError {}

/// Whether the emitted module imports `malloc` from the host or carries its
/// own bump allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationStrategy {
    Internal,
    #[default]
    External,
}

/// Syscall-interface dialect; only one is defined so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyscallInterface {
    #[default]
    HyggeSi,
}

#[derive(Debug, Clone, Copy)]
pub struct CompileConfig {
    pub style: WriteStyle,
    pub alloc: AllocationStrategy,
    pub si: SyscallInterface,
    pub peephole: bool,
}

impl Default for CompileConfig {
    fn default() -> CompileConfig {
        CompileConfig {
            style: WriteStyle::Linear,
            alloc: AllocationStrategy::External,
            si: SyscallInterface::HyggeSi,
            peephole: true,
        }
    }
}

/// Lowers the typed AST and runs the peephole pass when enabled.
pub fn compile_module(ast: &TypedExpr, config: &CompileConfig) -> Result<Module, CodegenError> {
    let mut module = codegen(ast, config)?;
    if config.peephole {
        peephole::optimize(&mut module);
    }
    Ok(module)
}

/// Full pipeline: lower, optimize, serialize to WAT text.
pub fn compile(ast: &TypedExpr, config: &CompileConfig) -> Result<String, CodegenError> {
    let module = compile_module(ast, config)?;
    Ok(write_module(&module))
}

/// Assembles the emitted WAT to binary Wasm; the text must be accepted by a
/// conformant parser for every lowerable AST.
pub fn emit_wasm(ast: &TypedExpr, config: &CompileConfig) -> anyhow::Result<Vec<u8>> {
    let wat_text = compile(ast, config)?;
    let bytes = wat::parse_str(&wat_text)?;
    Ok(bytes)
}
