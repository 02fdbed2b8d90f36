//! Well-known runtime names: host imports, synthesized globals, and the
//! internal bump allocator used when the module must not import `malloc`.

use crate::ir::{FuncType, Function, Import, Instr, LocalRef, Module, Op, ValType};
use crate::CodegenError;

pub(crate) const HOST_MODULE: &str = "env";
pub(crate) const MALLOC: &str = "malloc";
pub(crate) const WRITE_INT: &str = "writeInt";
pub(crate) const WRITE_FLOAT: &str = "writeFloat";
pub(crate) const WRITE_S: &str = "writeS";
pub(crate) const READ_INT: &str = "readInt";
pub(crate) const READ_FLOAT: &str = "readFloat";

pub(crate) const START: &str = "_start";
pub(crate) const EXIT_CODE_GLOBAL: &str = "exit_code";
pub(crate) const HEAP_BASE_GLOBAL: &str = "heap_base";
pub(crate) const HEAP_PTR_GLOBAL: &str = "heap_ptr";

/// Sentinel returned from `_start` when a runtime check fails; success is 0.
pub(crate) const RUNTIME_FAILURE: i32 = 42;

pub(crate) fn malloc_type() -> FuncType {
    FuncType::new(vec![ValType::I32], vec![ValType::I32])
}

pub(crate) fn declare_malloc(module: &mut Module) -> Result<(), CodegenError> {
    module.add_import(Import::func(HOST_MODULE, MALLOC, MALLOC, malloc_type()))
}

pub(crate) fn declare_write_int(module: &mut Module) -> Result<(), CodegenError> {
    module.add_import(Import::func(
        HOST_MODULE,
        WRITE_INT,
        WRITE_INT,
        FuncType::new(vec![ValType::I32], vec![]),
    ))
}

pub(crate) fn declare_write_float(module: &mut Module) -> Result<(), CodegenError> {
    module.add_import(Import::func(
        HOST_MODULE,
        WRITE_FLOAT,
        WRITE_FLOAT,
        FuncType::new(vec![ValType::F32], vec![]),
    ))
}

pub(crate) fn declare_write_s(module: &mut Module) -> Result<(), CodegenError> {
    module.add_import(Import::func(
        HOST_MODULE,
        WRITE_S,
        WRITE_S,
        FuncType::new(vec![ValType::I32, ValType::I32], vec![]),
    ))
}

pub(crate) fn declare_read_int(module: &mut Module) -> Result<(), CodegenError> {
    module.add_import(Import::func(
        HOST_MODULE,
        READ_INT,
        READ_INT,
        FuncType::new(vec![], vec![ValType::I32]),
    ))
}

pub(crate) fn declare_read_float(module: &mut Module) -> Result<(), CodegenError> {
    module.add_import(Import::func(
        HOST_MODULE,
        READ_FLOAT,
        READ_FLOAT,
        FuncType::new(vec![], vec![ValType::F32]),
    ))
}

/// Builds the module-local `malloc` for the internal allocation strategy: a
/// bump allocator over `$heap_ptr` that grows memory when the new mark
/// crosses the current page count. A failed `memory.grow` records the
/// failure sentinel and hands back a null pointer.
pub(crate) fn synthesize_malloc(module: &mut Module) -> Result<(), CodegenError> {
    let get = |name: &str| Instr::new(Op::LocalGet(LocalRef::name(name)));
    let set = |name: &str| Instr::new(Op::LocalSet(LocalRef::name(name)));

    let grow_failed = vec![
        Instr::new(Op::I32Const(RUNTIME_FAILURE)),
        Instr::commented(Op::GlobalSet(EXIT_CODE_GLOBAL.to_string()), "out of memory"),
        Instr::new(Op::I32Const(0)),
        Instr::new(Op::Return),
    ];

    let grow = vec![
        get("pages_needed"),
        get("cur_pages"),
        Instr::new(Op::I32Sub),
        set("grow_by"),
        get("grow_by"),
        Instr::new(Op::MemoryGrow),
        Instr::new(Op::I32Const(-1)),
        Instr::new(Op::I32Eq),
        Instr::new(Op::If {
            results: vec![],
            then_body: grow_failed,
            else_body: vec![],
        }),
    ];

    let body = vec![
        Instr::commented(Op::GlobalGet(HEAP_PTR_GLOBAL.to_string()), "bump pointer"),
        set("ptr"),
        Instr::new(Op::GlobalGet(HEAP_PTR_GLOBAL.to_string())),
        get("size"),
        Instr::new(Op::I32Add),
        Instr::new(Op::I32Const(3)),
        Instr::new(Op::I32Add),
        Instr::commented(Op::I32Const(-4), "align to the 4-byte stride"),
        Instr::new(Op::I32And),
        set("new_heap"),
        get("new_heap"),
        Instr::new(Op::I32Const(crate::alloc::PAGE_SIZE as i32 - 1)),
        Instr::new(Op::I32Add),
        Instr::new(Op::I32Const(crate::alloc::PAGE_SIZE as i32)),
        Instr::new(Op::I32DivS),
        set("pages_needed"),
        Instr::new(Op::MemorySize),
        set("cur_pages"),
        get("pages_needed"),
        get("cur_pages"),
        Instr::new(Op::I32GtS),
        Instr::new(Op::If {
            results: vec![],
            then_body: grow,
            else_body: vec![],
        }),
        get("new_heap"),
        Instr::new(Op::GlobalSet(HEAP_PTR_GLOBAL.to_string())),
        get("ptr"),
    ];

    module.add_function(Function {
        label: MALLOC.to_string(),
        params: vec![("size".to_string(), ValType::I32)],
        results: vec![ValType::I32],
        locals: vec![
            ("ptr".to_string(), ValType::I32),
            ("new_heap".to_string(), ValType::I32),
            ("pages_needed".to_string(), ValType::I32),
            ("cur_pages".to_string(), ValType::I32),
            ("grow_by".to_string(), ValType::I32),
        ],
        body,
    })
}
