//! Deterministic WAT pretty-printer. Section order: types, imports, memory,
//! globals, table, element segments, functions, data segments, exports.

use crate::ir::{
    ExportKind, FuncType, Function, ImportDesc, Instr, Module, Op, ValType, WriteStyle,
};

pub fn write_module(module: &Module) -> String {
    let mut w = WatWriter::new();
    w.push_line("(module");
    w.indent();

    for ty in &module.types {
        w.push_line(format!(
            "(type ${} (func{}))",
            ty.canonical_name(),
            signature_text(ty)
        ));
    }

    for import in &module.imports {
        let desc = match &import.desc {
            ImportDesc::Func { label, ty } => {
                format!("(func ${label}{})", signature_text(ty))
            }
            ImportDesc::Memory { min, max } => match max {
                Some(max) => format!("(memory {min} {max})"),
                None => format!("(memory {min})"),
            },
            ImportDesc::Table { min } => format!("(table {min} funcref)"),
            ImportDesc::Global { label, ty, mutable } => {
                if *mutable {
                    format!("(global ${label} (mut {}))", ty.name())
                } else {
                    format!("(global ${label} {})", ty.name())
                }
            }
        };
        w.push_line(format!(
            "(import \"{}\" \"{}\" {desc})",
            import.module, import.name
        ));
    }

    if let Some(memory) = module.memory {
        match memory.max {
            Some(max) => w.push_line(format!("(memory $mem {} {max})", memory.min)),
            None => w.push_line(format!("(memory $mem {})", memory.min)),
        }
    }

    for global in &module.globals {
        let ty = if global.mutable {
            format!("(mut {})", global.ty.name())
        } else {
            global.ty.name().to_string()
        };
        w.push_line(format!(
            "(global ${} {ty} ({}))",
            global.label,
            op_text(&global.init.op)
        ));
    }

    if !module.table.is_empty() {
        w.push_line(format!("(table {} funcref)", module.table.len()));
        let entries = module
            .table
            .iter()
            .map(|label| format!("${label}"))
            .collect::<Vec<_>>()
            .join(" ");
        w.push_line(format!("(elem (i32.const 0) {entries})"));
    }

    for function in &module.functions {
        write_function(&mut w, module, function);
    }

    for segment in &module.data {
        w.push_line(format!(
            "(data (i32.const {}) \"{}\")",
            segment.offset,
            encode_bytes(&segment.bytes)
        ));
    }

    for export in &module.exports {
        let desc = match export.kind {
            ExportKind::Func => format!("(func ${})", export.target),
            ExportKind::Global => format!("(global ${})", export.target),
            ExportKind::Memory => "(memory $mem)".to_string(),
        };
        w.push_line(format!("(export \"{}\" {desc})", export.name));
    }

    w.dedent();
    w.push_line(")");
    w.finish()
}

fn write_function(w: &mut WatWriter, module: &Module, function: &Function) {
    let mut header = format!("(func ${}", function.label);
    for (name, ty) in &function.params {
        header.push_str(&format!(" (param ${name} {})", ty.name()));
    }
    for ty in &function.results {
        header.push_str(&format!(" (result {})", ty.name()));
    }
    w.push_line(header);
    w.indent();
    for (name, ty) in &function.locals {
        w.push_line(format!("(local ${name} {})", ty.name()));
    }
    match module.style {
        WriteStyle::Linear => write_linear(w, &function.body),
        WriteStyle::Folded => {
            let mut folder = Folder {
                module,
                results: &function.results,
            };
            folder.write(w, &function.body);
        }
    }
    w.dedent();
    w.push_line(")");
}

fn signature_text(ty: &FuncType) -> String {
    let mut text = String::new();
    for param in &ty.params {
        text.push_str(&format!(" (param {})", param.name()));
    }
    for result in &ty.results {
        text.push_str(&format!(" (result {})", result.name()));
    }
    text
}

fn results_text(results: &[ValType]) -> String {
    results
        .iter()
        .map(|ty| format!(" (result {})", ty.name()))
        .collect()
}

fn with_comment(text: String, comment: &Option<String>) -> String {
    match comment {
        Some(comment) => format!("{text} ;; {comment}"),
        None => text,
    }
}

fn write_linear(w: &mut WatWriter, instrs: &[Instr]) {
    for instr in instrs {
        match &instr.op {
            Op::Block {
                label,
                results,
                body,
            } => {
                w.push_line(with_comment(
                    format!("block ${label}{}", results_text(results)),
                    &instr.comment,
                ));
                w.indent();
                write_linear(w, body);
                w.dedent();
                w.push_line("end");
            }
            Op::Loop {
                label,
                results,
                body,
            } => {
                w.push_line(with_comment(
                    format!("loop ${label}{}", results_text(results)),
                    &instr.comment,
                ));
                w.indent();
                write_linear(w, body);
                w.dedent();
                w.push_line("end");
            }
            Op::If {
                results,
                then_body,
                else_body,
            } => {
                w.push_line(with_comment(
                    format!("if{}", results_text(results)),
                    &instr.comment,
                ));
                w.indent();
                write_linear(w, then_body);
                w.dedent();
                if !else_body.is_empty() {
                    w.push_line("else");
                    w.indent();
                    write_linear(w, else_body);
                    w.dedent();
                }
                w.push_line("end");
            }
            op => w.push_line(with_comment(op_text(op), &instr.comment)),
        }
    }
}

/// Folded-style emission. Operands are reconstructed from the stack shape
/// of the instruction stream and nested into their consumers; whenever an
/// operand is not available as an expression (it was left on the runtime
/// stack by control flow), the printer falls back to sequential folded
/// form, which assembles identically.
struct Folder<'a> {
    module: &'a Module,
    results: &'a [ValType],
}

impl<'a> Folder<'a> {
    fn write(&mut self, w: &mut WatWriter, instrs: &[Instr]) {
        let mut stack: Vec<String> = Vec::new();
        for instr in instrs {
            match &instr.op {
                Op::Block {
                    label,
                    results,
                    body,
                } => {
                    flush(w, &mut stack);
                    w.push_line(with_comment(
                        format!("(block ${label}{}", results_text(results)),
                        &instr.comment,
                    ));
                    w.indent();
                    self.write(w, body);
                    w.dedent();
                    w.push_line(")");
                }
                Op::Loop {
                    label,
                    results,
                    body,
                } => {
                    flush(w, &mut stack);
                    w.push_line(with_comment(
                        format!("(loop ${label}{}", results_text(results)),
                        &instr.comment,
                    ));
                    w.indent();
                    self.write(w, body);
                    w.dedent();
                    w.push_line(")");
                }
                Op::If {
                    results,
                    then_body,
                    else_body,
                } => {
                    let cond = stack.pop();
                    flush(w, &mut stack);
                    let mut header = format!("(if{}", results_text(results));
                    if let Some(cond) = cond {
                        header.push(' ');
                        header.push_str(&cond);
                    }
                    w.push_line(with_comment(header, &instr.comment));
                    w.indent();
                    w.push_line("(then");
                    w.indent();
                    self.write(w, then_body);
                    w.dedent();
                    w.push_line(")");
                    if !else_body.is_empty() {
                        w.push_line("(else");
                        w.indent();
                        self.write(w, else_body);
                        w.dedent();
                        w.push_line(")");
                    }
                    w.dedent();
                    w.push_line(")");
                }
                op => {
                    let Some((pops, pushes)) = self.stack_effect(op) else {
                        flush(w, &mut stack);
                        w.push_line(with_comment(format!("({})", op_text(op)), &instr.comment));
                        continue;
                    };
                    if pops > stack.len() || pushes > 1 {
                        flush(w, &mut stack);
                        w.push_line(with_comment(format!("({})", op_text(op)), &instr.comment));
                        continue;
                    }
                    let operands = stack.split_off(stack.len() - pops);
                    let mut text = format!("({}", op_text(op));
                    for operand in &operands {
                        text.push(' ');
                        text.push_str(operand);
                    }
                    text.push(')');
                    if let Some(comment) = &instr.comment {
                        text.push_str(&format!(" (; {comment} ;)"));
                    }
                    if pushes == 1 {
                        stack.push(text);
                    } else {
                        flush(w, &mut stack);
                        w.push_line(text);
                    }
                }
            }
        }
        flush(w, &mut stack);
    }

    /// (pops, pushes) for data instructions; `None` means the printer
    /// should not try to fold around this instruction.
    fn stack_effect(&self, op: &Op) -> Option<(usize, usize)> {
        let effect = match op {
            Op::I32Const(_) | Op::F32Const(_) | Op::LocalGet(_) | Op::GlobalGet(_) => (0, 1),
            Op::LocalSet(_) | Op::GlobalSet(_) | Op::Drop | Op::BrIf(_) => (1, 0),
            Op::LocalTee(_) => (1, 1),
            Op::Select => (3, 1),
            Op::I32Load { .. } | Op::F32Load { .. } => (1, 1),
            Op::I32Store { .. } | Op::F32Store { .. } | Op::I32Store8 { .. } => (2, 0),
            Op::MemorySize => (0, 1),
            Op::MemoryGrow => (1, 1),
            Op::I32Eqz
            | Op::F32Sqrt
            | Op::F32Trunc
            | Op::I32TruncF32S
            | Op::F32ConvertI32S
            | Op::I32ReinterpretF32
            | Op::F32ReinterpretI32 => (1, 1),
            Op::I32Eq
            | Op::I32Ne
            | Op::I32LtS
            | Op::I32LeS
            | Op::I32GtS
            | Op::I32GeS
            | Op::I32Add
            | Op::I32Sub
            | Op::I32Mul
            | Op::I32DivS
            | Op::I32RemS
            | Op::I32And
            | Op::I32Or
            | Op::I32Xor
            | Op::F32Eq
            | Op::F32Ne
            | Op::F32Lt
            | Op::F32Le
            | Op::F32Gt
            | Op::F32Ge
            | Op::F32Add
            | Op::F32Sub
            | Op::F32Mul
            | Op::F32Div
            | Op::F32Min
            | Op::F32Max => (2, 1),
            Op::Return => (self.results.len(), 0),
            Op::Nop => (0, 0),
            Op::Call(label) => self.call_effect(label)?,
            Op::CallIndirect(type_name) => {
                let ty = self.module.func_type(type_name)?;
                (ty.params.len() + 1, ty.results.len())
            }
            Op::Br(_) | Op::Unreachable => return None,
            Op::Block { .. } | Op::Loop { .. } | Op::If { .. } => return None,
        };
        Some(effect)
    }

    fn call_effect(&self, label: &str) -> Option<(usize, usize)> {
        if let Some(function) = self.module.function(label) {
            return Some((function.params.len(), function.results.len()));
        }
        self.module.imports.iter().find_map(|import| match &import.desc {
            ImportDesc::Func {
                label: import_label,
                ty,
            } if import_label == label => Some((ty.params.len(), ty.results.len())),
            _ => None,
        })
    }
}

fn flush(w: &mut WatWriter, stack: &mut Vec<String>) {
    for pending in stack.drain(..) {
        w.push_line(pending);
    }
}

fn op_text(op: &Op) -> String {
    match op {
        Op::Br(label) => format!("br ${label}"),
        Op::BrIf(label) => format!("br_if ${label}"),
        Op::Return => "return".to_string(),
        Op::Unreachable => "unreachable".to_string(),
        Op::Nop => "nop".to_string(),
        Op::Drop => "drop".to_string(),
        Op::Select => "select".to_string(),
        Op::LocalGet(local) => format!("local.get {local}"),
        Op::LocalSet(local) => format!("local.set {local}"),
        Op::LocalTee(local) => format!("local.tee {local}"),
        Op::GlobalGet(label) => format!("global.get ${label}"),
        Op::GlobalSet(label) => format!("global.set ${label}"),
        Op::I32Load { offset } => mem_text("i32.load", *offset),
        Op::F32Load { offset } => mem_text("f32.load", *offset),
        Op::I32Store { offset } => mem_text("i32.store", *offset),
        Op::F32Store { offset } => mem_text("f32.store", *offset),
        Op::I32Store8 { offset } => mem_text("i32.store8", *offset),
        Op::MemorySize => "memory.size".to_string(),
        Op::MemoryGrow => "memory.grow".to_string(),
        Op::I32Const(value) => format!("i32.const {value}"),
        Op::F32Const(value) => format!("f32.const {}", float_text(*value)),
        Op::I32Eqz => "i32.eqz".to_string(),
        Op::I32Eq => "i32.eq".to_string(),
        Op::I32Ne => "i32.ne".to_string(),
        Op::I32LtS => "i32.lt_s".to_string(),
        Op::I32LeS => "i32.le_s".to_string(),
        Op::I32GtS => "i32.gt_s".to_string(),
        Op::I32GeS => "i32.ge_s".to_string(),
        Op::I32Add => "i32.add".to_string(),
        Op::I32Sub => "i32.sub".to_string(),
        Op::I32Mul => "i32.mul".to_string(),
        Op::I32DivS => "i32.div_s".to_string(),
        Op::I32RemS => "i32.rem_s".to_string(),
        Op::I32And => "i32.and".to_string(),
        Op::I32Or => "i32.or".to_string(),
        Op::I32Xor => "i32.xor".to_string(),
        Op::F32Eq => "f32.eq".to_string(),
        Op::F32Ne => "f32.ne".to_string(),
        Op::F32Lt => "f32.lt".to_string(),
        Op::F32Le => "f32.le".to_string(),
        Op::F32Gt => "f32.gt".to_string(),
        Op::F32Ge => "f32.ge".to_string(),
        Op::F32Add => "f32.add".to_string(),
        Op::F32Sub => "f32.sub".to_string(),
        Op::F32Mul => "f32.mul".to_string(),
        Op::F32Div => "f32.div".to_string(),
        Op::F32Sqrt => "f32.sqrt".to_string(),
        Op::F32Trunc => "f32.trunc".to_string(),
        Op::F32Min => "f32.min".to_string(),
        Op::F32Max => "f32.max".to_string(),
        Op::I32TruncF32S => "i32.trunc_f32_s".to_string(),
        Op::F32ConvertI32S => "f32.convert_i32_s".to_string(),
        Op::I32ReinterpretF32 => "i32.reinterpret_f32".to_string(),
        Op::F32ReinterpretI32 => "f32.reinterpret_i32".to_string(),
        Op::Call(label) => format!("call ${label}"),
        Op::CallIndirect(type_name) => format!("call_indirect (type ${type_name})"),
        Op::Block { .. } | Op::Loop { .. } | Op::If { .. } => String::new(),
    }
}

fn mem_text(name: &str, offset: u32) -> String {
    if offset == 0 {
        name.to_string()
    } else {
        format!("{name} offset={offset}")
    }
}

fn float_text(value: f32) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "-inf".to_string()
        } else {
            "inf".to_string()
        }
    } else {
        format!("{value}")
    }
}

fn encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        out.push('\\');
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

fn hex_digit(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + (value - 10)) as char,
    }
}

struct WatWriter {
    lines: Vec<String>,
    indent: usize,
}

impl WatWriter {
    fn new() -> WatWriter {
        WatWriter {
            lines: Vec::new(),
            indent: 0,
        }
    }

    fn push_line(&mut self, line: impl AsRef<str>) {
        let prefix = "  ".repeat(self.indent);
        self.lines.push(format!("{prefix}{}", line.as_ref()));
    }

    fn indent(&mut self) {
        self.indent += 1;
    }

    fn dedent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    fn finish(self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Export, Function, Global, Import, LocalRef, Module, WriteStyle};

    fn sample_module(style: WriteStyle) -> Module {
        let mut module = Module::new(style);
        module
            .add_import(Import::func(
                "env",
                "writeInt",
                "writeInt",
                FuncType::new(vec![ValType::I32], vec![]),
            ))
            .unwrap();
        module.add_memory(1, None);
        module
            .add_global(Global {
                label: "exit_code".to_string(),
                ty: ValType::I32,
                mutable: true,
                init: Instr::new(Op::I32Const(0)),
            })
            .unwrap();
        module
            .add_function(Function {
                label: "_start".to_string(),
                params: vec![],
                results: vec![ValType::I32],
                locals: vec![("tmp".to_string(), ValType::I32)],
                body: vec![
                    Instr::new(Op::I32Const(1)),
                    Instr::commented(Op::I32Const(2), "rhs"),
                    Instr::new(Op::I32Add),
                    Instr::new(Op::Call("writeInt".to_string())),
                    Instr::new(Op::I32Const(0)),
                    Instr::new(Op::Return),
                ],
            })
            .unwrap();
        module.add_data(16, vec![0x68, 0x69]);
        module
            .add_export(Export {
                name: "_start".to_string(),
                kind: ExportKind::Func,
                target: "_start".to_string(),
            })
            .unwrap();
        module
            .add_export(Export {
                name: "memory".to_string(),
                kind: ExportKind::Memory,
                target: "mem".to_string(),
            })
            .unwrap();
        module
    }

    #[test]
    fn linear_output_parses_and_keeps_comments() {
        let text = write_module(&sample_module(WriteStyle::Linear));
        assert!(text.contains("i32.const 2 ;; rhs"));
        assert!(text.contains("(data (i32.const 16) \"\\68\\69\")"));
        wat::parse_str(&text).unwrap();
    }

    #[test]
    fn folded_output_nests_operands() {
        let text = write_module(&sample_module(WriteStyle::Folded));
        assert!(text.contains("(call $writeInt (i32.add (i32.const 1) (i32.const 2) (; rhs ;)))"));
        wat::parse_str(&text).unwrap();
    }

    #[test]
    fn folded_if_takes_its_condition_as_operand() {
        let mut module = Module::new(WriteStyle::Folded);
        module
            .add_function(Function {
                label: "pick".to_string(),
                params: vec![("flag".to_string(), ValType::I32)],
                results: vec![ValType::I32],
                locals: vec![],
                body: vec![
                    Instr::new(Op::LocalGet(LocalRef::name("flag"))),
                    Instr::new(Op::If {
                        results: vec![ValType::I32],
                        then_body: vec![Instr::new(Op::I32Const(10))],
                        else_body: vec![Instr::new(Op::I32Const(20))],
                    }),
                ],
            })
            .unwrap();
        let text = write_module(&module);
        assert!(text.contains("(if (result i32) (local.get $flag)"));
        wat::parse_str(&text).unwrap();
    }

    #[test]
    fn folded_falls_back_when_operands_live_on_the_runtime_stack() {
        let mut module = Module::new(WriteStyle::Folded);
        module
            .add_function(Function {
                label: "sum".to_string(),
                params: vec![],
                results: vec![ValType::I32],
                locals: vec![],
                body: vec![
                    Instr::new(Op::I32Const(1)),
                    Instr::new(Op::Block {
                        label: "b".to_string(),
                        results: vec![ValType::I32],
                        body: vec![Instr::new(Op::I32Const(2))],
                    }),
                    Instr::new(Op::I32Add),
                ],
            })
            .unwrap();
        let text = write_module(&module);
        wat::parse_str(&text).unwrap();
    }

    #[test]
    fn both_styles_assemble_to_the_same_binary_shape() {
        let linear = wat::parse_str(&write_module(&sample_module(WriteStyle::Linear))).unwrap();
        let folded = wat::parse_str(&write_module(&sample_module(WriteStyle::Folded))).unwrap();
        assert_eq!(linear, folded);
    }

    #[test]
    fn non_function_import_kinds_are_rendered() {
        let mut module = Module::new(WriteStyle::Linear);
        module
            .add_import(Import {
                module: "env".to_string(),
                name: "table".to_string(),
                desc: ImportDesc::Table { min: 2 },
            })
            .unwrap();
        module
            .add_import(Import {
                module: "env".to_string(),
                name: "tick".to_string(),
                desc: ImportDesc::Global {
                    label: "tick".to_string(),
                    ty: ValType::I32,
                    mutable: true,
                },
            })
            .unwrap();
        module
            .add_import(Import {
                module: "env".to_string(),
                name: "shared".to_string(),
                desc: ImportDesc::Memory { min: 1, max: Some(4) },
            })
            .unwrap();
        let text = write_module(&module);
        assert!(text.contains("(import \"env\" \"table\" (table 2 funcref))"));
        assert!(text.contains("(import \"env\" \"tick\" (global $tick (mut i32)))"));
        assert!(text.contains("(import \"env\" \"shared\" (memory 1 4))"));
        wat::parse_str(&text).unwrap();
    }

    #[test]
    fn local_references_by_index_are_printed_bare() {
        assert_eq!(op_text(&Op::LocalGet(LocalRef::Index(3))), "local.get 3");
        assert_eq!(
            op_text(&Op::LocalSet(LocalRef::name("ptr"))),
            "local.set $ptr"
        );
    }

    #[test]
    fn float_constants_round_trip_special_values() {
        assert_eq!(float_text(1.5), "1.5");
        assert_eq!(float_text(f32::NAN), "nan");
        assert_eq!(float_text(f32::NEG_INFINITY), "-inf");
    }
}
