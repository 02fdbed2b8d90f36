use crate::{codegen_error, CodegenError, ErrorKind};

/// Wasm value types used by the lowering; Hygge values are 32-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
    F32,
}

impl ValType {
    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::F32 => "f32",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> FuncType {
        FuncType { params, results }
    }

    /// Canonical name for the signature; the type table is keyed by it.
    pub fn canonical_name(&self) -> String {
        let params = if self.params.is_empty() {
            "void".to_string()
        } else {
            self.params
                .iter()
                .map(|ty| ty.name())
                .collect::<Vec<_>>()
                .join("_")
        };
        let results = if self.results.is_empty() {
            "void".to_string()
        } else {
            self.results
                .iter()
                .map(|ty| ty.name())
                .collect::<Vec<_>>()
                .join("_")
        };
        format!("fun_{params}_{results}")
    }
}

/// Reference to a local, either by declared name or by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalRef {
    Name(String),
    Index(u32),
}

impl LocalRef {
    pub fn name(name: &str) -> LocalRef {
        LocalRef::Name(name.to_string())
    }
}

impl std::fmt::Display for LocalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalRef::Name(name) => write!(f, "${name}"),
            LocalRef::Index(idx) => write!(f, "{idx}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // Control
    Block {
        label: String,
        results: Vec<ValType>,
        body: Vec<Instr>,
    },
    Loop {
        label: String,
        results: Vec<ValType>,
        body: Vec<Instr>,
    },
    If {
        results: Vec<ValType>,
        then_body: Vec<Instr>,
        else_body: Vec<Instr>,
    },
    Br(String),
    BrIf(String),
    Return,
    Unreachable,
    Nop,
    // Parametric
    Drop,
    Select,
    // Variables
    LocalGet(LocalRef),
    LocalSet(LocalRef),
    LocalTee(LocalRef),
    GlobalGet(String),
    GlobalSet(String),
    // Memory
    I32Load {
        offset: u32,
    },
    F32Load {
        offset: u32,
    },
    I32Store {
        offset: u32,
    },
    F32Store {
        offset: u32,
    },
    I32Store8 {
        offset: u32,
    },
    MemorySize,
    MemoryGrow,
    // Numeric
    I32Const(i32),
    F32Const(f32),
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LeS,
    I32GtS,
    I32GeS,
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32RemS,
    I32And,
    I32Or,
    I32Xor,
    F32Eq,
    F32Ne,
    F32Lt,
    F32Le,
    F32Gt,
    F32Ge,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F32Sqrt,
    F32Trunc,
    F32Min,
    F32Max,
    I32TruncF32S,
    F32ConvertI32S,
    I32ReinterpretF32,
    F32ReinterpretI32,
    // Calls
    Call(String),
    CallIndirect(String),
}

/// One emitted instruction plus the optional comment shown next to it in
/// the WAT output.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Op,
    pub comment: Option<String>,
}

impl Instr {
    pub fn new(op: Op) -> Instr {
        Instr { op, comment: None }
    }

    pub fn commented(op: Op, comment: impl Into<String>) -> Instr {
        Instr {
            op,
            comment: Some(comment.into()),
        }
    }
}

impl From<Op> for Instr {
    fn from(op: Op) -> Instr {
        Instr::new(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStyle {
    Linear,
    Folded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportDesc {
    Func { label: String, ty: FuncType },
    Memory { min: u32, max: Option<u32> },
    Table { min: u32 },
    Global { label: String, ty: ValType, mutable: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

impl Import {
    pub fn func(module: &str, name: &str, label: &str, ty: FuncType) -> Import {
        Import {
            module: module.to_string(),
            name: name.to_string(),
            desc: ImportDesc::Func {
                label: label.to_string(),
                ty,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub label: String,
    pub ty: ValType,
    pub mutable: bool,
    pub init: Instr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    pub min: u32,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub label: String,
    pub params: Vec<(String, ValType)>,
    pub results: Vec<ValType>,
    pub locals: Vec<(String, ValType)>,
    pub body: Vec<Instr>,
}

impl Function {
    pub fn signature(&self) -> FuncType {
        FuncType::new(
            self.params.iter().map(|(_, ty)| *ty).collect(),
            self.results.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Global,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub target: String,
}

/// In-memory representation of one Wasm module, mutated by the code
/// generator and rewritten by the peephole pass before serialization.
#[derive(Debug, Clone)]
pub struct Module {
    pub style: WriteStyle,
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    pub globals: Vec<Global>,
    pub memory: Option<Memory>,
    /// Element-segment entries of the single funcref table; the position of
    /// a label is its table index.
    pub table: Vec<String>,
    pub functions: Vec<Function>,
    pub data: Vec<DataSegment>,
    pub exports: Vec<Export>,
}

impl Module {
    pub fn new(style: WriteStyle) -> Module {
        Module {
            style,
            types: Vec::new(),
            imports: Vec::new(),
            globals: Vec::new(),
            memory: None,
            table: Vec::new(),
            functions: Vec::new(),
            data: Vec::new(),
            exports: Vec::new(),
        }
    }

    /// Records a signature in the type table and returns its canonical
    /// name. Each distinct signature is stored at most once.
    pub fn register_func_type(&mut self, ty: FuncType) -> String {
        let name = ty.canonical_name();
        if !self.types.iter().any(|existing| *existing == ty) {
            self.types.push(ty);
        }
        name
    }

    pub fn func_type(&self, canonical_name: &str) -> Option<&FuncType> {
        self.types
            .iter()
            .find(|ty| ty.canonical_name() == canonical_name)
    }

    pub fn add_function(&mut self, function: Function) -> Result<(), CodegenError> {
        if self.functions.iter().any(|f| f.label == function.label) {
            return Err(codegen_error(
                ErrorKind::DuplicateSymbol,
                format!("function label '{}' defined twice", function.label),
            ));
        }
        self.register_func_type(function.signature());
        self.functions.push(function);
        Ok(())
    }

    pub fn function(&self, label: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.label == label)
    }

    /// Idempotent for an identical re-declaration; a key collision with a
    /// different description is an error.
    pub fn add_import(&mut self, import: Import) -> Result<(), CodegenError> {
        if let ImportDesc::Func { ty, .. } = &import.desc {
            self.register_func_type(ty.clone());
        }
        match self
            .imports
            .iter()
            .find(|existing| existing.module == import.module && existing.name == import.name)
        {
            Some(existing) if *existing == import => Ok(()),
            Some(_) => Err(codegen_error(
                ErrorKind::ConflictingImport,
                format!("import '{}.{}' redeclared differently", import.module, import.name),
            )),
            None => {
                self.imports.push(import);
                Ok(())
            }
        }
    }

    pub fn add_global(&mut self, global: Global) -> Result<(), CodegenError> {
        match self.globals.iter().find(|g| g.label == global.label) {
            Some(existing) if *existing == global => Ok(()),
            Some(_) => Err(codegen_error(
                ErrorKind::DuplicateSymbol,
                format!("global '{}' defined twice", global.label),
            )),
            None => {
                self.globals.push(global);
                Ok(())
            }
        }
    }

    pub fn has_global(&self, label: &str) -> bool {
        self.globals.iter().any(|g| g.label == label)
    }

    /// Merges memory limits; the widest initial and maximum win.
    pub fn add_memory(&mut self, min: u32, max: Option<u32>) {
        let merged = match self.memory {
            None => Memory { min, max },
            Some(existing) => Memory {
                min: existing.min.max(min),
                max: match (existing.max, max) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                },
            },
        };
        self.memory = Some(merged);
    }

    /// Registers a function in the table's element segment and returns its
    /// index. A label already present keeps its original slot.
    pub fn add_table_entry(&mut self, label: &str) -> u32 {
        if let Some(idx) = self.table.iter().position(|entry| entry == label) {
            return idx as u32;
        }
        self.table.push(label.to_string());
        (self.table.len() - 1) as u32
    }

    pub fn add_data(&mut self, offset: u32, bytes: Vec<u8>) {
        let segment = DataSegment { offset, bytes };
        if !self.data.contains(&segment) {
            self.data.push(segment);
        }
    }

    pub fn add_export(&mut self, export: Export) -> Result<(), CodegenError> {
        match self.exports.iter().find(|e| e.name == export.name) {
            Some(existing) if *existing == export => Ok(()),
            Some(_) => Err(codegen_error(
                ErrorKind::DuplicateSymbol,
                format!("export '{}' declared twice", export.name),
            )),
            None => {
                self.exports.push(export);
                Ok(())
            }
        }
    }

    pub fn set_body(&mut self, label: &str, body: Vec<Instr>) -> Result<(), CodegenError> {
        match self.functions.iter_mut().find(|f| f.label == label) {
            Some(function) => {
                function.body = body;
                Ok(())
            }
            None => Err(codegen_error(
                ErrorKind::DuplicateSymbol,
                format!("no function '{label}' to receive a body"),
            )),
        }
    }

    pub fn append_to_function(
        &mut self,
        label: &str,
        code: Vec<Instr>,
    ) -> Result<(), CodegenError> {
        match self.functions.iter_mut().find(|f| f.label == label) {
            Some(function) => {
                function.body.extend(code);
                Ok(())
            }
            None => Err(codegen_error(
                ErrorKind::DuplicateSymbol,
                format!("no function '{label}' to append to"),
            )),
        }
    }

    /// Union of two modules, de-duplicated by unique key: function label
    /// for functions, (module, name) for imports, label for globals,
    /// name for exports. Conflicting duplicates abort.
    pub fn merge(&mut self, other: Module) -> Result<(), CodegenError> {
        for ty in other.types {
            self.register_func_type(ty);
        }
        for import in other.imports {
            self.add_import(import)?;
        }
        for global in other.globals {
            self.add_global(global)?;
        }
        if let Some(memory) = other.memory {
            self.add_memory(memory.min, memory.max);
        }
        for label in other.table {
            self.add_table_entry(&label);
        }
        for function in other.functions {
            match self.functions.iter().find(|f| f.label == function.label) {
                Some(existing) if *existing == function => {}
                Some(_) => {
                    return Err(codegen_error(
                        ErrorKind::DuplicateSymbol,
                        format!("function label '{}' defined twice", function.label),
                    ))
                }
                None => self.functions.push(function),
            }
        }
        for segment in other.data {
            self.add_data(segment.offset, segment.bytes);
        }
        for export in other.exports {
            self.add_export(export)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_identity() -> FuncType {
        FuncType::new(vec![ValType::I32], vec![ValType::I32])
    }

    fn dummy_function(label: &str) -> Function {
        Function {
            label: label.to_string(),
            params: vec![("x".to_string(), ValType::I32)],
            results: vec![ValType::I32],
            locals: Vec::new(),
            body: vec![Instr::new(Op::LocalGet(LocalRef::name("x")))],
        }
    }

    #[test]
    fn canonical_names_distinguish_param_and_result_splits() {
        let a = FuncType::new(vec![ValType::I32], vec![ValType::F32]);
        let b = FuncType::new(vec![ValType::I32, ValType::F32], vec![]);
        assert_ne!(a.canonical_name(), b.canonical_name());
        assert_eq!(
            FuncType::new(vec![], vec![ValType::I32]).canonical_name(),
            "fun_void_i32"
        );
    }

    #[test]
    fn type_table_deduplicates_signatures() {
        let mut module = Module::new(WriteStyle::Linear);
        let first = module.register_func_type(i32_identity());
        let second = module.register_func_type(i32_identity());
        assert_eq!(first, second);
        assert_eq!(module.types.len(), 1);
    }

    #[test]
    fn duplicate_function_label_is_rejected() {
        let mut module = Module::new(WriteStyle::Linear);
        module.add_function(dummy_function("f")).unwrap();
        let err = module.add_function(dummy_function("f")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateSymbol);
    }

    #[test]
    fn import_is_idempotent_but_conflicts_are_rejected() {
        let mut module = Module::new(WriteStyle::Linear);
        let import = Import::func("env", "malloc", "malloc", i32_identity());
        module.add_import(import.clone()).unwrap();
        module.add_import(import).unwrap();
        assert_eq!(module.imports.len(), 1);

        let conflicting = Import::func(
            "env",
            "malloc",
            "malloc",
            FuncType::new(vec![ValType::F32], vec![ValType::I32]),
        );
        let err = module.add_import(conflicting).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConflictingImport);
    }

    #[test]
    fn memory_merge_keeps_widest_limits() {
        let mut module = Module::new(WriteStyle::Linear);
        module.add_memory(1, Some(4));
        module.add_memory(3, Some(2));
        assert_eq!(module.memory, Some(Memory { min: 3, max: Some(4) }));
        module.add_memory(2, None);
        assert_eq!(module.memory, Some(Memory { min: 3, max: None }));
    }

    #[test]
    fn table_entries_keep_their_first_slot() {
        let mut module = Module::new(WriteStyle::Linear);
        assert_eq!(module.add_table_entry("f"), 0);
        assert_eq!(module.add_table_entry("g"), 1);
        assert_eq!(module.add_table_entry("f"), 0);
        assert_eq!(module.table.len(), 2);
    }

    #[test]
    fn merge_unions_and_deduplicates() {
        let mut left = Module::new(WriteStyle::Linear);
        left.add_function(dummy_function("f")).unwrap();
        left.add_import(Import::func("env", "malloc", "malloc", i32_identity()))
            .unwrap();

        let mut right = Module::new(WriteStyle::Linear);
        right.add_function(dummy_function("f")).unwrap();
        right.add_function(dummy_function("g")).unwrap();
        right
            .add_import(Import::func("env", "malloc", "malloc", i32_identity()))
            .unwrap();
        right.add_memory(2, None);

        left.merge(right).unwrap();
        assert_eq!(left.functions.len(), 2);
        assert_eq!(left.imports.len(), 1);
        assert_eq!(left.memory, Some(Memory { min: 2, max: None }));
    }

    #[test]
    fn bodies_can_be_replaced_and_extended() {
        let mut module = Module::new(WriteStyle::Linear);
        module.add_function(dummy_function("f")).unwrap();
        module
            .set_body("f", vec![Instr::new(Op::I32Const(1))])
            .unwrap();
        module
            .append_to_function("f", vec![Instr::new(Op::Return)])
            .unwrap();
        let body = &module.function("f").unwrap().body;
        assert_eq!(body.len(), 2);
        assert!(matches!(body[1].op, Op::Return));
        assert!(module.set_body("ghost", Vec::new()).is_err());
    }

    #[test]
    fn merge_rejects_same_label_different_body() {
        let mut left = Module::new(WriteStyle::Linear);
        left.add_function(dummy_function("f")).unwrap();

        let mut right = Module::new(WriteStyle::Linear);
        let mut altered = dummy_function("f");
        altered.body.push(Instr::new(Op::Drop));
        right.add_function(altered).unwrap();

        let err = left.merge(right).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateSymbol);
    }
}
