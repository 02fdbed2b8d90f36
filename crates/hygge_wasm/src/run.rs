//! Executes an emitted WAT module under wasmtime with the Hygge host
//! interface bound: `env.malloc` as a host-side bump allocator over the
//! module's own memory, the write family recording a host-call trace, and
//! the read family popping queued inputs.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use wasmtime::{Caller, Engine, Extern, Linker, Module as WasmModule, Store, Val};

use crate::runtime::RUNTIME_FAILURE;

/// One observable host call, in program order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HostCall {
    WriteInt(i32),
    WriteFloat(f32),
    WriteS(String),
}

/// Queued inputs for `readInt` / `readFloat`; exhausted queues yield zero.
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    pub ints: VecDeque<i32>,
    pub floats: VecDeque<f32>,
}

impl RunInput {
    pub fn new() -> RunInput {
        RunInput::default()
    }

    pub fn with_ints(ints: &[i32]) -> RunInput {
        RunInput {
            ints: ints.iter().copied().collect(),
            floats: VecDeque::new(),
        }
    }

    pub fn with_floats(floats: &[f32]) -> RunInput {
        RunInput {
            ints: VecDeque::new(),
            floats: floats.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub calls: Vec<HostCall>,
}

impl ExecOutcome {
    pub fn failed(&self) -> bool {
        self.exit_code == RUNTIME_FAILURE
    }
}

#[derive(Serialize)]
struct RunReport {
    tool: &'static str,
    version: &'static str,
    ok: bool,
    exit_code: Option<i32>,
    calls: Vec<HostCall>,
    error: Option<String>,
}

struct HostState {
    calls: Vec<HostCall>,
    ints: VecDeque<i32>,
    floats: VecDeque<f32>,
    heap: Option<u32>,
}

pub fn run_module(wat_text: &str, input: &RunInput) -> Result<ExecOutcome> {
    let engine = Engine::default();
    let module =
        WasmModule::new(&engine, wat_text).context("emitted module rejected by wasmtime")?;
    let mut store = Store::new(
        &engine,
        HostState {
            calls: Vec::new(),
            ints: input.ints.clone(),
            floats: input.floats.clone(),
            heap: None,
        },
    );
    let mut linker: Linker<HostState> = Linker::new(&engine);

    linker.func_wrap("env", "writeInt", |mut caller: Caller<'_, HostState>, value: i32| {
        caller.data_mut().calls.push(HostCall::WriteInt(value));
    })?;
    linker.func_wrap(
        "env",
        "writeFloat",
        |mut caller: Caller<'_, HostState>, value: f32| {
            caller.data_mut().calls.push(HostCall::WriteFloat(value));
        },
    )?;
    linker.func_wrap(
        "env",
        "writeS",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<()> {
            let memory = exported_memory(&mut caller)?;
            let data = memory.data(&caller);
            let start = ptr as usize;
            let end = start.saturating_add(len.max(0) as usize);
            let bytes = data
                .get(start..end)
                .ok_or_else(|| anyhow!("writeS range {start}..{end} out of bounds"))?
                .to_vec();
            let text = String::from_utf8_lossy(&bytes).into_owned();
            caller.data_mut().calls.push(HostCall::WriteS(text));
            Ok(())
        },
    )?;
    linker.func_wrap("env", "readInt", |mut caller: Caller<'_, HostState>| -> i32 {
        caller.data_mut().ints.pop_front().unwrap_or(0)
    })?;
    linker.func_wrap(
        "env",
        "readFloat",
        |mut caller: Caller<'_, HostState>| -> f32 {
            caller.data_mut().floats.pop_front().unwrap_or(0.0)
        },
    )?;
    linker.func_wrap(
        "env",
        "malloc",
        |mut caller: Caller<'_, HostState>, size: i32| -> Result<i32> { host_malloc(&mut caller, size) },
    )?;

    let instance = linker
        .instantiate(&mut store, &module)
        .context("instantiation failed")?;
    let start = instance
        .get_typed_func::<(), i32>(&mut store, "_start")
        .context("missing _start export")?;
    let mut exit_code = start.call(&mut store, ()).context("_start trapped")?;

    // Nested functions report failures through the exported global.
    if exit_code == 0 {
        if let Some(global) = instance.get_global(&mut store, "exit_code") {
            if let Val::I32(flag) = global.get(&mut store) {
                if flag != 0 {
                    exit_code = flag;
                }
            }
        }
    }

    Ok(ExecOutcome {
        exit_code,
        calls: store.into_data().calls,
    })
}

/// Executes and renders a serializable report, matching the shape the
/// driver prints for its run subcommands.
pub fn run_report_json(wat_text: &str, input: &RunInput) -> String {
    let report = match run_module(wat_text, input) {
        Ok(outcome) => RunReport {
            tool: hygge_core::TOOL_NAME,
            version: hygge_core::VERSION,
            ok: outcome.exit_code == 0,
            exit_code: Some(outcome.exit_code),
            calls: outcome.calls,
            error: None,
        },
        Err(err) => RunReport {
            tool: hygge_core::TOOL_NAME,
            version: hygge_core::VERSION,
            ok: false,
            exit_code: None,
            calls: Vec::new(),
            error: Some(format!("{err:#}")),
        },
    };
    serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
}

fn exported_memory(caller: &mut Caller<'_, HostState>) -> Result<wasmtime::Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(anyhow!("module exports no memory")),
    }
}

/// Host-side bump allocator. The cursor starts at the module's compile-time
/// high-water mark (the exported `heap_base_ptr`) and memory grows on
/// demand.
fn host_malloc(caller: &mut Caller<'_, HostState>, size: i32) -> Result<i32> {
    let memory = exported_memory(caller)?;
    let heap = match caller.data().heap {
        Some(heap) => heap,
        None => {
            let base = match caller.get_export("heap_base_ptr") {
                Some(Extern::Global(global)) => match global.get(&mut *caller) {
                    Val::I32(value) => value as u32,
                    _ => 0,
                },
                _ => 0,
            };
            caller.data_mut().heap = Some(base);
            base
        }
    };
    let aligned = ((size.max(0) as u32) + 3) & !3;
    let end = heap as u64 + aligned as u64;
    let current = memory.data_size(&*caller) as u64;
    if end > current {
        let pages = (end - current).div_ceil(crate::alloc::PAGE_SIZE as u64);
        memory
            .grow(&mut *caller, pages)
            .context("memory.grow failed")?;
    }
    caller.data_mut().heap = Some(heap + aligned);
    Ok(heap as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compile, AllocationStrategy, CompileConfig, WriteStyle};
    use hygge_core::build;
    use hygge_core::{BinOp, Type, TypedExpr, UnOp};

    fn exec(ast: &TypedExpr) -> ExecOutcome {
        exec_with(ast, &CompileConfig::default(), &RunInput::new())
    }

    fn exec_with(ast: &TypedExpr, config: &CompileConfig, input: &RunInput) -> ExecOutcome {
        let wat_text = compile(ast, config).unwrap();
        run_module(&wat_text, input).unwrap_or_else(|err| panic!("{err:#}\n---\n{wat_text}"))
    }

    fn counters_program() -> TypedExpr {
        // fun makeCounters() = { let mut c = 0; {inc = fn(d) -> {c := c+d; c},
        //                                        dec = fn(d) -> {c := c-d; c}} }
        let c = || build::var("c", Type::Int);
        let d = || build::var("d", Type::Int);
        let inc = build::lambda(
            vec![("d", Type::Int)],
            build::seq(vec![build::assign(c(), build::add(c(), d())), c()]),
        );
        let dec = build::lambda(
            vec![("d", Type::Int)],
            build::seq(vec![build::assign(c(), build::sub(c(), d())), c()]),
        );
        let make_body = build::let_mut(
            "c",
            build::int(0),
            build::struct_cons(vec![("inc", inc), ("dec", dec)]),
        );
        let struct_ty = make_body.ty.clone();
        let make = build::lambda(vec![], make_body);
        let make_ty = make.ty.clone();
        let cs = || build::var("cs", struct_ty.clone());
        build::let_(
            "makeCounters",
            make,
            build::let_(
                "cs",
                build::apply(build::var("makeCounters", make_ty), vec![]),
                build::seq(vec![
                    build::assertion(build::eq(
                        build::apply(build::field(cs(), "inc"), vec![build::int(5)]),
                        build::int(5),
                    )),
                    build::assertion(build::eq(
                        build::apply(build::field(cs(), "dec"), vec![build::int(2)]),
                        build::int(3),
                    )),
                ]),
            ),
        )
    }

    fn array_sum_program(index_for_write: i32) -> TypedExpr {
        let arr_ty = Type::array(Type::Int);
        let arr = || build::var("arr", arr_ty.clone());
        build::let_(
            "arr",
            build::array(build::int(3), build::int(0)),
            build::seq(vec![
                build::assign(build::array_elem(arr(), build::int(index_for_write)), build::int(5)),
                build::assign(build::array_elem(arr(), build::int(1)), build::int(-1)),
                build::assign(build::array_elem(arr(), build::int(2)), build::int(2)),
                build::assertion(build::eq(build::array_len(arr()), build::int(3))),
                build::assertion(build::eq(
                    build::add(
                        build::add(
                            build::array_elem(arr(), build::int(0)),
                            build::array_elem(arr(), build::int(1)),
                        ),
                        build::array_elem(arr(), build::int(2)),
                    ),
                    build::int(6),
                )),
            ]),
        )
    }

    #[test]
    fn prints_and_asserts_arithmetic() {
        let ast = build::seq(vec![
            build::print(build::add(build::int(1), build::int(2))),
            build::assertion(build::eq(build::int(3), build::add(build::int(1), build::int(2)))),
        ]);
        let outcome = exec(&ast);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.calls, vec![HostCall::WriteInt(3)]);
    }

    #[test]
    fn while_loop_counts_to_ten() {
        let x = || build::var("x", Type::Int);
        let ast = build::let_mut(
            "x",
            build::int(0),
            build::seq(vec![
                build::while_(
                    build::less(x(), build::int(10)),
                    build::assign(x(), build::add(x(), build::int(1))),
                ),
                build::assertion(build::eq(x(), build::int(10))),
            ]),
        );
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn array_writes_and_sums() {
        assert_eq!(exec(&array_sum_program(0)).exit_code, 0);
    }

    #[test]
    fn negative_index_exits_with_sentinel() {
        assert_eq!(exec(&array_sum_program(-1)).exit_code, 42);
    }

    #[test]
    fn index_past_the_end_exits_with_sentinel() {
        let arr_ty = Type::array(Type::Int);
        let ast = build::let_(
            "arr",
            build::array(build::int(3), build::int(0)),
            build::print(build::array_elem(build::var("arr", arr_ty), build::int(3))),
        );
        let outcome = exec(&ast);
        assert_eq!(outcome.exit_code, 42);
        assert!(outcome.calls.is_empty());
    }

    #[test]
    fn recursive_fibonacci() {
        // let rec f(n) = if n < 2 then n else f(n-1) + f(n-2)
        let fun_ty = Type::fun(vec![Type::Int], Type::Int);
        let n = || build::var("n", Type::Int);
        let f = || build::var("f", fun_ty.clone());
        let body = build::cond(
            build::less(n(), build::int(2)),
            n(),
            build::add(
                build::apply(f(), vec![build::sub(n(), build::int(1))]),
                build::apply(f(), vec![build::sub(n(), build::int(2))]),
            ),
        );
        let ast = build::let_rec(
            "f",
            build::lambda(vec![("n", Type::Int)], body),
            build::assertion(build::eq(
                build::apply(f(), vec![build::int(10)]),
                build::int(55),
            )),
        );
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn closure_counters_share_their_cell() {
        assert_eq!(exec(&counters_program()).exit_code, 0);
    }

    #[test]
    fn false_assertion_exits_with_sentinel() {
        let ast = build::assertion(build::boolean(false));
        assert_eq!(exec(&ast).exit_code, 42);
    }

    #[test]
    fn failing_check_inside_a_function_reaches_the_driver() {
        // the assertion fails inside a named function; _start still returns
        // 0, so the sentinel must come from the exit_code global
        let fun_ty = Type::fun(vec![Type::Int], Type::Unit);
        let ast = build::let_(
            "check",
            build::lambda(
                vec![("n", Type::Int)],
                build::assertion(build::eq(build::var("n", Type::Int), build::int(1))),
            ),
            build::apply(build::var("check", fun_ty), vec![build::int(2)]),
        );
        assert_eq!(exec(&ast).exit_code, 42);
    }

    #[test]
    fn division_by_zero_exits_with_sentinel() {
        let ast = build::print(build::binary(BinOp::Div, build::int(1), build::int(0)));
        let outcome = exec(&ast);
        assert_eq!(outcome.exit_code, 42);
        assert!(outcome.calls.is_empty());
    }

    #[test]
    fn short_circuit_skips_the_trapping_side() {
        let division = build::eq(
            build::binary(BinOp::Div, build::int(1), build::int(0)),
            build::int(0),
        );
        let ast = build::assertion(build::eq(
            build::sc_and(build::boolean(false), division),
            build::boolean(false),
        ));
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn slice_shares_data_and_checks_its_range() {
        let arr_ty = Type::array(Type::Int);
        let arr = || build::var("arr", arr_ty.clone());
        let ok = build::let_(
            "arr",
            build::array(build::int(4), build::int(7)),
            build::let_(
                "s",
                build::array_slice(arr(), build::int(1), build::int(3)),
                build::seq(vec![
                    build::assertion(build::eq(
                        build::array_len(build::var("s", arr_ty.clone())),
                        build::int(2),
                    )),
                    build::assertion(build::eq(
                        build::array_elem(build::var("s", arr_ty.clone()), build::int(0)),
                        build::int(7),
                    )),
                ]),
            ),
        );
        assert_eq!(exec(&ok).exit_code, 0);

        let inverted = build::let_(
            "arr",
            build::array(build::int(4), build::int(7)),
            build::print(build::array_len(build::array_slice(
                arr(),
                build::int(3),
                build::int(3),
            ))),
        );
        assert_eq!(exec(&inverted).exit_code, 42);
    }

    #[test]
    fn union_match_binds_the_payload() {
        let union_ty = Type::Union(vec![
            ("some".to_string(), Type::Int),
            ("none".to_string(), Type::Unit),
        ]);
        let matched = build::match_(
            build::union_cons("some", build::int(5), union_ty.clone()),
            vec![
                ("some", "v", build::add(build::var("v", Type::Int), build::int(1))),
                ("none", "u", build::int(0)),
            ],
        );
        let ast = build::assertion(build::eq(matched, build::int(6)));
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn unmatched_scrutinee_exits_with_sentinel() {
        let union_ty = Type::Union(vec![
            ("some".to_string(), Type::Int),
            ("none".to_string(), Type::Unit),
        ]);
        let matched = build::match_(
            build::union_cons("none", build::unit(), union_ty),
            vec![("some", "v", build::var("v", Type::Int))],
        );
        let ast = build::print(matched);
        assert_eq!(exec(&ast).exit_code, 42);
    }

    #[test]
    fn do_while_runs_the_body_first() {
        let x = || build::var("x", Type::Int);
        let ast = build::let_mut(
            "x",
            build::int(5),
            build::seq(vec![
                // condition is false immediately, body must still run once
                build::do_while(
                    build::assign(x(), build::add(x(), build::int(1))),
                    build::less(x(), build::int(0)),
                ),
                build::assertion(build::eq(x(), build::int(6))),
            ]),
        );
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn for_loop_and_compound_assignment_sum() {
        let i = || build::var("i", Type::Int);
        let total = || build::var("total", Type::Int);
        let ast = build::let_mut(
            "total",
            build::int(0),
            build::let_mut(
                "i",
                build::int(0),
                build::seq(vec![
                    build::for_(
                        build::assign(i(), build::int(0)),
                        build::less(i(), build::int(5)),
                        build::pre_incr(i()),
                        build::op_assign(BinOp::Add, total(), i()),
                    ),
                    build::assertion(build::eq(total(), build::int(10))),
                ]),
            ),
        );
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn pre_and_post_increment_differ() {
        let x = || build::var("x", Type::Int);
        let ast = build::let_mut(
            "x",
            build::int(5),
            build::seq(vec![
                build::assertion(build::eq(build::pre_incr(x()), build::int(6))),
                build::assertion(build::eq(build::post_incr(x()), build::int(6))),
                build::assertion(build::eq(x(), build::int(7))),
                build::assertion(build::eq(build::post_decr(x()), build::int(7))),
                build::assertion(build::eq(build::pre_decr(x()), build::int(5))),
            ]),
        );
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn eager_boolean_operators_and_not() {
        let t = || build::boolean(true);
        let f = || build::boolean(false);
        let ast = build::seq(vec![
            build::assertion(build::binary(BinOp::And, t(), t())),
            build::assertion(build::unary(UnOp::Not, build::binary(BinOp::And, t(), f()))),
            build::assertion(build::binary(BinOp::Or, f(), t())),
            build::assertion(build::binary(BinOp::Xor, t(), f())),
            build::assertion(build::unary(UnOp::Not, build::binary(BinOp::Xor, t(), t()))),
            build::assertion(build::sc_or(t(), f())),
        ]);
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn compound_assignment_on_fields_and_elements() {
        let struct_ty = Type::Struct(vec![("n".to_string(), Type::Int)]);
        let arr_ty = Type::array(Type::Int);
        let ast = build::let_(
            "box_",
            build::struct_cons(vec![("n", build::int(10))]),
            build::let_(
                "arr",
                build::array(build::int(2), build::int(3)),
                build::seq(vec![
                    build::op_assign(
                        BinOp::Add,
                        build::field(build::var("box_", struct_ty.clone()), "n"),
                        build::int(5),
                    ),
                    build::op_assign(
                        BinOp::Mul,
                        build::array_elem(build::var("arr", arr_ty.clone()), build::int(1)),
                        build::int(4),
                    ),
                    build::assertion(build::eq(
                        build::field(build::var("box_", struct_ty), "n"),
                        build::int(15),
                    )),
                    build::assertion(build::eq(
                        build::array_elem(build::var("arr", arr_ty), build::int(1)),
                        build::int(12),
                    )),
                ]),
            ),
        );
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn reads_ints_from_the_host() {
        let ast = build::print(build::add(build::read_int(), build::read_int()));
        let outcome = exec_with(
            &ast,
            &CompileConfig::default(),
            &RunInput::with_ints(&[40, 2]),
        );
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.calls, vec![HostCall::WriteInt(42)]);
    }

    #[test]
    fn float_arithmetic_and_printing() {
        let ast = build::seq(vec![
            build::assertion(build::eq(
                build::unary(UnOp::Sqrt, build::float(4.0)),
                build::float(2.0),
            )),
            build::assertion(build::eq(
                build::binary(BinOp::Min, build::float(1.5), build::float(2.5)),
                build::float(1.5),
            )),
            build::print(build::binary(BinOp::Add, build::read_float(), build::float(1.0))),
        ]);
        let outcome = exec_with(
            &ast,
            &CompileConfig::default(),
            &RunInput::with_floats(&[0.5]),
        );
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.calls, vec![HostCall::WriteFloat(1.5)]);
    }

    #[test]
    fn integer_min_max_via_select() {
        let ast = build::seq(vec![
            build::assertion(build::eq(
                build::binary(BinOp::Min, build::int(3), build::int(5)),
                build::int(3),
            )),
            build::assertion(build::eq(
                build::binary(BinOp::Max, build::int(-3), build::int(5)),
                build::int(5),
            )),
        ]);
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn string_literals_reach_write_s() {
        let ast = build::seq(vec![
            build::print(build::string("hello ")),
            build::println(build::string("world")),
        ]);
        let outcome = exec(&ast);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(
            outcome.calls,
            vec![
                HostCall::WriteS("hello ".to_string()),
                HostCall::WriteS("world".to_string()),
            ]
        );
    }

    #[test]
    fn type_alias_is_transparent() {
        let ast = build::type_alias(
            "money",
            Type::Int,
            build::let_(
                "m",
                build::ascribe(Type::Var("money".to_string()), build::int(12)),
                build::assertion(build::eq(
                    build::var("m", Type::Var("money".to_string())),
                    build::int(12),
                )),
            ),
        );
        assert_eq!(exec(&ast).exit_code, 0);
    }

    #[test]
    fn styles_and_peephole_do_not_change_behaviour() {
        let ast = counters_program();
        let mut seen: Option<ExecOutcome> = None;
        for style in [WriteStyle::Linear, WriteStyle::Folded] {
            for peephole in [false, true] {
                let config = CompileConfig {
                    style,
                    peephole,
                    ..CompileConfig::default()
                };
                let outcome = exec_with(&ast, &config, &RunInput::new());
                if let Some(reference) = &seen {
                    assert_eq!(reference.exit_code, outcome.exit_code);
                    assert_eq!(reference.calls, outcome.calls);
                } else {
                    seen = Some(outcome);
                }
            }
        }
    }

    #[test]
    fn internal_allocator_behaves_like_the_import() {
        let ast = array_sum_program(0);
        let config = CompileConfig {
            alloc: AllocationStrategy::Internal,
            ..CompileConfig::default()
        };
        assert_eq!(exec_with(&ast, &config, &RunInput::new()).exit_code, 0);
    }

    #[test]
    fn run_report_is_serializable() {
        let wat_text = compile(
            &build::print(build::int(7)),
            &CompileConfig::default(),
        )
        .unwrap();
        let report = run_report_json(&wat_text, &RunInput::new());
        let value: serde_json::Value = serde_json::from_str(&report).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["exit_code"], 0);
    }
}
