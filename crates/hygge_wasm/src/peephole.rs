//! Rule-based peephole pass over the emitted instruction streams. Rules are
//! applied to every function body, recursing into nested blocks, until a
//! fixed point; each rule either shrinks the stream or removes an `if`, so
//! the fixed point exists. Observable behaviour (exit code, host calls) is
//! preserved.

use crate::ir::{Instr, Module, Op};

pub fn optimize(module: &mut Module) {
    for function in &mut module.functions {
        while pass(&mut function.body) {}
    }
}

fn pass(instrs: &mut Vec<Instr>) -> bool {
    let mut changed = false;

    for instr in instrs.iter_mut() {
        match &mut instr.op {
            Op::Block { body, .. } | Op::Loop { body, .. } => changed |= pass(body),
            Op::If {
                then_body,
                else_body,
                ..
            } => {
                changed |= pass(then_body);
                changed |= pass(else_body);
            }
            _ => {}
        }
    }

    // Everything after an unconditional exit in the same block is dead.
    if let Some(pos) = instrs.iter().position(|instr| is_terminator(&instr.op)) {
        if pos + 1 < instrs.len() {
            instrs.truncate(pos + 1);
            changed = true;
        }
    }

    let mut i = 0;
    while i < instrs.len() {
        if i + 1 < instrs.len() {
            // constant condition decides the branch at compile time
            if let (
                Op::I32Const(value),
                Op::If {
                    then_body,
                    else_body,
                    ..
                },
            ) = (&instrs[i].op, &instrs[i + 1].op)
            {
                let branch = if *value != 0 {
                    then_body.clone()
                } else {
                    else_body.clone()
                };
                instrs.splice(i..i + 2, branch);
                changed = true;
                continue;
            }

            if matches!(instrs[i + 1].op, Op::Drop) {
                // a pure push feeding a drop cancels out
                if is_pure_push(&instrs[i].op) {
                    instrs.drain(i..i + 2);
                    changed = true;
                    i = i.saturating_sub(1);
                    continue;
                }
                if let Op::LocalTee(local) = &instrs[i].op {
                    let op = Op::LocalSet(local.clone());
                    let comment = instrs[i].comment.take();
                    instrs[i] = Instr { op, comment };
                    instrs.remove(i + 1);
                    changed = true;
                    continue;
                }
                // a pure operator feeding a drop becomes drops of its
                // operands, exposing further push/drop pairs
                if let Some(pops) = pure_op_pops(&instrs[i].op) {
                    let drops: Vec<Instr> = (0..pops).map(|_| Instr::new(Op::Drop)).collect();
                    instrs.splice(i..i + 2, drops);
                    changed = true;
                    i = i.saturating_sub(1);
                    continue;
                }
            }

            if let (Op::LocalSet(a), Op::LocalGet(b)) = (&instrs[i].op, &instrs[i + 1].op) {
                if a == b {
                    let op = Op::LocalTee(a.clone());
                    let comment = instrs[i].comment.take();
                    instrs[i] = Instr { op, comment };
                    instrs.remove(i + 1);
                    changed = true;
                    continue;
                }
            }
        }
        i += 1;
    }

    changed
}

fn is_terminator(op: &Op) -> bool {
    matches!(op, Op::Return | Op::Br(_) | Op::Unreachable)
}

fn is_pure_push(op: &Op) -> bool {
    matches!(
        op,
        Op::I32Const(_) | Op::F32Const(_) | Op::LocalGet(_) | Op::GlobalGet(_)
    )
}

/// Operand count for operators that neither trap nor touch state. Division
/// and remainder trap on zero, loads trap out of bounds; both stay put.
fn pure_op_pops(op: &Op) -> Option<usize> {
    match op {
        Op::I32Eqz
        | Op::F32Sqrt
        | Op::F32Trunc
        | Op::F32ConvertI32S
        | Op::I32TruncF32S
        | Op::I32ReinterpretF32
        | Op::F32ReinterpretI32 => Some(1),
        Op::I32Eq
        | Op::I32Ne
        | Op::I32LtS
        | Op::I32LeS
        | Op::I32GtS
        | Op::I32GeS
        | Op::I32Add
        | Op::I32Sub
        | Op::I32Mul
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
        | Op::F32Max => Some(2),
        Op::Select => Some(3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{LocalRef, ValType};

    fn run(mut body: Vec<Instr>) -> Vec<Op> {
        while pass(&mut body) {}
        body.into_iter().map(|instr| instr.op).collect()
    }

    fn get(name: &str) -> Instr {
        Instr::new(Op::LocalGet(LocalRef::name(name)))
    }

    fn set(name: &str) -> Instr {
        Instr::new(Op::LocalSet(LocalRef::name(name)))
    }

    #[test]
    fn pure_push_then_drop_vanishes() {
        let out = run(vec![Instr::new(Op::I32Const(5)), Instr::new(Op::Drop)]);
        assert!(out.is_empty());
    }

    #[test]
    fn impure_push_then_drop_stays() {
        let out = run(vec![
            Instr::new(Op::Call("readInt".to_string())),
            Instr::new(Op::Drop),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn set_then_get_collapses_to_tee() {
        let out = run(vec![set("x"), get("x")]);
        assert_eq!(out, vec![Op::LocalTee(LocalRef::name("x"))]);
    }

    #[test]
    fn set_then_get_of_other_local_is_kept() {
        let out = run(vec![set("x"), get("y")]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn tee_then_drop_becomes_set() {
        let out = run(vec![
            Instr::new(Op::I32Const(1)),
            Instr::new(Op::LocalTee(LocalRef::name("x"))),
            Instr::new(Op::Drop),
        ]);
        assert_eq!(
            out,
            vec![Op::I32Const(1), Op::LocalSet(LocalRef::name("x"))]
        );
    }

    #[test]
    fn code_after_return_is_removed() {
        let out = run(vec![
            Instr::new(Op::I32Const(0)),
            Instr::new(Op::Return),
            Instr::new(Op::I32Const(9)),
            Instr::new(Op::Drop),
        ]);
        assert_eq!(out, vec![Op::I32Const(0), Op::Return]);
    }

    #[test]
    fn constant_condition_selects_a_branch() {
        let body = vec![
            Instr::new(Op::I32Const(0)),
            Instr::new(Op::If {
                results: vec![ValType::I32],
                then_body: vec![Instr::new(Op::I32Const(1))],
                else_body: vec![Instr::new(Op::I32Const(2))],
            }),
        ];
        assert_eq!(run(body), vec![Op::I32Const(2)]);

        let body = vec![
            Instr::new(Op::I32Const(7)),
            Instr::new(Op::If {
                results: vec![ValType::I32],
                then_body: vec![Instr::new(Op::I32Const(1))],
                else_body: vec![Instr::new(Op::I32Const(2))],
            }),
        ];
        assert_eq!(run(body), vec![Op::I32Const(1)]);
    }

    #[test]
    fn pure_operator_commutes_with_drop() {
        let out = run(vec![
            Instr::new(Op::I32Const(1)),
            Instr::new(Op::I32Const(2)),
            Instr::new(Op::I32Add),
            Instr::new(Op::Drop),
        ]);
        assert!(out.is_empty());
    }

    #[test]
    fn trapping_operator_does_not_commute_with_drop() {
        let out = run(vec![
            Instr::new(Op::I32Const(1)),
            Instr::new(Op::I32Const(0)),
            Instr::new(Op::I32DivS),
            Instr::new(Op::Drop),
        ]);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn rules_reach_into_nested_blocks() {
        let body = vec![Instr::new(Op::Block {
            label: "b".to_string(),
            results: vec![],
            body: vec![
                Instr::new(Op::I32Const(3)),
                Instr::new(Op::Drop),
                Instr::new(Op::Br("b".to_string())),
                Instr::new(Op::Nop),
            ],
        })];
        let out = run(body);
        match &out[0] {
            Op::Block { body, .. } => {
                assert_eq!(body.len(), 1);
                assert!(matches!(body[0].op, Op::Br(_)));
            }
            other => panic!("expected block, got {other:?}"),
        }
    }
}
