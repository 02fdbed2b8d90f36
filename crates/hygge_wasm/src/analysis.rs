//! AST walks used by the lowering: free-variable sets for closure
//! conversion and capture checks for the boxing of mutable bindings.

use hygge_core::{Expr, TypedExpr};
use std::collections::BTreeSet;

/// Free variables of an expression, in name order. The order is part of the
/// closure-environment layout, so it must be deterministic.
pub(crate) fn free_vars(expr: &TypedExpr) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_free(expr, &mut out);
    out
}

fn collect_free(expr: &TypedExpr, out: &mut BTreeSet<String>) {
    match &expr.kind {
        Expr::Var(name) => {
            out.insert(name.clone());
        }
        Expr::Let {
            name, init, scope, ..
        } => {
            collect_free(init, out);
            let mut inner = BTreeSet::new();
            collect_free(scope, &mut inner);
            inner.remove(name);
            out.extend(inner);
        }
        Expr::LetRec { name, init, scope } => {
            let mut inner = BTreeSet::new();
            collect_free(init, &mut inner);
            collect_free(scope, &mut inner);
            inner.remove(name);
            out.extend(inner);
        }
        Expr::Lambda { params, body } => {
            let mut inner = BTreeSet::new();
            collect_free(body, &mut inner);
            for (name, _) in params {
                inner.remove(name);
            }
            out.extend(inner);
        }
        Expr::Match { scrutinee, cases } => {
            collect_free(scrutinee, out);
            for case in cases {
                let mut inner = BTreeSet::new();
                collect_free(&case.body, &mut inner);
                inner.remove(&case.var);
                out.extend(inner);
            }
        }
        _ => {
            for child in children(expr) {
                collect_free(child, out);
            }
        }
    }
}

/// True when some lambda inside `expr` has `name` among its free variables,
/// i.e. the binding escapes into a closure environment.
pub(crate) fn lambda_captures(name: &str, expr: &TypedExpr) -> bool {
    match &expr.kind {
        Expr::Lambda { .. } => free_vars(expr).contains(name),
        Expr::Let {
            name: bound,
            init,
            scope,
            ..
        } => {
            lambda_captures(name, init) || (bound != name && lambda_captures(name, scope))
        }
        Expr::LetRec {
            name: bound,
            init,
            scope,
        } => bound != name && (lambda_captures(name, init) || lambda_captures(name, scope)),
        Expr::Match { scrutinee, cases } => {
            lambda_captures(name, scrutinee)
                || cases
                    .iter()
                    .any(|case| case.var != name && lambda_captures(name, &case.body))
        }
        _ => children(expr).into_iter().any(|child| lambda_captures(name, child)),
    }
}

fn children(expr: &TypedExpr) -> Vec<&TypedExpr> {
    match &expr.kind {
        Expr::UnitVal
        | Expr::IntVal(_)
        | Expr::FloatVal(_)
        | Expr::BoolVal(_)
        | Expr::StringVal(_)
        | Expr::Var(_)
        | Expr::ReadInt
        | Expr::ReadFloat
        | Expr::Pointer(_) => Vec::new(),
        Expr::Binary { lhs, rhs, .. }
        | Expr::ScAnd { lhs, rhs }
        | Expr::ScOr { lhs, rhs } => vec![lhs, rhs],
        Expr::Unary { expr, .. }
        | Expr::Ascription(expr)
        | Expr::Assertion(expr)
        | Expr::Print(expr)
        | Expr::PrintLn(expr)
        | Expr::ArrayLength(expr)
        | Expr::PreIncr(expr)
        | Expr::PostIncr(expr)
        | Expr::PreDecr(expr)
        | Expr::PostDecr(expr) => vec![expr],
        Expr::Cond {
            cond,
            then_branch,
            else_branch,
        } => vec![cond, then_branch, else_branch],
        Expr::Seq(items) => items.iter().collect(),
        Expr::Let { init, scope, .. } | Expr::LetRec { init, scope, name: _ } => vec![init, scope],
        Expr::TypeAlias { scope, .. } => vec![scope],
        Expr::Lambda { body, .. } => vec![body],
        Expr::Application { callee, args } => {
            let mut out = vec![callee.as_ref()];
            out.extend(args.iter());
            out
        }
        Expr::StructCons(fields) => fields.iter().map(|(_, expr)| expr).collect(),
        Expr::FieldSelect { target, .. } => vec![target],
        Expr::ArrayCons { length, init } => vec![length, init],
        Expr::ArrayElem { target, index } => vec![target, index],
        Expr::ArraySlice { target, start, end } => vec![target, start, end],
        Expr::UnionCons { expr, .. } => vec![expr],
        Expr::Match { scrutinee, cases } => {
            let mut out = vec![scrutinee.as_ref()];
            out.extend(cases.iter().map(|case| &case.body));
            out
        }
        Expr::Assign { target, expr } => vec![target, expr],
        Expr::OpAssign { target, expr, .. } => vec![target, expr],
        Expr::While { cond, body } => vec![cond, body],
        Expr::DoWhile { body, cond } => vec![body, cond],
        Expr::For {
            init,
            cond,
            update,
            body,
        } => vec![init, cond, update, body],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hygge_core::build;
    use hygge_core::Type;

    #[test]
    fn free_vars_respect_binders() {
        // let x = 1; fn(d) -> x + y
        let body = build::add(build::var("x", Type::Int), build::var("y", Type::Int));
        let lam = build::lambda(vec![("d", Type::Int)], body);
        let expr = build::let_("x", build::int(1), lam);
        let fv = free_vars(&expr);
        assert!(fv.contains("y"));
        assert!(!fv.contains("x"));
        assert!(!fv.contains("d"));
    }

    #[test]
    fn lambda_captures_sees_through_nesting() {
        let inner = build::lambda(
            vec![("d", Type::Int)],
            build::add(build::var("c", Type::Int), build::var("d", Type::Int)),
        );
        let scope = build::let_("f", inner, build::unit());
        assert!(lambda_captures("c", &scope));
        assert!(!lambda_captures("d", &scope));
    }

    #[test]
    fn shadowing_stops_capture() {
        let lam = build::lambda(vec![("c", Type::Int)], build::var("c", Type::Int));
        let expr = build::let_("g", lam, build::unit());
        assert!(!lambda_captures("c", &expr));
    }
}
