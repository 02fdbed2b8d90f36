//! Shorthand constructors for typed AST nodes. The type checker uses these
//! when rebuilding nodes, and back-end test suites use them to write
//! programs directly in typed form.

use crate::ast::{BinOp, Expr, MatchCase, TypedExpr, UnOp};
use crate::types::Type;

pub fn unit() -> TypedExpr {
    TypedExpr::new(Expr::UnitVal, Type::Unit)
}

pub fn int(value: i32) -> TypedExpr {
    TypedExpr::new(Expr::IntVal(value), Type::Int)
}

pub fn float(value: f32) -> TypedExpr {
    TypedExpr::new(Expr::FloatVal(value), Type::Float)
}

pub fn boolean(value: bool) -> TypedExpr {
    TypedExpr::new(Expr::BoolVal(value), Type::Bool)
}

pub fn string(value: &str) -> TypedExpr {
    TypedExpr::new(Expr::StringVal(value.to_string()), Type::Str)
}

pub fn var(name: &str, ty: Type) -> TypedExpr {
    TypedExpr::new(Expr::Var(name.to_string()), ty)
}

pub fn binary(op: BinOp, lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    let ty = match op {
        BinOp::Eq | BinOp::Less | BinOp::LessEq | BinOp::Greater | BinOp::GreaterEq => Type::Bool,
        _ => lhs.ty.clone(),
    };
    TypedExpr::new(
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        ty,
    )
}

pub fn add(lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    binary(BinOp::Add, lhs, rhs)
}

pub fn sub(lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    binary(BinOp::Sub, lhs, rhs)
}

pub fn mul(lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    binary(BinOp::Mul, lhs, rhs)
}

pub fn eq(lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    binary(BinOp::Eq, lhs, rhs)
}

pub fn less(lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    binary(BinOp::Less, lhs, rhs)
}

pub fn unary(op: UnOp, expr: TypedExpr) -> TypedExpr {
    let ty = match op {
        UnOp::Not => Type::Bool,
        UnOp::Sqrt => Type::Float,
    };
    TypedExpr::new(
        Expr::Unary {
            op,
            expr: Box::new(expr),
        },
        ty,
    )
}

pub fn sc_and(lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    TypedExpr::new(
        Expr::ScAnd {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        Type::Bool,
    )
}

pub fn sc_or(lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
    TypedExpr::new(
        Expr::ScOr {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        Type::Bool,
    )
}

pub fn cond(cond: TypedExpr, then_branch: TypedExpr, else_branch: TypedExpr) -> TypedExpr {
    let ty = then_branch.ty.clone();
    TypedExpr::new(
        Expr::Cond {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        },
        ty,
    )
}

pub fn seq(items: Vec<TypedExpr>) -> TypedExpr {
    let ty = items.last().map(|last| last.ty.clone()).unwrap_or(Type::Unit);
    TypedExpr::new(Expr::Seq(items), ty)
}

pub fn ascribe(ty: Type, expr: TypedExpr) -> TypedExpr {
    TypedExpr::new(Expr::Ascription(Box::new(expr)), ty)
}

pub fn assertion(expr: TypedExpr) -> TypedExpr {
    TypedExpr::new(Expr::Assertion(Box::new(expr)), Type::Unit)
}

pub fn print(expr: TypedExpr) -> TypedExpr {
    TypedExpr::new(Expr::Print(Box::new(expr)), Type::Unit)
}

pub fn println(expr: TypedExpr) -> TypedExpr {
    TypedExpr::new(Expr::PrintLn(Box::new(expr)), Type::Unit)
}

pub fn read_int() -> TypedExpr {
    TypedExpr::new(Expr::ReadInt, Type::Int)
}

pub fn read_float() -> TypedExpr {
    TypedExpr::new(Expr::ReadFloat, Type::Float)
}

pub fn let_(name: &str, init: TypedExpr, scope: TypedExpr) -> TypedExpr {
    let ty = scope.ty.clone();
    TypedExpr::new(
        Expr::Let {
            name: name.to_string(),
            mutable: false,
            init: Box::new(init),
            scope: Box::new(scope),
        },
        ty,
    )
}

pub fn let_mut(name: &str, init: TypedExpr, scope: TypedExpr) -> TypedExpr {
    let ty = scope.ty.clone();
    TypedExpr::new(
        Expr::Let {
            name: name.to_string(),
            mutable: true,
            init: Box::new(init),
            scope: Box::new(scope),
        },
        ty,
    )
}

pub fn let_rec(name: &str, init: TypedExpr, scope: TypedExpr) -> TypedExpr {
    let ty = scope.ty.clone();
    TypedExpr::new(
        Expr::LetRec {
            name: name.to_string(),
            init: Box::new(init),
            scope: Box::new(scope),
        },
        ty,
    )
}

pub fn type_alias(name: &str, def: Type, scope: TypedExpr) -> TypedExpr {
    let ty = scope.ty.clone();
    TypedExpr::new(
        Expr::TypeAlias {
            name: name.to_string(),
            def,
            scope: Box::new(scope),
        },
        ty,
    )
}

pub fn lambda(params: Vec<(&str, Type)>, body: TypedExpr) -> TypedExpr {
    let args = params.iter().map(|(_, ty)| ty.clone()).collect();
    let ty = Type::fun(args, body.ty.clone());
    TypedExpr::new(
        Expr::Lambda {
            params: params
                .into_iter()
                .map(|(name, ty)| (name.to_string(), ty))
                .collect(),
            body: Box::new(body),
        },
        ty,
    )
}

pub fn apply(callee: TypedExpr, args: Vec<TypedExpr>) -> TypedExpr {
    let ty = match &callee.ty {
        Type::Fun { ret, .. } => ret.as_ref().clone(),
        other => other.clone(),
    };
    TypedExpr::new(
        Expr::Application {
            callee: Box::new(callee),
            args,
        },
        ty,
    )
}

pub fn struct_cons(fields: Vec<(&str, TypedExpr)>) -> TypedExpr {
    let ty = Type::Struct(
        fields
            .iter()
            .map(|(name, expr)| (name.to_string(), expr.ty.clone()))
            .collect(),
    );
    TypedExpr::new(
        Expr::StructCons(
            fields
                .into_iter()
                .map(|(name, expr)| (name.to_string(), expr))
                .collect(),
        ),
        ty,
    )
}

pub fn field(target: TypedExpr, name: &str) -> TypedExpr {
    let ty = match &target.ty {
        Type::Struct(fields) => fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, ty)| ty.clone())
            .unwrap_or(Type::Unit),
        _ => Type::Unit,
    };
    TypedExpr::new(
        Expr::FieldSelect {
            target: Box::new(target),
            field: name.to_string(),
        },
        ty,
    )
}

pub fn array(length: TypedExpr, init: TypedExpr) -> TypedExpr {
    let ty = Type::array(init.ty.clone());
    TypedExpr::new(
        Expr::ArrayCons {
            length: Box::new(length),
            init: Box::new(init),
        },
        ty,
    )
}

pub fn array_len(target: TypedExpr) -> TypedExpr {
    TypedExpr::new(Expr::ArrayLength(Box::new(target)), Type::Int)
}

pub fn array_elem(target: TypedExpr, index: TypedExpr) -> TypedExpr {
    let ty = match &target.ty {
        Type::Array(elem) => elem.as_ref().clone(),
        _ => Type::Unit,
    };
    TypedExpr::new(
        Expr::ArrayElem {
            target: Box::new(target),
            index: Box::new(index),
        },
        ty,
    )
}

pub fn array_slice(target: TypedExpr, start: TypedExpr, end: TypedExpr) -> TypedExpr {
    let ty = target.ty.clone();
    TypedExpr::new(
        Expr::ArraySlice {
            target: Box::new(target),
            start: Box::new(start),
            end: Box::new(end),
        },
        ty,
    )
}

pub fn union_cons(label: &str, expr: TypedExpr, union_ty: Type) -> TypedExpr {
    TypedExpr::new(
        Expr::UnionCons {
            label: label.to_string(),
            expr: Box::new(expr),
        },
        union_ty,
    )
}

pub fn match_(scrutinee: TypedExpr, cases: Vec<(&str, &str, TypedExpr)>) -> TypedExpr {
    let ty = cases
        .first()
        .map(|(_, _, body)| body.ty.clone())
        .unwrap_or(Type::Unit);
    TypedExpr::new(
        Expr::Match {
            scrutinee: Box::new(scrutinee),
            cases: cases
                .into_iter()
                .map(|(label, var, body)| MatchCase {
                    label: label.to_string(),
                    var: var.to_string(),
                    body,
                })
                .collect(),
        },
        ty,
    )
}

pub fn assign(target: TypedExpr, expr: TypedExpr) -> TypedExpr {
    let ty = expr.ty.clone();
    TypedExpr::new(
        Expr::Assign {
            target: Box::new(target),
            expr: Box::new(expr),
        },
        ty,
    )
}

pub fn op_assign(op: BinOp, target: TypedExpr, expr: TypedExpr) -> TypedExpr {
    let ty = target.ty.clone();
    TypedExpr::new(
        Expr::OpAssign {
            op,
            target: Box::new(target),
            expr: Box::new(expr),
        },
        ty,
    )
}

pub fn while_(cond: TypedExpr, body: TypedExpr) -> TypedExpr {
    TypedExpr::new(
        Expr::While {
            cond: Box::new(cond),
            body: Box::new(body),
        },
        Type::Unit,
    )
}

pub fn do_while(body: TypedExpr, cond: TypedExpr) -> TypedExpr {
    TypedExpr::new(
        Expr::DoWhile {
            body: Box::new(body),
            cond: Box::new(cond),
        },
        Type::Unit,
    )
}

pub fn for_(init: TypedExpr, cond: TypedExpr, update: TypedExpr, body: TypedExpr) -> TypedExpr {
    TypedExpr::new(
        Expr::For {
            init: Box::new(init),
            cond: Box::new(cond),
            update: Box::new(update),
            body: Box::new(body),
        },
        Type::Unit,
    )
}

pub fn pre_incr(target: TypedExpr) -> TypedExpr {
    let ty = target.ty.clone();
    TypedExpr::new(Expr::PreIncr(Box::new(target)), ty)
}

pub fn post_incr(target: TypedExpr) -> TypedExpr {
    let ty = target.ty.clone();
    TypedExpr::new(Expr::PostIncr(Box::new(target)), ty)
}

pub fn pre_decr(target: TypedExpr) -> TypedExpr {
    let ty = target.ty.clone();
    TypedExpr::new(Expr::PreDecr(Box::new(target)), ty)
}

pub fn post_decr(target: TypedExpr) -> TypedExpr {
    let ty = target.ty.clone();
    TypedExpr::new(Expr::PostDecr(Box::new(target)), ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lambda_builder_derives_the_function_type() {
        let lam = lambda(vec![("n", Type::Int)], add(var("n", Type::Int), int(1)));
        assert_eq!(lam.ty, Type::fun(vec![Type::Int], Type::Int));
    }

    #[test]
    fn seq_takes_the_type_of_its_last_element() {
        assert_eq!(seq(vec![int(1), unit()]).ty, Type::Unit);
        assert_eq!(seq(vec![unit(), int(1)]).ty, Type::Int);
        assert_eq!(seq(Vec::new()).ty, Type::Unit);
    }

    #[test]
    fn field_builder_resolves_the_field_type() {
        let value = struct_cons(vec![("x", int(1)), ("f", float(2.0))]);
        assert_eq!(field(value, "f").ty, Type::Float);
    }
}
