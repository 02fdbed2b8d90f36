use std::collections::HashMap;
use std::rc::Rc;

/// Resolved Hygge types. `Int` and `Float` are 32-bit; `Bool` is 0/1 in 32
/// bits; `Str` is a pointer+length record; `Unit` carries no value.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Unit,
    Bool,
    Int,
    Float,
    Str,
    /// A type variable, resolved through the alias table of the environment.
    Var(String),
    Fun { args: Vec<Type>, ret: Box<Type> },
    Struct(Vec<(String, Type)>),
    Array(Box<Type>),
    Union(Vec<(String, Type)>),
}

impl Type {
    pub fn fun(args: Vec<Type>, ret: Type) -> Type {
        Type::Fun {
            args,
            ret: Box::new(ret),
        }
    }

    pub fn array(elem: Type) -> Type {
        Type::Array(Box::new(elem))
    }
}

#[derive(Debug, Default)]
struct EnvData {
    vars: HashMap<String, Type>,
    aliases: HashMap<String, Type>,
}

/// Typing environment attached to every AST node. Cheap to clone; extension
/// produces a new environment so sibling nodes keep their own views.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    data: Rc<EnvData>,
}

impl TypeEnv {
    pub fn new() -> TypeEnv {
        TypeEnv::default()
    }

    pub fn with_var(&self, name: &str, ty: Type) -> TypeEnv {
        let mut data = self.clone_data();
        data.vars.insert(name.to_string(), ty);
        TypeEnv { data: Rc::new(data) }
    }

    pub fn with_alias(&self, name: &str, ty: Type) -> TypeEnv {
        let mut data = self.clone_data();
        data.aliases.insert(name.to_string(), ty);
        TypeEnv { data: Rc::new(data) }
    }

    pub fn var(&self, name: &str) -> Option<&Type> {
        self.data.vars.get(name)
    }

    pub fn alias(&self, name: &str) -> Option<&Type> {
        self.data.aliases.get(name)
    }

    /// Resolves `Var` references through the alias table. Unknown aliases
    /// stay as they are; alias cycles stop after the table is exhausted.
    pub fn expand(&self, ty: &Type) -> Type {
        let mut current = ty.clone();
        let mut budget = self.data.aliases.len() + 1;
        while let Type::Var(name) = &current {
            if budget == 0 {
                break;
            }
            budget -= 1;
            match self.data.aliases.get(name) {
                Some(def) => current = def.clone(),
                None => break,
            }
        }
        current
    }

    fn clone_data(&self) -> EnvData {
        EnvData {
            vars: self.data.vars.clone(),
            aliases: self.data.aliases.clone(),
        }
    }
}

/// Subtyping over the Hygge lattice: reflexive after alias expansion,
/// struct width/depth subtyping, union width subtyping (fewer labels on the
/// left), functions contravariant in arguments and covariant in the result.
pub fn is_subtype_of(env: &TypeEnv, t: &Type, u: &Type) -> bool {
    let t = env.expand(t);
    let u = env.expand(u);
    if t == u {
        return true;
    }
    match (&t, &u) {
        (Type::Struct(fields_t), Type::Struct(fields_u)) => {
            fields_u.iter().all(|(name_u, ty_u)| {
                fields_t
                    .iter()
                    .find(|(name_t, _)| name_t == name_u)
                    .is_some_and(|(_, ty_t)| is_subtype_of(env, ty_t, ty_u))
            })
        }
        (Type::Union(labels_t), Type::Union(labels_u)) => {
            labels_t.iter().all(|(label_t, ty_t)| {
                labels_u
                    .iter()
                    .find(|(label_u, _)| label_u == label_t)
                    .is_some_and(|(_, ty_u)| is_subtype_of(env, ty_t, ty_u))
            })
        }
        (Type::Array(elem_t), Type::Array(elem_u)) => {
            // Arrays are mutable, so element types must match exactly.
            env.expand(elem_t) == env.expand(elem_u)
        }
        (
            Type::Fun {
                args: args_t,
                ret: ret_t,
            },
            Type::Fun {
                args: args_u,
                ret: ret_u,
            },
        ) => {
            args_t.len() == args_u.len()
                && args_u
                    .iter()
                    .zip(args_t.iter())
                    .all(|(arg_u, arg_t)| is_subtype_of(env, arg_u, arg_t))
                && is_subtype_of(env, ret_t, ret_u)
        }
        _ => false,
    }
}
