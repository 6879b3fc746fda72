//! Vigil expression evaluator.
//!
//! Expressions come from human-authored verification scenarios, so they run
//! against a closed [`EvalContext`] only: declared objects, their resolved
//! identities, the ambient namespace, run parameters and a fixed allowlist
//! of helper builtins. No process, filesystem or network access exists in
//! the grammar.
//!
//! Two evaluation modes mirror how callers use the results:
//! [`evaluate`] never fails (any error becomes [`Value::Absent`]), which is
//! what polling assertions want; [`try_evaluate`] and [`render_template`]
//! propagate errors, which is what resolving a declaration's own name wants.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde_json::Value as Json;
use vigil_core::util::{find_condition, find_condition_true, has_finalizer, make_id};
use vigil_core::DeclInfo;

mod parse;

pub use parse::{BinOp, Expr, Segment};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown identifier {0:?}")]
    UnknownIdent(String),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("type error: {0}")]
    Type(String),
}

/// Result of an evaluation. `Absent` is the explicit "no value" marker the
/// soft mode collapses every failure into.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Absent,
    Json(Json),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Absent => false,
            Value::Json(j) => match j {
                Json::Null => false,
                Json::Bool(b) => *b,
                Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                Json::String(s) => !s.is_empty(),
                Json::Array(_) | Json::Object(_) => true,
            },
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    fn nullish(&self) -> bool {
        matches!(self, Value::Absent | Value::Json(Json::Null))
    }

    /// Interpolated form for template rendering.
    fn render(&self) -> Result<String, ExprError> {
        match self {
            Value::Absent => Err(ExprError::Type("placeholder produced no value".into())),
            Value::Json(Json::String(s)) => Ok(s.clone()),
            Value::Json(Json::Number(n)) => Ok(n.to_string()),
            Value::Json(Json::Bool(b)) => Ok(b.to_string()),
            Value::Json(Json::Null) => Ok("null".into()),
            Value::Json(other) => Ok(other.to_string()),
        }
    }
}

/// Immutable-per-evaluation snapshot the evaluator resolves names against.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    objects: BTreeMap<String, Option<Json>>,
    decls: BTreeMap<String, DeclInfo>,
    namespace: String,
    params: BTreeMap<String, Json>,
}

impl EvalContext {
    pub fn new(namespace: &str) -> Self {
        Self { namespace: namespace.to_string(), ..Self::default() }
    }

    pub fn with_param(mut self, key: &str, value: Json) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn insert_decl(&mut self, alias: &str, info: DeclInfo, obj: Option<Json>) {
        self.decls.insert(alias.to_string(), info);
        self.objects.insert(alias.to_string(), obj);
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.objects.contains_key(alias)
    }

    /// Observed object for an alias, if any.
    pub fn object(&self, alias: &str) -> Option<&Json> {
        self.objects.get(alias).and_then(|o| o.as_ref())
    }
}

/// Evaluate in soft mode: any failure collapses to [`Value::Absent`].
pub fn evaluate(src: &str, ctx: &EvalContext) -> Value {
    try_evaluate(src, ctx).unwrap_or(Value::Absent)
}

/// Evaluate in hard mode, propagating parse and evaluation errors.
pub fn try_evaluate(src: &str, ctx: &EvalContext) -> Result<Value, ExprError> {
    let ast = parse::parse(src)?;
    eval(&ast, ctx)
}

/// Resolve a name/namespace template. A backtick-wrapped string is a
/// template literal with `${expr}` placeholders; anything else is returned
/// verbatim.
pub fn render_template(src: &str, ctx: &EvalContext) -> Result<String, ExprError> {
    let inner = match src.strip_prefix('`').and_then(|s| s.strip_suffix('`')) {
        Some(inner) if src.len() >= 2 => inner,
        _ => return Ok(src.to_string()),
    };
    let mut out = String::new();
    for seg in parse::parse_template(inner)? {
        match seg {
            Segment::Text(t) => out.push_str(&t),
            Segment::Expr(e) => out.push_str(&eval(&e, ctx)?.render()?),
        }
    }
    Ok(out)
}

fn eval(e: &Expr, ctx: &EvalContext) -> Result<Value, ExprError> {
    match e {
        Expr::Str(s) => Ok(Value::Json(Json::String(s.clone()))),
        Expr::Num(n) => Ok(Value::Json(
            serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
        )),
        Expr::Bool(b) => Ok(Value::Json(Json::Bool(*b))),
        Expr::Null => Ok(Value::Json(Json::Null)),
        Expr::Ident(name) => lookup_ident(name, ctx),
        Expr::Field(base, field) => match eval(base, ctx)? {
            Value::Absent => Err(ExprError::Type(format!(
                "cannot read field {field:?} of absent value"
            ))),
            Value::Json(j) => Ok(j
                .get(field.as_str())
                .map(|v| Value::Json(v.clone()))
                .unwrap_or(Value::Absent)),
        },
        Expr::Index(base, idx) => {
            let base = eval(base, ctx)?;
            let idx = eval(idx, ctx)?;
            index_value(base, idx)
        }
        Expr::Call(name, args) => {
            let mut vals = Vec::with_capacity(args.len());
            for a in args {
                vals.push(eval(a, ctx)?);
            }
            call_builtin(name, vals, ctx)
        }
        Expr::Not(inner) => Ok(Value::Json(Json::Bool(!eval(inner, ctx)?.truthy()))),
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx),
    }
}

fn lookup_ident(name: &str, ctx: &EvalContext) -> Result<Value, ExprError> {
    // The ambient namespace shadows a same-named alias.
    if name == "namespace" {
        return Ok(Value::Json(Json::String(ctx.namespace.clone())));
    }
    if let Some(obj) = ctx.objects.get(name) {
        return Ok(match obj {
            Some(j) => Value::Json(j.clone()),
            None => Value::Absent,
        });
    }
    if let Some(p) = ctx.params.get(name) {
        return Ok(Value::Json(p.clone()));
    }
    Err(ExprError::UnknownIdent(name.to_string()))
}

fn index_value(base: Value, idx: Value) -> Result<Value, ExprError> {
    let Value::Json(base) = base else {
        return Err(ExprError::Type("cannot index absent value".into()));
    };
    match (&base, idx) {
        (Json::Array(items), Value::Json(Json::Number(n))) => {
            let i = n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as usize)
                .ok_or_else(|| ExprError::Type("array index must be a whole number".into()))?;
            Ok(items
                .get(i)
                .map(|v| Value::Json(v.clone()))
                .unwrap_or(Value::Absent))
        }
        (Json::Object(map), Value::Json(Json::String(key))) => Ok(map
            .get(&key)
            .map(|v| Value::Json(v.clone()))
            .unwrap_or(Value::Absent)),
        _ => Err(ExprError::Type(
            "indexing needs an array with a number or an object with a string".into(),
        )),
    }
}

fn call_builtin(name: &str, args: Vec<Value>, ctx: &EvalContext) -> Result<Value, ExprError> {
    let arity = |want: &str| ExprError::Type(format!("{name}() expects {want}"));
    match name {
        "id" => {
            let len = match args.as_slice() {
                [] => None,
                [Value::Json(Json::Number(n))] => n.as_f64().map(|f| f as usize),
                _ => return Err(arity("an optional length")),
            };
            Ok(Value::Json(Json::String(make_id(len))))
        }
        "findCondition" | "findConditionTrue" => {
            let (obj, cond_type) = match args.as_slice() {
                [obj, Value::Json(Json::String(t))] => (obj, t.clone()),
                _ => return Err(arity("(object, conditionType)")),
            };
            let Value::Json(obj) = obj else {
                return Ok(Value::Absent);
            };
            let found = if name == "findCondition" {
                find_condition(obj, &cond_type)
            } else {
                find_condition_true(obj, &cond_type)
            };
            Ok(found.map(|c| Value::Json(c.clone())).unwrap_or(Value::Absent))
        }
        "hasFinalizer" => {
            let (obj, fin) = match args.as_slice() {
                [obj] => (obj, None),
                [obj, Value::Json(Json::String(f))] => (obj, Some(f.clone())),
                _ => return Err(arity("(object, optional finalizer)")),
            };
            let Value::Json(obj) = obj else {
                return Ok(Value::Json(Json::Bool(false)));
            };
            Ok(Value::Json(Json::Bool(has_finalizer(obj, fin.as_deref()))))
        }
        "decl" => {
            let alias = match args.as_slice() {
                [Value::Json(Json::String(a))] => a.clone(),
                _ => return Err(arity("an alias string")),
            };
            let info = ctx
                .decls
                .get(&alias)
                .ok_or(ExprError::UnknownIdent(alias))?;
            let json = serde_json::to_value(info)
                .map_err(|e| ExprError::Type(format!("decl() serialization: {e}")))?;
            Ok(Value::Json(json))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, ctx: &EvalContext) -> Result<Value, ExprError> {
    // && and || short-circuit on truthiness.
    match op {
        BinOp::And => {
            let l = eval(lhs, ctx)?;
            if !l.truthy() {
                return Ok(Value::Json(Json::Bool(false)));
            }
            return Ok(Value::Json(Json::Bool(eval(rhs, ctx)?.truthy())));
        }
        BinOp::Or => {
            let l = eval(lhs, ctx)?;
            if l.truthy() {
                return Ok(Value::Json(Json::Bool(true)));
            }
            return Ok(Value::Json(Json::Bool(eval(rhs, ctx)?.truthy())));
        }
        _ => {}
    }
    let l = eval(lhs, ctx)?;
    let r = eval(rhs, ctx)?;
    let b = match op {
        BinOp::Eq => values_equal(&l, &r),
        BinOp::Ne => !values_equal(&l, &r),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(&l, &r)?;
            match op {
                BinOp::Lt => ord == std::cmp::Ordering::Less,
                BinOp::Le => ord != std::cmp::Ordering::Greater,
                BinOp::Gt => ord == std::cmp::Ordering::Greater,
                BinOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            }
        }
        BinOp::And | BinOp::Or => unreachable!(),
    };
    Ok(Value::Json(Json::Bool(b)))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    // Absent and null compare equal to each other and to nothing else,
    // keeping `findCondition(x, 'T') == null` meaningful.
    if l.nullish() || r.nullish() {
        return l.nullish() && r.nullish();
    }
    match (l, r) {
        (Value::Json(Json::Number(a)), Value::Json(Json::Number(b))) => {
            a.as_f64() == b.as_f64()
        }
        (Value::Json(a), Value::Json(b)) => a == b,
        _ => false,
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (l, r) {
        (Value::Json(Json::Number(a)), Value::Json(Json::Number(b))) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or_else(|| ExprError::Type("numbers are not comparable".into())),
                _ => Err(ExprError::Type("numbers are not comparable".into())),
            }
        }
        (Value::Json(Json::String(a)), Value::Json(Json::String(b))) => Ok(a.cmp(b)),
        _ => Err(ExprError::Type(
            "relational operators need two numbers or two strings".into(),
        )),
    }
}
