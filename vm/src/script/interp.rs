//! Async tree-walking evaluation of guest methods.
//!
//! Every `system.*` invocation is a cooperative suspension point; between
//! suspensions of the same call nothing else runs on the VM, which is what
//! makes the caller slot race-free. Recursion is boxed because expressions
//! nest and guest methods may call each other.

use std::collections::HashMap;

use futures::future::BoxFuture;

use hindsight_types::Value;

use super::ast::{BinOp, Block, Expr, MethodDef, Script, Stmt, UnOp};
use super::ScriptError;
use crate::sandbox::SystemSurface;

/// Guest methods may call each other; deeper than this is assumed runaway.
const MAX_CALL_DEPTH: usize = 64;

/// Shared evaluation context for one top-level call.
pub(crate) struct CallCtx<'s> {
    /// The parsed script.
    pub script: &'s Script,
    /// The curated host surface.
    pub surface: &'s SystemSurface,
}

struct Frame<'s> {
    ctx: &'s CallCtx<'s>,
    locals: HashMap<String, Value>,
    depth: usize,
}

enum Flow {
    Normal(Value),
    Return(Value),
}

impl Flow {
    fn into_value(self) -> Value {
        match self {
            Flow::Normal(value) | Flow::Return(value) => value,
        }
    }
}

fn runtime(message: impl Into<String>) -> ScriptError {
    ScriptError::Runtime(message.into())
}

/// Invoke one exported method with positional arguments.
///
/// Missing arguments take the parameter default (or null); extra
/// arguments are ignored.
pub(crate) fn invoke_method<'s>(
    ctx: &'s CallCtx<'s>,
    method: &'s MethodDef,
    args: Vec<Value>,
    depth: usize,
) -> BoxFuture<'s, Result<Value, ScriptError>> {
    Box::pin(async move {
        if depth > MAX_CALL_DEPTH {
            return Err(runtime(format!(
                "call depth exceeded invoking `{}`",
                method.name
            )));
        }
        let mut locals = HashMap::new();
        let mut supplied = args.into_iter();
        for param in &method.params {
            let value = match supplied.next() {
                Some(value) if !value.is_null() => value,
                _ => param.default.clone().unwrap_or(Value::Null),
            };
            locals.insert(param.name.clone(), value);
        }
        let mut frame = Frame {
            ctx,
            locals,
            depth,
        };
        let flow = exec_block(&mut frame, &method.body).await?;
        Ok(flow.into_value())
    })
}

fn exec_block<'a, 's: 'a>(
    frame: &'a mut Frame<'s>,
    block: &'s Block,
) -> BoxFuture<'a, Result<Flow, ScriptError>> {
    Box::pin(async move {
        let mut last = Value::Null;
        for stmt in &block.0 {
            match exec_stmt(frame, stmt).await? {
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal(value) => last = value,
            }
        }
        Ok(Flow::Normal(last))
    })
}

fn exec_stmt<'a, 's: 'a>(
    frame: &'a mut Frame<'s>,
    stmt: &'s Stmt,
) -> BoxFuture<'a, Result<Flow, ScriptError>> {
    Box::pin(async move {
        match stmt {
            Stmt::Let(name, expr) => {
                let value = eval(frame, expr).await?;
                frame.locals.insert(name.clone(), value);
                Ok(Flow::Normal(Value::Null))
            }
            Stmt::Assign(name, expr) => {
                if !frame.locals.contains_key(name) {
                    return Err(runtime(format!("assignment to undeclared `{name}`")));
                }
                let value = eval(frame, expr).await?;
                frame.locals.insert(name.clone(), value);
                Ok(Flow::Normal(Value::Null))
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => eval(frame, expr).await?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                if eval(frame, cond).await?.is_truthy() {
                    exec_block(frame, then_block).await
                } else if let Some(else_block) = else_block {
                    exec_block(frame, else_block).await
                } else {
                    Ok(Flow::Normal(Value::Null))
                }
            }
            Stmt::While { cond, body } => {
                while eval(frame, cond).await?.is_truthy() {
                    if let Flow::Return(value) = exec_block(frame, body).await? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal(Value::Null))
            }
            Stmt::Expr(expr) => Ok(Flow::Normal(eval(frame, expr).await?)),
        }
    })
}

fn eval<'a, 's: 'a>(
    frame: &'a mut Frame<'s>,
    expr: &'s Expr,
) -> BoxFuture<'a, Result<Value, ScriptError>> {
    Box::pin(async move {
        match expr {
            Expr::Lit(value) => Ok(value.clone()),
            Expr::Var(name) => {
                if name == "system" {
                    return Err(runtime("`system` is not a value"));
                }
                frame
                    .locals
                    .get(name)
                    .cloned()
                    .ok_or_else(|| runtime(format!("unknown variable `{name}`")))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(eval(frame, item).await?);
                }
                Ok(Value::Array(out))
            }
            Expr::Object(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (key, value) in fields {
                    out.push((key.clone(), eval(frame, value).await?));
                }
                Ok(Value::object(out))
            }
            Expr::Unary(op, operand) => {
                let value = eval(frame, operand).await?;
                apply_unary(*op, value)
            }
            Expr::Binary(op, lhs, rhs) => {
                // Short-circuit the logical operators.
                match op {
                    BinOp::And => {
                        let lhs = eval(frame, lhs).await?;
                        if !lhs.is_truthy() {
                            return Ok(Value::Bool(false));
                        }
                        let rhs = eval(frame, rhs).await?;
                        Ok(Value::Bool(rhs.is_truthy()))
                    }
                    BinOp::Or => {
                        let lhs = eval(frame, lhs).await?;
                        if lhs.is_truthy() {
                            return Ok(Value::Bool(true));
                        }
                        let rhs = eval(frame, rhs).await?;
                        Ok(Value::Bool(rhs.is_truthy()))
                    }
                    _ => {
                        let lhs = eval(frame, lhs).await?;
                        let rhs = eval(frame, rhs).await?;
                        apply_binary(*op, lhs, rhs)
                    }
                }
            }
            Expr::Field(base, field) => eval_field(frame, base, field).await,
            Expr::Index(base, index) => {
                let base = eval(frame, base).await?;
                let index = eval(frame, index).await?;
                eval_index(&base, &index)
            }
            Expr::Call(callee, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(eval(frame, arg).await?);
                }
                eval_call(frame, callee, values).await
            }
        }
    })
}

async fn eval_field<'s>(
    frame: &mut Frame<'s>,
    base: &'s Expr,
    field: &'s str,
) -> Result<Value, ScriptError> {
    // `system.caller.id` reads the caller context slot.
    if let Expr::Field(root, ns) = base {
        if matches!(root.as_ref(), Expr::Var(v) if v == "system") && ns == "caller" {
            if field == "id" {
                return Ok(Value::Str(frame.ctx.surface.caller_id()));
            }
            return Err(runtime(format!("caller has no property `{field}`")));
        }
    }
    if matches!(base, Expr::Var(v) if v == "system") {
        return Err(runtime(format!("`system.{field}` is not a value")));
    }
    let value = eval(frame, base).await?;
    match value {
        Value::Object(map) => Ok(map.get(field).cloned().unwrap_or(Value::Null)),
        other => Err(runtime(format!(
            "cannot read property `{field}` of {}",
            type_name(&other)
        ))),
    }
}

fn eval_index(base: &Value, index: &Value) -> Result<Value, ScriptError> {
    match (base, index) {
        (Value::Array(items), Value::Int(i)) => {
            let i = usize::try_from(*i)
                .map_err(|_| runtime(format!("negative index {i}")))?;
            Ok(items.get(i).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::Str(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (base, index) => Err(runtime(format!(
            "cannot index {} with {}",
            type_name(base),
            type_name(index)
        ))),
    }
}

async fn eval_call<'s>(
    frame: &mut Frame<'s>,
    callee: &'s Expr,
    args: Vec<Value>,
) -> Result<Value, ScriptError> {
    match callee {
        Expr::Var(name) => {
            if let Some(value) = call_builtin(name, &args)? {
                return Ok(value);
            }
            let method = frame
                .ctx
                .script
                .method(name)
                .ok_or_else(|| runtime(format!("unknown function `{name}`")))?;
            invoke_method(frame.ctx, method, args, frame.depth + 1).await
        }
        Expr::Field(base, method) => {
            match base.as_ref() {
                // `system.sleep(..)` / `system.log(..)`
                Expr::Var(root) if root == "system" => {
                    call_system_builtin(frame.ctx.surface, method, args).await
                }
                // `system.<namespace>.<method>(..)`
                Expr::Field(root, ns)
                    if matches!(root.as_ref(), Expr::Var(v) if v == "system") =>
                {
                    frame.ctx.surface.invoke(ns, method, args).await
                }
                _ => Err(runtime(format!("`{method}` is not callable here"))),
            }
        }
        _ => Err(runtime("expression is not callable")),
    }
}

async fn call_system_builtin(
    surface: &SystemSurface,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, ScriptError> {
    match method {
        "sleep" => {
            let millis = match args.first() {
                Some(Value::Int(n)) if *n >= 0 => *n as u64,
                Some(Value::Float(f)) if *f >= 0.0 => *f as u64,
                other => {
                    return Err(runtime(format!(
                        "sleep expects a non-negative duration, got {other:?}"
                    )))
                }
            };
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
            Ok(Value::Null)
        }
        "log" => {
            surface.console_log(&args);
            Ok(Value::Null)
        }
        other => Err(runtime(format!("unknown system function `{other}`"))),
    }
}

/// Pure builtin functions. Returns `Ok(None)` for names that are not
/// builtins so script methods can shadow nothing.
fn call_builtin(name: &str, args: &[Value]) -> Result<Option<Value>, ScriptError> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    let value = match name {
        "str" => Value::Str(arg(0).to_string()),
        "len" => {
            let n = match arg(0) {
                Value::Str(s) => s.chars().count(),
                Value::Bytes(b) => b.len(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(runtime(format!("len of {}", type_name(&other))))
                }
            };
            Value::Int(n as i64)
        }
        "fail" => {
            return Err(ScriptError::Guest(arg(0).to_string()));
        }
        "bytes" => match arg(0) {
            Value::Str(s) => Value::Bytes(s.into_bytes()),
            Value::Bytes(b) => Value::Bytes(b),
            other => {
                return Err(runtime(format!("bytes of {}", type_name(&other))))
            }
        },
        "push" => match arg(0) {
            Value::Array(mut items) => {
                items.push(arg(1));
                Value::Array(items)
            }
            other => {
                return Err(runtime(format!("push into {}", type_name(&other))))
            }
        },
        "keys" => match arg(0) {
            Value::Object(map) => {
                Value::Array(map.keys().cloned().map(Value::Str).collect())
            }
            other => {
                return Err(runtime(format!("keys of {}", type_name(&other))))
            }
        },
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn apply_unary(op: UnOp, value: Value) -> Result<Value, ScriptError> {
    match (op, value) {
        (UnOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (UnOp::Neg, Value::Int(n)) => Ok(Value::Int(-n)),
        (UnOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnOp::Neg, other) => Err(runtime(format!("cannot negate {}", type_name(&other)))),
    }
}

fn apply_binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, ScriptError> {
    use BinOp::{Add, Div, Eq, Ge, Gt, Le, Lt, Mul, Ne, Rem, Sub};
    match op {
        Eq => return Ok(Value::Bool(lhs == rhs)),
        Ne => return Ok(Value::Bool(lhs != rhs)),
        _ => {}
    }
    // String concatenation wins for `+` when either side is a string.
    if op == Add {
        if let Value::Str(l) = &lhs {
            return Ok(Value::Str(format!("{l}{rhs}")));
        }
        if let Value::Str(r) = &rhs {
            return Ok(Value::Str(format!("{lhs}{r}")));
        }
    }
    if let (Value::Str(l), Value::Str(r)) = (&lhs, &rhs) {
        let result = match op {
            Lt => l < r,
            Le => l <= r,
            Gt => l > r,
            Ge => l >= r,
            _ => {
                return Err(runtime(format!("bad string operands for {op:?}")));
            }
        };
        return Ok(Value::Bool(result));
    }
    match (lhs, rhs) {
        (Value::Int(l), Value::Int(r)) => match op {
            Add => Ok(Value::Int(l.wrapping_add(r))),
            Sub => Ok(Value::Int(l.wrapping_sub(r))),
            Mul => Ok(Value::Int(l.wrapping_mul(r))),
            Div => {
                if r == 0 {
                    Err(ScriptError::Guest("division by zero".to_string()))
                } else {
                    Ok(Value::Int(l.wrapping_div(r)))
                }
            }
            Rem => {
                if r == 0 {
                    Err(ScriptError::Guest("division by zero".to_string()))
                } else {
                    Ok(Value::Int(l.wrapping_rem(r)))
                }
            }
            Lt => Ok(Value::Bool(l < r)),
            Le => Ok(Value::Bool(l <= r)),
            Gt => Ok(Value::Bool(l > r)),
            Ge => Ok(Value::Bool(l >= r)),
            _ => unreachable!("logical ops handled earlier"),
        },
        (lhs, rhs) => {
            let (Some(l), Some(r)) = (as_float(&lhs), as_float(&rhs)) else {
                return Err(runtime(format!(
                    "bad operands {} and {} for {op:?}",
                    type_name(&lhs),
                    type_name(&rhs)
                )));
            };
            match op {
                Add => Ok(Value::Float(l + r)),
                Sub => Ok(Value::Float(l - r)),
                Mul => Ok(Value::Float(l * r)),
                Div => Ok(Value::Float(l / r)),
                Rem => Ok(Value::Float(l % r)),
                Lt => Ok(Value::Bool(l < r)),
                Le => Ok(Value::Bool(l <= r)),
                Gt => Ok(Value::Bool(l > r)),
                Ge => Ok(Value::Bool(l >= r)),
                _ => unreachable!("logical ops handled earlier"),
            }
        }
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "string",
        Value::Bytes(_) => "bytes",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
