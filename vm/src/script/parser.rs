//! Guest script parser: pest pairs → AST.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use hindsight_types::Value;

use super::ast::{BinOp, Block, Expr, MethodDef, Param, Script, Stmt, UnOp};
use super::ScriptError;

#[derive(Parser)]
#[grammar = "script/guest.pest"]
struct GuestParser;

fn syntax_error(pair: &Pair<'_, Rule>, message: impl Into<String>) -> ScriptError {
    let (line, col) = pair.as_span().start_pos().line_col();
    ScriptError::Parse {
        line,
        col,
        message: message.into(),
    }
}

/// Parse a guest script into its exported method table.
///
/// # Errors
///
/// `ScriptError::Parse` with position information on syntax errors;
/// `ScriptError::Duplicate` when two methods share a name.
pub fn parse_script(input: &str) -> Result<Script, ScriptError> {
    let mut pairs = GuestParser::parse(Rule::script, input).map_err(|e| {
        let (line, col) = match e.line_col {
            pest::error::LineColLocation::Pos((line, col))
            | pest::error::LineColLocation::Span((line, col), _) => (line, col),
        };
        ScriptError::Parse {
            line,
            col,
            message: e.variant.message().to_string(),
        }
    })?;
    let script_pair = pairs.next().expect("script rule always matches");

    let mut script = Script::default();
    for pair in script_pair.into_inner() {
        match pair.as_rule() {
            Rule::method_def => {
                let method = parse_method(pair)?;
                if script.methods.contains_key(&method.name) {
                    return Err(ScriptError::Duplicate {
                        name: method.name.clone(),
                    });
                }
                script.methods.insert(method.name.clone(), method);
            }
            Rule::EOI => {}
            other => unreachable!("unexpected rule under script: {other:?}"),
        }
    }
    Ok(script)
}

fn parse_method(pair: Pair<'_, Rule>) -> Result<MethodDef, ScriptError> {
    let mut inner = pair.into_inner();
    let name = inner.next().expect("method name").as_str().to_string();
    let mut params = Vec::new();
    let mut body = Block::default();
    for part in inner {
        match part.as_rule() {
            Rule::param_list => {
                for param in part.into_inner() {
                    params.push(parse_param(param)?);
                }
            }
            Rule::block => body = parse_block(part)?,
            other => unreachable!("unexpected rule under method: {other:?}"),
        }
    }
    Ok(MethodDef { name, params, body })
}

fn parse_param(pair: Pair<'_, Rule>) -> Result<Param, ScriptError> {
    let mut inner = pair.into_inner();
    let name = inner.next().expect("param name").as_str().to_string();
    let default = match inner.next() {
        Some(lit) => Some(parse_literal(lit)?),
        None => None,
    };
    Ok(Param { name, default })
}

fn parse_block(pair: Pair<'_, Rule>) -> Result<Block, ScriptError> {
    let mut stmts = Vec::new();
    for stmt in pair.into_inner() {
        stmts.push(parse_stmt(stmt)?);
    }
    Ok(Block(stmts))
}

fn parse_stmt(pair: Pair<'_, Rule>) -> Result<Stmt, ScriptError> {
    let inner = pair.into_inner().next().expect("stmt has one child");
    match inner.as_rule() {
        Rule::let_stmt => {
            let mut parts = inner.into_inner();
            let name = parts.next().expect("let name").as_str().to_string();
            let value = parse_expr(parts.next().expect("let value"))?;
            Ok(Stmt::Let(name, value))
        }
        Rule::assign_stmt => {
            let mut parts = inner.into_inner();
            let name = parts.next().expect("assign target").as_str().to_string();
            let value = parse_expr(parts.next().expect("assign value"))?;
            Ok(Stmt::Assign(name, value))
        }
        Rule::return_stmt => {
            let value = match inner.into_inner().next() {
                Some(expr) => Some(parse_expr(expr)?),
                None => None,
            };
            Ok(Stmt::Return(value))
        }
        Rule::if_stmt => parse_if(inner),
        Rule::while_stmt => {
            let mut parts = inner.into_inner();
            let cond = parse_expr(parts.next().expect("while cond"))?;
            let body = parse_block(parts.next().expect("while body"))?;
            Ok(Stmt::While { cond, body })
        }
        Rule::expr_stmt => {
            let expr = parse_expr(inner.into_inner().next().expect("expr"))?;
            Ok(Stmt::Expr(expr))
        }
        other => unreachable!("unexpected rule under stmt: {other:?}"),
    }
}

fn parse_if(pair: Pair<'_, Rule>) -> Result<Stmt, ScriptError> {
    let mut parts = pair.into_inner();
    let cond = parse_expr(parts.next().expect("if cond"))?;
    let then_block = parse_block(parts.next().expect("if body"))?;
    let else_block = match parts.next() {
        None => None,
        Some(tail) => match tail.as_rule() {
            Rule::block => Some(parse_block(tail)?),
            Rule::if_stmt => Some(Block(vec![parse_if(tail)?])),
            other => unreachable!("unexpected rule in else: {other:?}"),
        },
    };
    Ok(Stmt::If {
        cond,
        then_block,
        else_block,
    })
}

fn parse_expr(pair: Pair<'_, Rule>) -> Result<Expr, ScriptError> {
    let mut operands = Vec::new();
    let mut operators = Vec::new();

    let mut prefixes = Vec::new();
    let mut current: Option<Expr> = None;

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::not_op => prefixes.push(UnOp::Not),
            Rule::neg_op => prefixes.push(UnOp::Neg),
            Rule::primary => {
                let mut expr = parse_primary(part)?;
                for op in prefixes.drain(..).rev() {
                    expr = Expr::Unary(op, Box::new(expr));
                }
                current = Some(expr);
            }
            Rule::call_suffix => {
                let base = current.take().expect("suffix follows primary");
                let mut args = Vec::new();
                if let Some(list) = part.into_inner().next() {
                    for arg in list.into_inner() {
                        args.push(parse_expr(arg)?);
                    }
                }
                current = Some(Expr::Call(Box::new(base), args));
            }
            Rule::index_suffix => {
                let base = current.take().expect("suffix follows primary");
                let index = parse_expr(part.into_inner().next().expect("index expr"))?;
                current = Some(Expr::Index(Box::new(base), Box::new(index)));
            }
            Rule::field_suffix => {
                let base = current.take().expect("suffix follows primary");
                let field = part
                    .into_inner()
                    .next()
                    .expect("field name")
                    .as_str()
                    .to_string();
                current = Some(Expr::Field(Box::new(base), field));
            }
            rule => {
                let op = match rule {
                    Rule::or_op => BinOp::Or,
                    Rule::and_op => BinOp::And,
                    Rule::eq_op => BinOp::Eq,
                    Rule::ne_op => BinOp::Ne,
                    Rule::le_op => BinOp::Le,
                    Rule::ge_op => BinOp::Ge,
                    Rule::lt_op => BinOp::Lt,
                    Rule::gt_op => BinOp::Gt,
                    Rule::add_op => BinOp::Add,
                    Rule::sub_op => BinOp::Sub,
                    Rule::mul_op => BinOp::Mul,
                    Rule::div_op => BinOp::Div,
                    Rule::rem_op => BinOp::Rem,
                    other => unreachable!("unexpected rule in expr: {other:?}"),
                };
                operands.push(current.take().expect("operand before operator"));
                operators.push(op);
            }
        }
    }
    operands.push(current.expect("expr has a final operand"));
    Ok(fold_operators(operands, &operators))
}

/// Left-associative precedence fold via two stacks.
fn fold_operators(operands: Vec<Expr>, operators: &[BinOp]) -> Expr {
    let mut operand_stack: Vec<Expr> = Vec::with_capacity(operands.len());
    let mut op_stack: Vec<BinOp> = Vec::with_capacity(operators.len());
    let mut operands = operands.into_iter();
    operand_stack.push(operands.next().expect("at least one operand"));

    let reduce = |operand_stack: &mut Vec<Expr>, op: BinOp| {
        let rhs = operand_stack.pop().expect("rhs");
        let lhs = operand_stack.pop().expect("lhs");
        operand_stack.push(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
    };

    for &op in operators {
        while op_stack
            .last()
            .is_some_and(|top| top.precedence() >= op.precedence())
        {
            let top = op_stack.pop().expect("checked non-empty");
            reduce(&mut operand_stack, top);
        }
        op_stack.push(op);
        operand_stack.push(operands.next().expect("operand after operator"));
    }
    while let Some(op) = op_stack.pop() {
        reduce(&mut operand_stack, op);
    }
    operand_stack.pop().expect("single folded expression")
}

fn parse_primary(pair: Pair<'_, Rule>) -> Result<Expr, ScriptError> {
    let inner = pair.into_inner().next().expect("primary has one child");
    match inner.as_rule() {
        Rule::literal => Ok(Expr::Lit(parse_literal(inner)?)),
        Rule::ident => Ok(Expr::Var(inner.as_str().to_string())),
        Rule::array_lit => {
            let mut items = Vec::new();
            for item in inner.into_inner() {
                items.push(parse_expr(item)?);
            }
            Ok(Expr::Array(items))
        }
        Rule::object_lit => {
            let mut fields = Vec::new();
            for field in inner.into_inner() {
                let field_pair = field;
                let mut parts = field_pair.into_inner();
                let key_pair = parts.next().expect("object key");
                let key = match key_pair.as_rule() {
                    Rule::ident => key_pair.as_str().to_string(),
                    Rule::string => unescape(&key_pair),
                    other => unreachable!("unexpected object key rule: {other:?}"),
                };
                let value = parse_expr(parts.next().expect("object value"))?;
                fields.push((key, value));
            }
            Ok(Expr::Object(fields))
        }
        Rule::expr => parse_expr(inner),
        other => unreachable!("unexpected rule under primary: {other:?}"),
    }
}

fn parse_literal(pair: Pair<'_, Rule>) -> Result<Value, ScriptError> {
    let inner = pair.into_inner().next().expect("literal has one child");
    match inner.as_rule() {
        Rule::null_lit => Ok(Value::Null),
        Rule::true_lit => Ok(Value::Bool(true)),
        Rule::false_lit => Ok(Value::Bool(false)),
        Rule::int => inner
            .as_str()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| syntax_error(&inner, "integer literal out of range")),
        Rule::float => inner
            .as_str()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| syntax_error(&inner, "bad float literal")),
        Rule::string => Ok(Value::Str(unescape(&inner))),
        other => unreachable!("unexpected rule under literal: {other:?}"),
    }
}

fn unescape(pair: &Pair<'_, Rule>) -> String {
    let raw = pair.as_str();
    let body = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}
