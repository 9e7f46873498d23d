//! Small expression language used for dynamic channel values, cue lengths,
//! cue names and script arguments.
//!
//! Strings beginning with `=` are expressions; anything else is a literal.

mod lexer;
mod parser;

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use parser::{parse_expr, BinaryOp, Expr, Lit, UnaryOp};

use super::clock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at offset {offset})")]
pub struct ExpressionError {
	pub offset: usize,
	pub message: String,
}

impl ExpressionError {
	pub fn new(offset: usize, message: impl Into<String>) -> Self {
		return ExpressionError {
			offset,
			message: message.into(),
		};
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
	Null,
	Bool(bool),
	Number(f64),
	Text(String),
	Map(BTreeMap<String, Value>),
}

impl Value {
	/// Numeric view of the value. Text is parsed, booleans are 0/1.
	pub fn as_number(&self) -> Option<f64> {
		return match self {
			Value::Number(n) => Some(*n),
			Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
			Value::Text(s) => s.trim().parse().ok(),
			Value::Null | Value::Map(_) => None,
		};
	}

	pub fn truthy(&self) -> bool {
		return match self {
			Value::Null => false,
			Value::Bool(b) => *b,
			Value::Number(n) => *n != 0.0,
			Value::Text(s) => !s.is_empty(),
			Value::Map(m) => !m.is_empty(),
		};
	}

	fn type_name(&self) -> &'static str {
		return match self {
			Value::Null => "null",
			Value::Bool(_) => "bool",
			Value::Number(_) => "number",
			Value::Text(_) => "string",
			Value::Map(_) => "map",
		};
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		return match self {
			Value::Null => write!(f, ""),
			Value::Bool(b) => write!(f, "{b}"),
			Value::Number(n) => {
				if n.fract() == 0.0 && n.abs() < 1e15 {
					write!(f, "{}", *n as i64)
				} else {
					write!(f, "{n}")
				}
			}
			Value::Text(s) => write!(f, "{s}"),
			Value::Map(m) => {
				let body: Vec<String> = m.iter().map(|(k, v)| format!("{k}={v}")).collect();
				write!(f, "{}", body.join("&"))
			}
		};
	}
}

impl From<f64> for Value {
	fn from(value: f64) -> Self {
		return Value::Number(value);
	}
}

impl From<&str> for Value {
	fn from(value: &str) -> Self {
		return Value::Text(String::from(value));
	}
}

/// Source of variables visible to an expression.
pub trait VariableScope {
	fn get_var(&self, name: &str) -> Option<Value>;
}

/// Scope with no variables at all
pub struct NoVariables;

impl VariableScope for NoVariables {
	fn get_var(&self, _name: &str) -> Option<Value> {
		return None;
	}
}

impl VariableScope for BTreeMap<String, Value> {
	fn get_var(&self, name: &str) -> Option<Value> {
		return self.get(name).cloned();
	}
}

pub fn is_expression(raw: &str) -> bool {
	return raw.starts_with('=');
}

/// Evaluates `raw` if it is an expression, otherwise returns it as text.
pub fn resolve(raw: &str, scope: &dyn VariableScope) -> Result<Value, ExpressionError> {
	if is_expression(raw) {
		return evaluate(raw, scope);
	}
	return Ok(Value::Text(String::from(raw)));
}

/// Like [`resolve`] but requires a number. Plain strings are parsed.
pub fn resolve_number(raw: &str, scope: &dyn VariableScope) -> Result<f64, ExpressionError> {
	let value = resolve(raw, scope)?;
	return value
		.as_number()
		.ok_or_else(|| ExpressionError::new(0, format!("expected a number, got {} {value:?}", value.type_name())));
}

pub fn evaluate(src: &str, scope: &dyn VariableScope) -> Result<Value, ExpressionError> {
	let expr = parse_expr(src)?;
	return eval(&expr, scope);
}

fn eval(expr: &Expr, scope: &dyn VariableScope) -> Result<Value, ExpressionError> {
	match expr {
		Expr::Lit(lit) => {
			return Ok(match lit {
				Lit::Null => Value::Null,
				Lit::Bool(b) => Value::Bool(*b),
				Lit::Number(n) => Value::Number(*n),
				Lit::Text(s) => Value::Text(s.clone()),
			});
		}
		Expr::Var { name, span } => {
			return scope
				.get_var(name)
				.ok_or_else(|| ExpressionError::new(span.start, format!("unknown variable '{name}'")));
		}
		Expr::Member { target, field } => {
			return match eval(target, scope)? {
				Value::Map(mut map) => Ok(map.remove(field).unwrap_or(Value::Null)),
				other => Err(ExpressionError::new(
					0,
					format!("cannot read field '{field}' of {}", other.type_name()),
				)),
			};
		}
		Expr::Unary { op, expr } => {
			let value = eval(expr, scope)?;
			return match op {
				UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
				UnaryOp::Neg => match value.as_number() {
					Some(n) => Ok(Value::Number(-n)),
					None => Err(ExpressionError::new(0, format!("cannot negate {}", value.type_name()))),
				},
			};
		}
		Expr::Binary { op, left, right, span } => {
			// Short-circuit forms first
			match op {
				BinaryOp::And => {
					let l = eval(left, scope)?;
					if !l.truthy() {
						return Ok(Value::Bool(false));
					}
					return Ok(Value::Bool(eval(right, scope)?.truthy()));
				}
				BinaryOp::Or => {
					let l = eval(left, scope)?;
					if l.truthy() {
						return Ok(Value::Bool(true));
					}
					return Ok(Value::Bool(eval(right, scope)?.truthy()));
				}
				_ => {}
			}
			let l = eval(left, scope)?;
			let r = eval(right, scope)?;
			return binary(*op, l, r, span.start);
		}
		Expr::Ternary { cond, then, otherwise } => {
			if eval(cond, scope)?.truthy() {
				return eval(then, scope);
			}
			return eval(otherwise, scope);
		}
		Expr::Call { name, args, span } => {
			let mut values = Vec::with_capacity(args.len());
			for arg in args {
				values.push(eval(arg, scope)?);
			}
			return call(name, values, span.start);
		}
	}
}

fn binary(op: BinaryOp, l: Value, r: Value, offset: usize) -> Result<Value, ExpressionError> {
	if let (BinaryOp::Add, Value::Text(_), _) | (BinaryOp::Add, _, Value::Text(_)) = (op, &l, &r) {
		return Ok(Value::Text(format!("{l}{r}")));
	}
	match op {
		BinaryOp::Eq => return Ok(Value::Bool(loose_eq(&l, &r))),
		BinaryOp::Ne => return Ok(Value::Bool(!loose_eq(&l, &r))),
		_ => {}
	}
	if let (Value::Text(a), Value::Text(b)) = (&l, &r) {
		let ordering = a.cmp(b);
		return match op {
			BinaryOp::Lt => Ok(Value::Bool(ordering.is_lt())),
			BinaryOp::Le => Ok(Value::Bool(ordering.is_le())),
			BinaryOp::Gt => Ok(Value::Bool(ordering.is_gt())),
			BinaryOp::Ge => Ok(Value::Bool(ordering.is_ge())),
			_ => Err(ExpressionError::new(offset, format!("unsupported operator {op:?} on strings"))),
		};
	}

	let (a, b) = match (l.as_number(), r.as_number()) {
		(Some(a), Some(b)) => (a, b),
		_ => {
			return Err(ExpressionError::new(
				offset,
				format!("cannot apply {op:?} to {} and {}", l.type_name(), r.type_name()),
			));
		}
	};
	return Ok(match op {
		BinaryOp::Add => Value::Number(a + b),
		BinaryOp::Sub => Value::Number(a - b),
		BinaryOp::Mul => Value::Number(a * b),
		BinaryOp::Div => {
			if b == 0.0 {
				return Err(ExpressionError::new(offset, "division by zero"));
			}
			Value::Number(a / b)
		}
		BinaryOp::Mod => {
			if b == 0.0 {
				return Err(ExpressionError::new(offset, "division by zero"));
			}
			Value::Number(a.rem_euclid(b))
		}
		BinaryOp::Lt => Value::Bool(a < b),
		BinaryOp::Le => Value::Bool(a <= b),
		BinaryOp::Gt => Value::Bool(a > b),
		BinaryOp::Ge => Value::Bool(a >= b),
		BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
	});
}

fn loose_eq(l: &Value, r: &Value) -> bool {
	if let (Value::Number(_) | Value::Bool(_), Value::Number(_) | Value::Bool(_)) = (l, r) {
		return l.as_number() == r.as_number();
	}
	return l == r;
}

fn call(name: &str, args: Vec<Value>, offset: usize) -> Result<Value, ExpressionError> {
	let numbers = || -> Result<Vec<f64>, ExpressionError> {
		return args
			.iter()
			.map(|v| {
				v.as_number()
					.ok_or_else(|| ExpressionError::new(offset, format!("{name}() expects numbers, got {}", v.type_name())))
			})
			.collect();
	};
	let arity = |min: usize, max: usize| -> Result<(), ExpressionError> {
		if args.len() < min || args.len() > max {
			return Err(ExpressionError::new(
				offset,
				format!("{name}() takes {min}..={max} arguments, got {}", args.len()),
			));
		}
		return Ok(());
	};

	let result = match name {
		"min" | "max" => {
			arity(1, usize::MAX)?;
			let nums = numbers()?;
			let fold: fn(f64, f64) -> f64 = if name == "min" { f64::min } else { f64::max };
			nums.into_iter().reduce(fold).unwrap_or(0.0)
		}
		"abs" | "floor" | "ceil" | "round" | "sqrt" => {
			arity(1, 1)?;
			let n = numbers()?[0];
			match name {
				"abs" => n.abs(),
				"floor" => n.floor(),
				"ceil" => n.ceil(),
				"round" => n.round(),
				_ => {
					if n < 0.0 {
						return Err(ExpressionError::new(offset, "sqrt() of a negative number"));
					}
					n.sqrt()
				}
			}
		}
		"clamp" => {
			arity(3, 3)?;
			let n = numbers()?;
			let (lo, hi) = if n[1] <= n[2] { (n[1], n[2]) } else { (n[2], n[1]) };
			n[0].clamp(lo, hi)
		}
		"random" => {
			arity(0, 2)?;
			let n = numbers()?;
			let mut rng = rand::thread_rng();
			match n.as_slice() {
				[] => rng.gen::<f64>(),
				[hi] => rng.gen::<f64>() * hi,
				[lo, hi] => lo + rng.gen::<f64>() * (hi - lo),
				_ => unreachable!("arity checked"),
			}
		}
		"time" => {
			arity(0, 0)?;
			clock::now()
		}
		"str" => {
			arity(1, 1)?;
			return Ok(Value::Text(args[0].to_string()));
		}
		_ => return Err(ExpressionError::new(offset, format!("unknown function '{name}'"))),
	};
	return Ok(Value::Number(result));
}

#[cfg(test)]
mod tests {
	use super::*;

	fn scope() -> BTreeMap<String, Value> {
		let mut kwargs = BTreeMap::new();
		kwargs.insert(String::from("level"), Value::from("40"));
		let mut vars = BTreeMap::new();
		vars.insert(String::from("GROUP"), Value::from("stage"));
		vars.insert(String::from("CUE"), Value::from("intro"));
		vars.insert(String::from("KWARGS"), Value::Map(kwargs));
		vars.insert(String::from("brightness"), Value::Number(0.5));
		return vars;
	}

	#[test]
	fn arithmetic() {
		assert_eq!(evaluate("=1+1", &NoVariables).unwrap(), Value::Number(2.0));
		assert_eq!(evaluate("=2 + 3 * 4 - 1", &NoVariables).unwrap(), Value::Number(13.0));
		assert_eq!(evaluate("=-7 % 3", &NoVariables).unwrap(), Value::Number(2.0));
		assert!(evaluate("=1/0", &NoVariables).is_err());
	}

	#[test]
	fn variables_and_members() {
		let vars = scope();
		assert_eq!(evaluate("=brightness * 255", &vars).unwrap(), Value::Number(127.5));
		assert_eq!(evaluate("=KWARGS.level + 0", &vars).unwrap(), Value::Text(String::from("400")));
		assert_eq!(evaluate("=KWARGS.level * 2", &vars).unwrap(), Value::Number(80.0));
		assert_eq!(evaluate("=CUE == 'intro' ? 1 : 0", &vars).unwrap(), Value::Number(1.0));
		assert_eq!(evaluate("=KWARGS.missing", &vars).unwrap(), Value::Null);
		assert!(evaluate("=nope", &vars).is_err());
	}

	#[test]
	fn builtins() {
		assert_eq!(evaluate("=max(1, 5, 3)", &NoVariables).unwrap(), Value::Number(5.0));
		assert_eq!(evaluate("=clamp(300, 0, 255)", &NoVariables).unwrap(), Value::Number(255.0));
		assert_eq!(evaluate("=round(2.6) + floor(1.9)", &NoVariables).unwrap(), Value::Number(4.0));
		let r = evaluate("=random(10, 20)", &NoVariables).unwrap().as_number().unwrap();
		assert!((10.0..20.0).contains(&r));
		assert!(evaluate("=time()", &NoVariables).unwrap().as_number().unwrap() > 1.0e9);
		assert!(evaluate("=frobnicate(1)", &NoVariables).is_err());
	}

	#[test]
	fn literals_pass_through() {
		assert_eq!(resolve("intro", &NoVariables).unwrap(), Value::from("intro"));
		assert_eq!(resolve_number("12.5", &NoVariables).unwrap(), 12.5);
		assert_eq!(resolve("='a' + 'b'", &NoVariables).unwrap(), Value::from("ab"));
		assert!(resolve_number("bright", &NoVariables).is_err());
	}

	#[test]
	fn logic_short_circuits() {
		assert_eq!(evaluate("=false && nope", &NoVariables).unwrap(), Value::Bool(false));
		assert_eq!(evaluate("=true || nope", &NoVariables).unwrap(), Value::Bool(true));
		assert_eq!(evaluate("=not (1 < 2)", &NoVariables).unwrap(), Value::Bool(false));
	}
}
