use super::ExpressionError;
use super::lexer::{lex, Span, Token, TokenKind};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Lit {
	Null,
	Bool(bool),
	Number(f64),
	Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
	Neg,
	Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
	Add,
	Sub,
	Mul,
	Div,
	Mod,
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	And,
	Or,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
	Lit(Lit),
	Var {
		name: String,
		span: Span,
	},
	Member {
		target: Box<Expr>,
		field: String,
	},
	Unary {
		op: UnaryOp,
		expr: Box<Expr>,
	},
	Binary {
		op: BinaryOp,
		left: Box<Expr>,
		right: Box<Expr>,
		span: Span,
	},
	Ternary {
		cond: Box<Expr>,
		then: Box<Expr>,
		otherwise: Box<Expr>,
	},
	Call {
		name: String,
		args: Vec<Expr>,
		span: Span,
	},
}

/// Parses an expression. A single leading `=` is accepted and ignored.
pub(crate) fn parse_expr(src: &str) -> Result<Expr, ExpressionError> {
	let src = src.trim();
	let src = src.strip_prefix('=').unwrap_or(src);
	let tokens = lex(src)?;
	let mut p = Parser { tokens, pos: 0 };
	let expr = p.parse_ternary()?;
	p.expect(TokenKind::Eof)?;
	return Ok(expr);
}

struct Parser {
	tokens: Vec<Token>,
	pos: usize,
}

impl Parser {
	fn peek(&self) -> &Token {
		return &self.tokens[self.pos];
	}

	fn bump(&mut self) -> Token {
		let t = self.tokens[self.pos].clone();
		if self.pos + 1 < self.tokens.len() {
			self.pos += 1;
		}
		return t;
	}

	fn span(&self) -> Span {
		return self.peek().span;
	}

	fn expect(&mut self, kind: TokenKind) -> Result<(), ExpressionError> {
		if self.peek().kind == kind {
			self.bump();
			return Ok(());
		}
		return Err(ExpressionError::new(
			self.span().start,
			format!("expected {kind:?}, found {:?}", self.peek().kind),
		));
	}

	fn consume(&mut self, kind: TokenKind) -> bool {
		if self.peek().kind == kind {
			self.bump();
			return true;
		}
		return false;
	}

	fn parse_ternary(&mut self) -> Result<Expr, ExpressionError> {
		let cond = self.parse_or()?;
		if !self.consume(TokenKind::Question) {
			return Ok(cond);
		}
		let then = self.parse_ternary()?;
		self.expect(TokenKind::Colon)?;
		let otherwise = self.parse_ternary()?;
		return Ok(Expr::Ternary {
			cond: Box::new(cond),
			then: Box::new(then),
			otherwise: Box::new(otherwise),
		});
	}

	fn binary_level(
		&mut self,
		ops: &[(TokenKind, BinaryOp)],
		next: fn(&mut Self) -> Result<Expr, ExpressionError>,
	) -> Result<Expr, ExpressionError> {
		let mut e = next(self)?;
		'outer: loop {
			let span = self.span();
			for (kind, op) in ops {
				if self.consume(kind.clone()) {
					let right = next(self)?;
					e = Expr::Binary {
						op: *op,
						left: Box::new(e),
						right: Box::new(right),
						span,
					};
					continue 'outer;
				}
			}
			break;
		}
		return Ok(e);
	}

	fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
		return self.binary_level(&[(TokenKind::OrOr, BinaryOp::Or)], Self::parse_and);
	}

	fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
		return self.binary_level(&[(TokenKind::AndAnd, BinaryOp::And)], Self::parse_equality);
	}

	fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
		return self.binary_level(
			&[(TokenKind::EqEq, BinaryOp::Eq), (TokenKind::Ne, BinaryOp::Ne)],
			Self::parse_comparison,
		);
	}

	fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
		return self.binary_level(
			&[
				(TokenKind::Lt, BinaryOp::Lt),
				(TokenKind::Le, BinaryOp::Le),
				(TokenKind::Gt, BinaryOp::Gt),
				(TokenKind::Ge, BinaryOp::Ge),
			],
			Self::parse_term,
		);
	}

	fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
		return self.binary_level(
			&[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
			Self::parse_factor,
		);
	}

	fn parse_factor(&mut self) -> Result<Expr, ExpressionError> {
		return self.binary_level(
			&[
				(TokenKind::Star, BinaryOp::Mul),
				(TokenKind::Slash, BinaryOp::Div),
				(TokenKind::Percent, BinaryOp::Mod),
			],
			Self::parse_unary,
		);
	}

	fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
		if self.consume(TokenKind::Minus) {
			let expr = self.parse_unary()?;
			return Ok(Expr::Unary {
				op: UnaryOp::Neg,
				expr: Box::new(expr),
			});
		}
		if self.consume(TokenKind::Plus) {
			return self.parse_unary();
		}
		if self.consume(TokenKind::Bang) {
			let expr = self.parse_unary()?;
			return Ok(Expr::Unary {
				op: UnaryOp::Not,
				expr: Box::new(expr),
			});
		}
		return self.parse_postfix();
	}

	fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
		let mut e = self.parse_primary()?;
		while self.consume(TokenKind::Dot) {
			let tok = self.bump();
			match tok.kind {
				TokenKind::Ident(field) => {
					e = Expr::Member {
						target: Box::new(e),
						field,
					};
				}
				other => {
					return Err(ExpressionError::new(
						tok.span.start,
						format!("expected field name after '.', found {other:?}"),
					));
				}
			}
		}
		return Ok(e);
	}

	fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
		let tok = self.bump();
		return match tok.kind {
			TokenKind::Number(v) => Ok(Expr::Lit(Lit::Number(v))),
			TokenKind::Str(s) => Ok(Expr::Lit(Lit::Text(s))),
			TokenKind::True => Ok(Expr::Lit(Lit::Bool(true))),
			TokenKind::False => Ok(Expr::Lit(Lit::Bool(false))),
			TokenKind::Null => Ok(Expr::Lit(Lit::Null)),
			TokenKind::LParen => {
				let e = self.parse_ternary()?;
				self.expect(TokenKind::RParen)?;
				Ok(e)
			}
			TokenKind::Ident(name) => {
				if self.consume(TokenKind::LParen) {
					let mut args = Vec::new();
					if !self.consume(TokenKind::RParen) {
						loop {
							args.push(self.parse_ternary()?);
							if self.consume(TokenKind::RParen) {
								break;
							}
							self.expect(TokenKind::Comma)?;
						}
					}
					Ok(Expr::Call {
						name,
						args,
						span: tok.span,
					})
				} else {
					Ok(Expr::Var { name, span: tok.span })
				}
			}
			other => Err(ExpressionError::new(
				tok.span.start,
				format!("unexpected token {other:?}"),
			)),
		};
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn precedence() {
		let e = parse_expr("=1 + 2 * 3").unwrap();
		match e {
			Expr::Binary { op: BinaryOp::Add, right, .. } => {
				assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn member_and_call() {
		let e = parse_expr("max(KWARGS.level, 3)").unwrap();
		match e {
			Expr::Call { name, args, .. } => {
				assert_eq!(name, "max");
				assert!(matches!(&args[0], Expr::Member { field, .. } if field == "level"));
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn rejects_trailing_tokens() {
		assert!(parse_expr("1 2").is_err());
		assert!(parse_expr("(1").is_err());
		assert!(parse_expr("a ? b").is_err());
	}
}
