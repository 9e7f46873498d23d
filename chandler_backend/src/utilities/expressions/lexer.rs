use super::ExpressionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
	pub(crate) start: usize,
	pub(crate) end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
	pub(crate) kind: TokenKind,
	pub(crate) span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
	Ident(String),
	Number(f64),
	Str(String),
	True,
	False,
	Null,

	LParen,
	RParen,
	Comma,
	Dot,

	Plus,
	Minus,
	Star,
	Slash,
	Percent,

	Bang,

	EqEq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,

	AndAnd,
	OrOr,

	Question,
	Colon,

	Eof,
}

pub(crate) fn lex(input: &str) -> Result<Vec<Token>, ExpressionError> {
	let mut out = Vec::new();
	let bytes = input.as_bytes();
	let mut i = 0usize;

	while i < bytes.len() {
		let c = bytes[i] as char;
		if c.is_whitespace() {
			i += 1;
			continue;
		}

		let start = i;

		// [0-9]+(.[0-9]+)?([eE][+-]?[0-9]+)? or .[0-9]+
		if c.is_ascii_digit() || (c == '.' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit()) {
			if c == '.' {
				i += 1;
			} else {
				while i < bytes.len() && bytes[i].is_ascii_digit() {
					i += 1;
				}
				if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
					i += 1;
				}
			}
			while i < bytes.len() && bytes[i].is_ascii_digit() {
				i += 1;
			}

			if i < bytes.len() && matches!(bytes[i], b'e' | b'E') {
				let e_pos = i;
				i += 1;
				if i < bytes.len() && matches!(bytes[i], b'+' | b'-') {
					i += 1;
				}
				let exp_start = i;
				while i < bytes.len() && bytes[i].is_ascii_digit() {
					i += 1;
				}
				if exp_start == i {
					return Err(ExpressionError::new(e_pos, "invalid number exponent (expected digits)"));
				}
			}

			let value: f64 = input[start..i]
				.parse()
				.map_err(|_| ExpressionError::new(start, "invalid number"))?;
			out.push(Token {
				kind: TokenKind::Number(value),
				span: Span { start, end: i },
			});
			continue;
		}

		if c.is_ascii_alphabetic() || c == '_' {
			i += 1;
			while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
				i += 1;
			}
			let kind = match &input[start..i] {
				"true" | "True" => TokenKind::True,
				"false" | "False" => TokenKind::False,
				"null" | "None" => TokenKind::Null,
				"and" => TokenKind::AndAnd,
				"or" => TokenKind::OrOr,
				"not" => TokenKind::Bang,
				ident => TokenKind::Ident(ident.to_owned()),
			};
			out.push(Token {
				kind,
				span: Span { start, end: i },
			});
			continue;
		}

		if c == '"' || c == '\'' {
			i += 1;
			let mut text = String::new();
			let mut closed = false;
			while i < bytes.len() {
				let ch = bytes[i] as char;
				if ch == c {
					closed = true;
					i += 1;
					break;
				}
				if ch == '\\' && i + 1 < bytes.len() {
					let escaped = input[i + 1..].chars().next().unwrap_or('\\');
					text.push(match escaped {
						'n' => '\n',
						't' => '\t',
						other => other,
					});
					i += 1 + escaped.len_utf8();
					continue;
				}
				// Multi-byte characters are copied through as a whole
				let width = input[i..].chars().next().map(char::len_utf8).unwrap_or(1);
				text.push_str(&input[i..i + width]);
				i += width;
			}
			if !closed {
				return Err(ExpressionError::new(start, "unterminated string literal"));
			}
			out.push(Token {
				kind: TokenKind::Str(text),
				span: Span { start, end: i },
			});
			continue;
		}

		let next = bytes.get(i + 1).copied().unwrap_or(0);
		let (kind, len) = match (bytes[i], next) {
			(b'=', b'=') => (TokenKind::EqEq, 2),
			(b'!', b'=') => (TokenKind::Ne, 2),
			(b'<', b'=') => (TokenKind::Le, 2),
			(b'>', b'=') => (TokenKind::Ge, 2),
			(b'&', b'&') => (TokenKind::AndAnd, 2),
			(b'|', b'|') => (TokenKind::OrOr, 2),
			_ => match c {
				'(' => (TokenKind::LParen, 1),
				')' => (TokenKind::RParen, 1),
				',' => (TokenKind::Comma, 1),
				'.' => (TokenKind::Dot, 1),
				'+' => (TokenKind::Plus, 1),
				'-' => (TokenKind::Minus, 1),
				'*' => (TokenKind::Star, 1),
				'/' => (TokenKind::Slash, 1),
				'%' => (TokenKind::Percent, 1),
				'!' => (TokenKind::Bang, 1),
				'<' => (TokenKind::Lt, 1),
				'>' => (TokenKind::Gt, 1),
				'?' => (TokenKind::Question, 1),
				':' => (TokenKind::Colon, 1),
				_ => return Err(ExpressionError::new(start, format!("unexpected character '{c}'"))),
			},
		};
		i += len;
		out.push(Token {
			kind,
			span: Span { start, end: i },
		});
	}

	out.push(Token {
		kind: TokenKind::Eof,
		span: Span {
			start: input.len(),
			end: input.len(),
		},
	});
	return Ok(out);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn kinds(src: &str) -> Vec<TokenKind> {
		return lex(src).unwrap().into_iter().map(|t| t.kind).collect();
	}

	#[test]
	fn lexes_operators_and_literals() {
		assert_eq!(
			kinds("1.5e2 >= x && 'a\\'b'"),
			vec![
				TokenKind::Number(150.0),
				TokenKind::Ge,
				TokenKind::Ident(String::from("x")),
				TokenKind::AndAnd,
				TokenKind::Str(String::from("a'b")),
				TokenKind::Eof,
			],
		);
	}

	#[test]
	fn reports_offsets() {
		let err = lex("1 + #").unwrap_err();
		assert_eq!(err.offset, 4);
		assert!(lex("'open").is_err());
		assert!(lex("1e").is_err());
	}
}
