//! Conditional expressions and `${{ }}` interpolation
//!
//! Small, side-effect-free evaluator for run conditions
//! (`github.event_name == 'push'`) and template interpolation. Interpolation
//! produces plain strings before any execution happens, so nothing downstream
//! of the evaluator ever sees a template.
//!
//! Grammar (loosest binding first):
//!
//! ```text
//! expr     := and ( '||' and )*
//! and      := equality ( '&&' equality )*
//! equality := unary ( ('==' | '!=') unary )?
//! unary    := '!' unary | primary
//! primary  := '(' expr ')' | string | 'true' | 'false'
//!           | ident | ident '(' args ')'
//! ```
//!
//! Unknown identifiers and malformed syntax are hard errors, never false:
//! a typo in a deploy gate must fail the job, not silently skip the gate.

use crate::core::context::RunContext;
use crate::error::ExpressionError;
use sha2::{Digest, Sha256};

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// String form used for interpolation and lenient equality.
    pub fn render(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Comma,
}

fn syntax(expr: &str, reason: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' => {
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            literal.push(*ch);
                            i += 1;
                        }
                        None => return Err(syntax(expr, "unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(syntax(expr, "single '=' (did you mean '==')"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(syntax(expr, "single '&' (did you mean '&&')"));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(syntax(expr, "single '|' (did you mean '||')"));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.get(i) {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        ident.push(ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(syntax(expr, format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    ctx: &'a RunContext,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExpressionError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            _ => Err(syntax(self.source, format!("expected {}", what))),
        }
    }

    fn parse_expr(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Value::Bool(left.truthy() || right.truthy());
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.parse_equality()?;
            left = Value::Bool(left.truthy() && right.truthy());
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Value, ExpressionError> {
        let left = self.parse_unary()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.advance();
                let right = self.parse_unary()?;
                Ok(Value::Bool(left.render() == right.render()))
            }
            Some(Token::NotEq) => {
                self.advance();
                let right = self.parse_unary()?;
                Ok(Value::Bool(left.render() != right.render()))
            }
            _ => Ok(left),
        }
    }

    fn parse_unary(&mut self) -> Result<Value, ExpressionError> {
        if self.peek() == Some(&Token::Bang) {
            self.advance();
            let value = self.parse_unary()?;
            return Ok(Value::Bool(!value.truthy()));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Value, ExpressionError> {
        match self.advance() {
            Some(Token::LParen) => {
                let value = self.parse_expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(value)
            }
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let args = self.parse_args()?;
                    self.call(&name, args)
                } else {
                    self.resolve(&name)
                }
            }
            _ => Err(syntax(self.source, "expected a value")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Value>, ExpressionError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(syntax(self.source, "expected ',' or ')' in argument list")),
            }
        }
        Ok(args)
    }

    fn resolve(&self, name: &str) -> Result<Value, ExpressionError> {
        match name {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => self
                .ctx
                .lookup(name)
                .map(Value::Str)
                .ok_or_else(|| ExpressionError::UnknownIdentifier(name.to_string())),
        }
    }

    fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
        match function {
            "contains" => {
                if args.len() != 2 {
                    return Err(ExpressionError::Arity {
                        function: function.to_string(),
                        expected: 2,
                        got: args.len(),
                    });
                }
                Ok(Value::Bool(args[0].render().contains(&args[1].render())))
            }
            "hashFiles" => {
                if args.is_empty() {
                    return Err(ExpressionError::Arity {
                        function: function.to_string(),
                        expected: 1,
                        got: 0,
                    });
                }
                Ok(Value::Str(hash_files_value(self.ctx, &args)))
            }
            other => Err(ExpressionError::UnknownFunction(other.to_string())),
        }
    }
}

/// Combined digest over the declared input files, in argument order.
///
/// A path with no recorded hash contributes nothing (a deleted input file
/// yields a cold-run key, not an error). No matching files at all yields the
/// empty string.
fn hash_files_value(ctx: &RunContext, args: &[Value]) -> String {
    let mut hasher = Sha256::new();
    let mut matched = false;
    for arg in args {
        let path = arg.render();
        if let Some(digest) = ctx.file_hashes.get(&path) {
            hasher.update(path.as_bytes());
            hasher.update(b"\n");
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
            matched = true;
        }
    }
    if matched {
        hex::encode(hasher.finalize())
    } else {
        String::new()
    }
}

/// Evaluate a conditional or interpolation expression against the context.
pub fn evaluate(expr: &str, ctx: &RunContext) -> Result<Value, ExpressionError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(syntax(expr, "empty expression"));
    }
    let mut parser = Parser {
        source: expr,
        ctx,
        tokens,
        pos: 0,
    };
    let value = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax(expr, "trailing tokens after expression"));
    }
    Ok(value)
}

/// Evaluate a run condition to a boolean.
pub fn evaluate_bool(expr: &str, ctx: &RunContext) -> Result<bool, ExpressionError> {
    Ok(evaluate(expr, ctx)?.truthy())
}

/// Substitute every `${{ ... }}` placeholder in `template` with the rendered
/// value of the inner expression. Text outside placeholders passes through
/// untouched.
pub fn interpolate(template: &str, ctx: &RunContext) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let end = after.find("}}").ok_or_else(|| ExpressionError::Syntax {
            expr: template.to_string(),
            reason: "unterminated '${{'".to_string(),
        })?;
        let inner = after[..end].trim();
        out.push_str(&evaluate(inner, ctx)?.render());
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new("push", "refs/heads/master");
        ctx.repository = "lablup/backend.ai".to_string();
        ctx.head_repository = "lablup/backend.ai".to_string();
        ctx.runner_os = "linux".to_string();
        ctx.matrix
            .insert("python-version".to_string(), "3.6".to_string());
        ctx
    }

    #[test]
    fn test_equality() {
        let ctx = ctx();
        assert_eq!(
            evaluate("github.event_name == 'push'", &ctx).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("github.event_name != 'push'", &ctx).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_logical_operators() {
        let ctx = ctx();
        assert!(evaluate_bool(
            "github.event_name == 'push' && github.ref == 'refs/heads/master'",
            &ctx
        )
        .unwrap());
        assert!(evaluate_bool(
            "github.event_name == 'pull_request' || matrix.python-version == '3.6'",
            &ctx
        )
        .unwrap());
        assert!(evaluate_bool("!(github.event_name == 'pull_request')", &ctx).unwrap());
    }

    #[test]
    fn test_contains() {
        let ctx = ctx();
        assert!(evaluate_bool("contains(github.ref, 'master')", &ctx).unwrap());
        assert!(!evaluate_bool("contains(github.ref, 'release')", &ctx).unwrap());
    }

    #[test]
    fn test_unknown_identifier_is_an_error_not_false() {
        let ctx = ctx();
        let err = evaluate("github.evnt_name == 'push'", &ctx).unwrap_err();
        assert_eq!(
            err,
            ExpressionError::UnknownIdentifier("github.evnt_name".to_string())
        );
    }

    #[test]
    fn test_malformed_syntax_errors() {
        let ctx = ctx();
        assert!(matches!(
            evaluate("github.ref = 'x'", &ctx),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(matches!(
            evaluate("contains(github.ref", &ctx),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(matches!(
            evaluate("'unterminated", &ctx),
            Err(ExpressionError::Syntax { .. })
        ));
    }

    #[test]
    fn test_interpolation() {
        let ctx = ctx();
        let rendered =
            interpolate("pip-${{ runner.os }}-py${{ matrix.python-version }}", &ctx).unwrap();
        assert_eq!(rendered, "pip-linux-py3.6");
    }

    #[test]
    fn test_interpolation_passthrough_and_errors() {
        let ctx = ctx();
        assert_eq!(interpolate("no placeholders", &ctx).unwrap(), "no placeholders");
        assert!(interpolate("${{ runner.os }", &ctx).is_err());
        assert!(matches!(
            interpolate("${{ nosuch.thing }}", &ctx),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn test_hash_files_deterministic() {
        let mut ctx = ctx();
        ctx.file_hashes
            .insert("requirements.txt".to_string(), "abc123".to_string());

        let first = evaluate("hashFiles('requirements.txt')", &ctx).unwrap();
        let second = evaluate("hashFiles('requirements.txt')", &ctx).unwrap();
        assert_eq!(first, second);
        assert!(!first.render().is_empty());

        // No recorded hash -> empty digest, not an error
        let missing = evaluate("hashFiles('setup.py')", &ctx).unwrap();
        assert_eq!(missing.render(), "");
    }
}
