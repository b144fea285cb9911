// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Restricted expression language for logic rules.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | compare
//! compare := sum (("==" | "!=" | "<" | "<=" | ">" | ">=") sum)*
//! sum     := term (("+" | "-") term)*
//! term    := unary (("*" | "/" | "//" | "%") unary)*
//! unary   := ("-" | "+") unary | power
//! power   := primary ("**" unary)?
//! primary := number | string | name | name "(" args ")" | "(" or ")"
//! ```
//!
//! Names resolve against the evaluation scope, then the constants `pi`, `e`
//! and `inf`. Calls are limited to a fixed set of math functions; a `math.`
//! prefix is accepted and ignored. Comparisons chain as in `0 < x < 10`.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::model::SampleValue;

/// Errors raised while parsing or evaluating an expression
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("unexpected {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown name '{0}'")]
    UnknownName(String),
    #[error("{name}() takes {expected} argument(s), got {got}")]
    Arity { name: &'static str, expected: &'static str, got: usize },
    #[error("unsupported operand types for {op}: {left} and {right}")]
    TypeMismatch { op: &'static str, left: &'static str, right: &'static str },
    #[error("division by zero")]
    DivisionByZero,
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("expression has more than {0} tokens")]
    TooLong(usize),
}

/// Nesting limit for parentheses, calls and prefix operators
pub const MAX_DEPTH: usize = 64;
/// Bounds the length of left-associative chains, which nest in the tree
pub const MAX_TOKENS: usize = 4096;

type Result<T> = std::result::Result<T, ExprError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Name(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Str(s) => write!(f, "string '{}'", s),
            Token::Name(n) => write!(f, "name '{}'", n),
            Token::Op(op) => write!(f, "'{}'", op),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
        }
    }
}

const OPERATORS: [&str; 19] = [
    "**", "//", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "and", "or", "not",
];

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal.parse().map_err(|_| ExprError::InvalidNumber(literal.clone()))?;
            tokens.push(Token::Number(value));
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(ExprError::UnterminatedString),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars.get(i + 1).ok_or(ExprError::UnterminatedString)?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            match OPERATORS.iter().find(|op| **op == name) {
                Some(op) => tokens.push(Token::Op(*op)),
                None => tokens.push(Token::Name(name)),
            }
            continue;
        }

        match c {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = OPERATORS
                    .iter()
                    .filter(|op| !op.chars().all(char::is_alphabetic))
                    .find(|op| rest.starts_with(*op))
                    .ok_or(ExprError::UnexpectedChar(c, i))?;
                tokens.push(Token::Op(*op));
                i += op.len();
                continue;
            }
        }
        i += 1;
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    fn comparison(op: &str) -> Option<Self> {
        Some(match op {
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            _ => return None,
        })
    }
}

/// Whitelisted functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Min,
    Max,
    Abs,
    Round,
    Floor,
    Ceil,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Pow,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let name = name.strip_prefix("math.").unwrap_or(name);
        Some(match name {
            "min" => Function::Min,
            "max" => Function::Max,
            "abs" => Function::Abs,
            "round" => Function::Round,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "sqrt" => Function::Sqrt,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "pow" => Function::Pow,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Sqrt => "sqrt",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Pow => "pow",
        }
    }

    fn check_arity(self, got: usize) -> Result<()> {
        let (ok, expected) = match self {
            Function::Min | Function::Max => (got >= 1, "at least 1"),
            Function::Round => (got == 1 || got == 2, "1 or 2"),
            Function::Pow => (got == 2, "2"),
            _ => (got == 1, "1"),
        };
        if ok {
            Ok(())
        } else {
            Err(ExprError::Arity { name: self.name(), expected, got })
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Function::Abs => args[0].abs(),
            Function::Round => {
                let scale = 10f64.powi(args.get(1).copied().unwrap_or(0.0) as i32);
                (args[0] * scale).round() / scale
            }
            Function::Floor => args[0].floor(),
            Function::Ceil => args[0].ceil(),
            Function::Sqrt => args[0].sqrt(),
            Function::Sin => args[0].sin(),
            Function::Cos => args[0].cos(),
            Function::Tan => args[0].tan(),
            Function::Exp => args[0].exp(),
            Function::Log => args[0].ln(),
            Function::Pow => args[0].powf(args[1]),
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(SampleValue),
    Name(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        let op = match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => *op,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn expect(&mut self, expected: Token, label: &'static str) -> Result<()> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(ExprError::UnexpectedToken { found: t.to_string(), expected: label }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn or(&mut self) -> Result<Expr> {
        self.nested(Self::or_chain)
    }

    fn or_chain(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat_op(&["or", "||"]).is_some() {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.not()?;
        while self.eat_op(&["and", "&&"]).is_some() {
            let right = self.not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.eat_op(&["not", "!"]).is_some() {
            let inner = self.nested(Self::not)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr> {
        let first = self.sum()?;
        let mut chain: Option<Expr> = None;
        let mut left = first.clone();

        while let Some(op) = self.eat_op(&["==", "!=", "<", "<=", ">", ">="]) {
            let op = BinaryOp::comparison(op).ok_or(ExprError::UnexpectedEnd)?;
            let right = self.sum()?;
            let link = Expr::Binary(op, Box::new(left), Box::new(right.clone()));
            chain = Some(match chain {
                None => link,
                Some(prev) => Expr::Binary(BinaryOp::And, Box::new(prev), Box::new(link)),
            });
            left = right;
        }

        Ok(chain.unwrap_or(first))
    }

    fn sum(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.term()?;
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "//", "%"]) {
            let right = self.unary()?;
            let op = match op {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "//" => BinaryOp::FloorDiv,
                _ => BinaryOp::Mod,
            };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.eat_op(&["-", "+"]) {
            Some("-") => Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.nested(Self::unary)?))),
            Some(_) => self.nested(Self::unary),
            None => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.primary()?;
        if self.eat_op(&["**"]).is_some() {
            let exponent = self.nested(Self::unary)?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next().ok_or(ExprError::UnexpectedEnd)? {
            Token::Number(n) => Ok(Expr::Literal(SampleValue::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(SampleValue::Text(s))),
            Token::LParen => {
                let inner = self.or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Name(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let function = Function::lookup(&name).ok_or(ExprError::UnknownFunction(name))?;
                    let args = self.arguments()?;
                    function.check_arity(args.len())?;
                    return Ok(Expr::Call(function, args));
                }
                Ok(match name.as_str() {
                    "true" | "True" => Expr::Literal(SampleValue::Bool(true)),
                    "false" | "False" => Expr::Literal(SampleValue::Bool(false)),
                    "null" | "None" => Expr::Literal(SampleValue::Null),
                    _ => Expr::Name(name),
                })
            }
            other => Err(ExprError::UnexpectedToken { found: other.to_string(), expected: "a value" }),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.or()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(t) => return Err(ExprError::UnexpectedToken { found: t.to_string(), expected: "',' or ')'" }),
                None => return Err(ExprError::UnexpectedEnd),
            }
        }
    }
}

fn constant(name: &str) -> Option<f64> {
    match name.strip_prefix("math.").unwrap_or(name) {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        "inf" => Some(f64::INFINITY),
        _ => None,
    }
}

fn numbers(op: BinaryOp, left: &SampleValue, right: &SampleValue) -> Result<(f64, f64)> {
    match (left, right) {
        (SampleValue::Number(_) | SampleValue::Bool(_), SampleValue::Number(_) | SampleValue::Bool(_)) => {
            Ok((left.as_f64().unwrap_or(0.0), right.as_f64().unwrap_or(0.0)))
        }
        _ => Err(ExprError::TypeMismatch {
            op: op.symbol(),
            left: left.type_name(),
            right: right.type_name(),
        }),
    }
}

fn loosely_equal(left: &SampleValue, right: &SampleValue) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExprError::UnexpectedEnd);
        }
        if tokens.len() > MAX_TOKENS {
            return Err(ExprError::TooLong(MAX_TOKENS));
        }
        let mut parser = Parser { tokens, pos: 0, depth: 0 };
        let expr = parser.or()?;
        match parser.next() {
            None => Ok(expr),
            Some(t) => Err(ExprError::UnexpectedToken { found: t.to_string(), expected: "end of expression" }),
        }
    }

    pub fn eval(&self, scope: &HashMap<String, SampleValue>) -> Result<SampleValue> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Name(name) => scope
                .get(name)
                .cloned()
                .or_else(|| constant(name).map(SampleValue::Number))
                .ok_or_else(|| ExprError::UnknownName(name.clone())),
            Expr::Unary(UnaryOp::Not, inner) => Ok(SampleValue::Bool(!inner.eval(scope)?.truthy())),
            Expr::Unary(UnaryOp::Neg, inner) => match inner.eval(scope)? {
                v @ (SampleValue::Number(_) | SampleValue::Bool(_)) => {
                    Ok(SampleValue::Number(-v.as_f64().unwrap_or(0.0)))
                }
                v => Err(ExprError::TypeMismatch { op: "-", left: "", right: v.type_name() }),
            },
            Expr::Binary(BinaryOp::And, l, r) => {
                let left = l.eval(scope)?;
                if left.truthy() {
                    r.eval(scope)
                } else {
                    Ok(left)
                }
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                let left = l.eval(scope)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    r.eval(scope)
                }
            }
            Expr::Binary(op, l, r) => {
                let left = l.eval(scope)?;
                let right = r.eval(scope)?;
                Self::binary(*op, &left, &right)
            }
            Expr::Call(function, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let v = arg.eval(scope)?;
                    let n = v.as_f64().ok_or(ExprError::TypeMismatch {
                        op: function.name(),
                        left: v.type_name(),
                        right: "",
                    })?;
                    values.push(n);
                }
                Ok(SampleValue::Number(function.apply(&values)))
            }
        }
    }

    fn binary(op: BinaryOp, left: &SampleValue, right: &SampleValue) -> Result<SampleValue> {
        use BinaryOp::*;

        match op {
            Eq => return Ok(SampleValue::Bool(loosely_equal(left, right))),
            Ne => return Ok(SampleValue::Bool(!loosely_equal(left, right))),
            Add => {
                if let (SampleValue::Text(a), SampleValue::Text(b)) = (left, right) {
                    return Ok(SampleValue::Text(format!("{}{}", a, b)));
                }
            }
            Lt | Le | Gt | Ge => {
                if let (SampleValue::Text(a), SampleValue::Text(b)) = (left, right) {
                    let ord = a.cmp(b);
                    return Ok(SampleValue::Bool(match op {
                        Lt => ord.is_lt(),
                        Le => ord.is_le(),
                        Gt => ord.is_gt(),
                        _ => ord.is_ge(),
                    }));
                }
            }
            _ => {}
        }

        let (a, b) = numbers(op, left, right)?;
        let value = match op {
            Add => SampleValue::Number(a + b),
            Sub => SampleValue::Number(a - b),
            Mul => SampleValue::Number(a * b),
            Pow => SampleValue::Number(a.powf(b)),
            Div | FloorDiv | Mod if b == 0.0 => return Err(ExprError::DivisionByZero),
            Div => SampleValue::Number(a / b),
            FloorDiv => SampleValue::Number((a / b).floor()),
            Mod => SampleValue::Number(a - b * (a / b).floor()),
            Lt => SampleValue::Bool(a < b),
            Le => SampleValue::Bool(a <= b),
            Gt => SampleValue::Bool(a > b),
            Ge => SampleValue::Bool(a >= b),
            Eq | Ne | And | Or => unreachable!("handled above"),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, SampleValue)]) -> HashMap<String, SampleValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn eval(src: &str, scope: &HashMap<String, SampleValue>) -> SampleValue {
        Expr::parse(src).unwrap().eval(scope).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        let s = HashMap::new();
        assert_eq!(eval("1 + 2 * 3", &s), SampleValue::Number(7.0));
        assert_eq!(eval("(1 + 2) * 3", &s), SampleValue::Number(9.0));
        assert_eq!(eval("-2 ** 2", &s), SampleValue::Number(-4.0));
        assert_eq!(eval("2 ** -1", &s), SampleValue::Number(0.5));
        assert_eq!(eval("7 // 2 + -7 % 3", &s), SampleValue::Number(5.0));
        assert_eq!(eval("1.5e2", &s), SampleValue::Number(150.0));
    }

    #[test]
    fn test_comparisons_and_logic() {
        let s = scope(&[("temp", 105.0.into()), ("door", true.into()), ("mode", "auto".into())]);
        assert_eq!(eval("temp > 100 and door", &s), SampleValue::Bool(true));
        assert_eq!(eval("temp > 100 && !door", &s), SampleValue::Bool(false));
        assert_eq!(eval("not (temp < 50) or false", &s), SampleValue::Bool(true));
        assert_eq!(eval("mode == 'auto'", &s), SampleValue::Bool(true));
        assert_eq!(eval("0 < temp < 100", &s), SampleValue::Bool(false));
        assert_eq!(eval("door == 1", &s), SampleValue::Bool(true));
    }

    #[test]
    fn test_functions_and_constants() {
        let s = scope(&[("x", (-3.0).into())]);
        assert_eq!(eval("abs(x)", &s), SampleValue::Number(3.0));
        assert_eq!(eval("max(x, 2, 1)", &s), SampleValue::Number(2.0));
        assert_eq!(eval("min(x, 0)", &s), SampleValue::Number(-3.0));
        assert_eq!(eval("round(3.14159, 2)", &s), SampleValue::Number(3.14));
        let SampleValue::Number(v) = eval("math.sin(math.pi / 2)", &s) else { panic!() };
        assert!((v - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_code_and_unknowns() {
        assert!(matches!(Expr::parse("__import__('os')"), Err(ExprError::UnknownFunction(_))));
        assert!(matches!(Expr::parse("x = 1"), Err(ExprError::UnexpectedChar('=', _))));
        assert!(matches!(Expr::parse("1 +"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(Expr::parse("(1"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(Expr::parse("1 2"), Err(ExprError::UnexpectedToken { .. })));
        assert!(matches!(Expr::parse("'open"), Err(ExprError::UnterminatedString)));
        assert!(matches!(Expr::parse("sqrt(1, 2)"), Err(ExprError::Arity { .. })));

        let empty = HashMap::new();
        let missing = Expr::parse("y + 1").unwrap().eval(&empty);
        assert_eq!(missing, Err(ExprError::UnknownName("y".into())));
        let zero = Expr::parse("1 / 0").unwrap().eval(&empty);
        assert_eq!(zero, Err(ExprError::DivisionByZero));
        let mixed = Expr::parse("'a' * 2").unwrap().eval(&empty);
        assert!(matches!(mixed, Err(ExprError::TypeMismatch { .. })));
    }

    #[test]
    fn test_string_concat() {
        let s = scope(&[("unit", "C".into())]);
        assert_eq!(eval("\"deg \" + unit", &s), SampleValue::Text("deg C".into()));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let s = scope(&[("x", 2.0.into())]);
        let nested = |depth: usize| format!("{}x{}", "(".repeat(depth), ")".repeat(depth));

        assert_eq!(eval(&nested(40), &s), SampleValue::Number(2.0));
        assert_eq!(Expr::parse(&nested(100)), Err(ExprError::TooDeep(MAX_DEPTH)));
        assert!(Expr::parse(&nested(10_000)).is_err());
        assert_eq!(Expr::parse(&"not ".repeat(200)), Err(ExprError::TooDeep(MAX_DEPTH)));
        assert_eq!(Expr::parse(&format!("{}1", "-".repeat(200))), Err(ExprError::TooDeep(MAX_DEPTH)));

        let long = vec!["1"; 3000].join(" + ");
        assert_eq!(Expr::parse(&long), Err(ExprError::TooLong(MAX_TOKENS)));
    }
}
