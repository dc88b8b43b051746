//! Small expression language for `expr:` filename templates.
//!
//! ```text
//! expr:rating == "explicit" ? "nsfw/" + md5 + "." + ext : lower(artist) + "/" + id + "." + ext
//! ```
//!
//! Only literals, record fields, arithmetic, comparisons, boolean logic, the ternary operator
//! and a handful of string functions (`len`, `lower`, `upper`, `replace`, `contains`) exist.
//! Scripts can't loop, assign or reach anything outside the fields they are given.
use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (at {position})")]
pub struct ScriptError {
    pub position: usize,
    pub message: String,
}

impl ScriptError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Self::Str(s) => !s.is_empty(),
            Self::Num(n) => *n != 0.0,
            Self::Bool(b) => *b,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Num(n) => write!(f, "{}", n),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
}

const OPERATORS: [&str; 16] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", "?", ":",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ScriptError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let num = text
                .parse()
                .map_err(|_| ScriptError::new(start, format!("invalid number '{}'", text)))?;
            tokens.push((start, Token::Num(num)));
            continue;
        }

        if c == '"' || c == '\'' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(ScriptError::new(start, "unterminated string")),
                    Some('\\') => {
                        if let Some(next) = chars.get(i + 1) {
                            text.push(*next);
                        }
                        i += 2;
                    }
                    Some(ch) if *ch == c => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push((start, Token::Str(text)));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            continue;
        }

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(**op))
                    .ok_or_else(|| ScriptError::new(start, format!("unexpected '{}'", c)))?;
                i += op.chars().count();
                tokens.push((
                    start,
                    match *op {
                        "?" => Token::Question,
                        ":" => Token::Colon,
                        op => Token::Op(op),
                    },
                ));
                continue;
            }
        };
        tokens.push((start, token));
        i += 1;
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Field(usize, String),
    Unary(usize, &'static str, Box<Node>),
    Binary(usize, &'static str, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Call(usize, String, Vec<Node>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(o, _)| *o)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ScriptError> {
        let offset = self.offset();
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            _ => Err(ScriptError::new(offset, format!("expected {}", what))),
        }
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<(usize, &'static str)> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let found = (self.offset(), *op);
                self.pos += 1;
                Some(found)
            }
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<Node, ScriptError> {
        let cond = self.binary(0)?;
        if self.peek() == Some(&Token::Question) {
            self.pos += 1;
            let then = self.expr()?;
            self.expect(&Token::Colon, "':'")?;
            let otherwise = self.expr()?;
            return Ok(Node::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        Ok(cond)
    }

    /// Precedence climbing over the binary operator levels.
    fn binary(&mut self, level: usize) -> Result<Node, ScriptError> {
        const LEVELS: [&[&str]; 5] = [
            &["||"],
            &["&&"],
            &["==", "!=", "<=", ">=", "<", ">"],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut lhs = self.binary(level + 1)?;
        while let Some((offset, op)) = self.eat_op(LEVELS[level]) {
            let rhs = self.binary(level + 1)?;
            lhs = Node::Binary(offset, op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node, ScriptError> {
        if let Some((offset, op)) = self.eat_op(&["!", "-"]) {
            return Ok(Node::Unary(offset, op, Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, ScriptError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Num(n)) => Ok(Node::Literal(Value::Num(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::Str(s))),
            Some(Token::Ident(name)) if name == "true" || name == "false" => {
                Ok(Node::Literal(Value::Bool(name == "true")))
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Node::Field(offset, name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(Node::Call(offset, name, args))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(_) => Err(ScriptError::new(offset, "unexpected token")),
            None => Err(ScriptError::new(offset, "unexpected end of script")),
        }
    }
}

/// A parsed script. Fields are resolved at evaluation time through a lookup function.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    source: String,
    root: Node,
}

impl Script {
    pub fn parse(source: &str) -> Result<Self, ScriptError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.chars().count(),
        };
        let root = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(ScriptError::new(parser.offset(), "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of every field the script reads.
    pub fn fields(&self) -> Vec<&str> {
        fn walk<'a>(node: &'a Node, out: &mut Vec<&'a str>) {
            match node {
                Node::Literal(_) => {}
                Node::Field(_, name) => out.push(name),
                Node::Unary(_, _, inner) => walk(inner, out),
                Node::Binary(_, _, a, b) => {
                    walk(a, out);
                    walk(b, out);
                }
                Node::Ternary(a, b, c) => {
                    walk(a, out);
                    walk(b, out);
                    walk(c, out);
                }
                Node::Call(_, _, args) => args.iter().for_each(|a| walk(a, out)),
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    pub fn evaluate(&self, fields: &dyn Fn(&str) -> Option<Value>) -> Result<Value, ScriptError> {
        eval(&self.root, fields)
    }
}

fn number(v: &Value, offset: usize) -> Result<f64, ScriptError> {
    match v {
        Value::Num(n) => Ok(*n),
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| ScriptError::new(offset, format!("'{}' is not a number", s))),
    }
}

fn eval(node: &Node, fields: &dyn Fn(&str) -> Option<Value>) -> Result<Value, ScriptError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Field(offset, name) => {
            fields(name).ok_or_else(|| ScriptError::new(*offset, format!("unknown field '{}'", name)))
        }
        Node::Unary(offset, op, inner) => {
            let v = eval(inner, fields)?;
            match *op {
                "!" => Ok(Value::Bool(!v.truthy())),
                _ => Ok(Value::Num(-number(&v, *offset)?)),
            }
        }
        Node::Ternary(cond, then, otherwise) => {
            if eval(cond, fields)?.truthy() {
                eval(then, fields)
            } else {
                eval(otherwise, fields)
            }
        }
        Node::Binary(offset, op, lhs, rhs) => {
            let a = eval(lhs, fields)?;
            match *op {
                "&&" if !a.truthy() => return Ok(Value::Bool(false)),
                "||" if a.truthy() => return Ok(Value::Bool(true)),
                _ => {}
            }
            let b = eval(rhs, fields)?;
            binary(*offset, op, a, b)
        }
        Node::Call(offset, name, args) => {
            let args = args
                .iter()
                .map(|a| eval(a, fields))
                .collect::<Result<Vec<_>, _>>()?;
            call(*offset, name, &args)
        }
    }
}

fn binary(offset: usize, op: &str, a: Value, b: Value) -> Result<Value, ScriptError> {
    let both_numeric = matches!((&a, &b), (Value::Num(_), Value::Num(_)));
    Ok(match op {
        "&&" | "||" => Value::Bool(b.truthy()),
        "+" if both_numeric => Value::Num(number(&a, offset)? + number(&b, offset)?),
        "+" => Value::Str(format!("{}{}", a, b)),
        "-" => Value::Num(number(&a, offset)? - number(&b, offset)?),
        "*" => Value::Num(number(&a, offset)? * number(&b, offset)?),
        "/" | "%" => {
            let divisor = number(&b, offset)?;
            if divisor == 0.0 {
                return Err(ScriptError::new(offset, "division by zero"));
            }
            let dividend = number(&a, offset)?;
            Value::Num(if op == "/" { dividend / divisor } else { dividend % divisor })
        }
        "==" => Value::Bool(loose_eq(&a, &b)),
        "!=" => Value::Bool(!loose_eq(&a, &b)),
        _ => {
            let ordering = if both_numeric {
                number(&a, offset)?.partial_cmp(&number(&b, offset)?)
            } else {
                Some(a.to_string().cmp(&b.to_string()))
            };
            let Some(ordering) = ordering else {
                return Err(ScriptError::new(offset, "values can't be compared"));
            };
            Value::Bool(match op {
                "<" => ordering.is_lt(),
                ">" => ordering.is_gt(),
                "<=" => ordering.is_le(),
                _ => ordering.is_ge(),
            })
        }
    })
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => a.to_string() == b.to_string(),
    }
}

fn call(offset: usize, name: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(ScriptError::new(
                offset,
                format!("{}() takes {} argument(s), got {}", name, n, args.len()),
            ))
        }
    };
    let text = |i: usize| args[i].to_string();

    match name {
        "len" => {
            arity(1)?;
            Ok(Value::Num(text(0).chars().count() as f64))
        }
        "lower" => {
            arity(1)?;
            Ok(Value::Str(text(0).to_lowercase()))
        }
        "upper" => {
            arity(1)?;
            Ok(Value::Str(text(0).to_uppercase()))
        }
        "replace" => {
            arity(3)?;
            Ok(Value::Str(text(0).replace(&text(1), &text(2))))
        }
        "contains" => {
            arity(2)?;
            Ok(Value::Bool(text(0).contains(&text(1))))
        }
        _ => Err(ScriptError::new(offset, format!("unknown function '{}'", name))),
    }
}
