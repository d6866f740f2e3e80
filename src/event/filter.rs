//! Subscription filters
//!
//! A filter is a list of expressions, all of which must hold for an event to
//! be delivered. Grammar:
//!
//! ```text
//! expr     := and_expr ("or" and_expr)*
//! and_expr := term ("and" term)*
//! term     := "(" expr ")" | operand cmp operand
//! operand  := $current | $quality | $counter | $error | number
//! cmp      := == | != | < | <= | > | >=
//! ```
//!
//! `&&` and `||` are accepted as spellings of `and` / `or`. A comparison with
//! a variable the event does not carry is false. Error events are always
//! delivered unless some expression mentions `$error`.

use super::data::{EventData, EventPayload};
use crate::error::{Error, Result};

/// Variables an expression can read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    Current,
    Quality,
    Counter,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand {
    Var(Var),
    Num(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Cmp(Operand, CmpOp, Operand),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, ctx: &Context) -> bool {
        match self {
            Expr::Cmp(a, op, b) => match (ctx.resolve(*a), ctx.resolve(*b)) {
                (Some(a), Some(b)) => op.apply(a, b),
                _ => false,
            },
            Expr::And(a, b) => a.eval(ctx) && b.eval(ctx),
            Expr::Or(a, b) => a.eval(ctx) || b.eval(ctx),
        }
    }

    fn mentions(&self, var: Var) -> bool {
        match self {
            Expr::Cmp(a, _, b) => *a == Operand::Var(var) || *b == Operand::Var(var),
            Expr::And(a, b) | Expr::Or(a, b) => a.mentions(var) || b.mentions(var),
        }
    }
}

struct Context {
    current: Option<f64>,
    quality: Option<f64>,
    counter: Option<f64>,
    error: f64,
}

impl Context {
    fn of(event: &EventData) -> Self {
        let (current, quality) = match &event.payload {
            EventPayload::Value(v) => (v.data.first_f64(), Some(v.quality.code() as f64)),
            _ => (None, None),
        };
        let counter = event.data_ready().map(|d| d.ctr as f64);
        Self {
            current,
            quality,
            counter,
            error: if event.is_error() { 1.0 } else { 0.0 },
        }
    }

    fn resolve(&self, operand: Operand) -> Option<f64> {
        match operand {
            Operand::Num(n) => Some(n),
            Operand::Var(Var::Current) => self.current,
            Operand::Var(Var::Quality) => self.quality,
            Operand::Var(Var::Counter) => self.counter,
            Operand::Var(Var::Error) => Some(self.error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(Var),
    Num(f64),
    Op(CmpOp),
    And,
    Or,
    LParen,
    RParen,
}

fn invalid(expr: &str, why: impl std::fmt::Display) -> Error {
    Error::precondition("API_InvalidFilter", format!("{}: {:?}", why, expr))
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, eq) {
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    ('<', true) => CmpOp::Le,
                    ('>', true) => CmpOp::Ge,
                    ('<', false) => CmpOp::Lt,
                    ('>', false) => CmpOp::Gt,
                    _ => return Err(invalid(expr, format!("bad operator at {}", i))),
                };
                tokens.push(Token::Op(op));
                i += if eq { 2 } else { 1 };
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(invalid(expr, format!("bad operator at {}", i)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let var = match name.to_ascii_lowercase().as_str() {
                    "current" => Var::Current,
                    "quality" => Var::Quality,
                    "counter" => Var::Counter,
                    "error" => Var::Error,
                    _ => return Err(invalid(expr, format!("unknown variable ${}", name))),
                };
                tokens.push(Token::Var(var));
                i = end;
            }
            c if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' => {
                let start = i;
                let mut end = i + 1;
                while end < chars.len()
                    && (chars[end].is_ascii_digit()
                        || chars[end] == '.'
                        || chars[end] == 'e'
                        || chars[end] == 'E'
                        || ((chars[end] == '-' || chars[end] == '+')
                            && matches!(chars[end - 1], 'e' | 'E')))
                {
                    end += 1;
                }
                let text: String = chars[start..end].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| invalid(expr, format!("bad number {}", text)))?;
                tokens.push(Token::Num(n));
                i = end;
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                let mut end = i;
                while end < chars.len() && chars[end].is_ascii_alphabetic() {
                    end += 1;
                }
                let word: String = chars[start..end].iter().collect();
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    _ => return Err(invalid(expr, format!("unexpected word {}", word))),
                }
                i = end;
            }
            _ => return Err(invalid(expr, format!("unexpected character {:?}", c))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse(mut self) -> Result<Expr> {
        let expr = self.or_expr()?;
        if self.pos != self.tokens.len() {
            return Err(invalid(self.source, "trailing tokens"));
        }
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.term()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or_expr()?;
            if self.next() != Some(Token::RParen) {
                return Err(invalid(self.source, "missing )"));
            }
            return Ok(inner);
        }
        let a = self.operand()?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => return Err(invalid(self.source, "expected comparison")),
        };
        let b = self.operand()?;
        Ok(Expr::Cmp(a, op, b))
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Var(v)) => Ok(Operand::Var(v)),
            Some(Token::Num(n)) => Ok(Operand::Num(n)),
            _ => Err(invalid(self.source, "expected variable or number")),
        }
    }
}

/// Compiled filter of one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    exprs: Vec<Expr>,
    source: Vec<String>,
}

impl EventFilter {
    /// Compile a filter list; empty or blank lists yield `None`
    pub fn parse(filters: &[String]) -> Result<Option<Self>> {
        let mut exprs = Vec::new();
        let mut source = Vec::new();
        for f in filters.iter().filter(|f| !f.trim().is_empty()) {
            let tokens = tokenize(f)?;
            let parser = Parser {
                tokens,
                pos: 0,
                source: f,
            };
            exprs.push(parser.parse()?);
            source.push(f.clone());
        }
        if exprs.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Self { exprs, source }))
        }
    }

    /// Original expression strings
    pub fn expressions(&self) -> &[String] {
        &self.source
    }

    /// Whether the event should be delivered
    pub fn matches(&self, event: &EventData) -> bool {
        if event.is_error() && !self.exprs.iter().any(|e| e.mentions(Var::Error)) {
            return true;
        }
        let ctx = Context::of(event);
        self.exprs.iter().all(|e| e.eval(&ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::EventType;
    use crate::wire::value::{AttributeValue, DataReady, DevError, Quality};

    fn filter(exprs: &[&str]) -> EventFilter {
        let list: Vec<String> = exprs.iter().map(|s| s.to_string()).collect();
        EventFilter::parse(&list).unwrap().unwrap()
    }

    fn value_event(v: f64, q: Quality) -> EventData {
        EventData::new(
            "sys/tg/1",
            "ampli",
            "p/sys/tg/1/ampli.change",
            EventType::Change,
            EventPayload::Value(AttributeValue::double("ampli", v, q)),
        )
    }

    #[test]
    fn test_simple_comparison() {
        let f = filter(&["$current > 10"]);
        assert!(f.matches(&value_event(11.0, Quality::Valid)));
        assert!(!f.matches(&value_event(10.0, Quality::Valid)));
    }

    #[test]
    fn test_and_or_parentheses() {
        let f = filter(&["($current >= 5 and $current <= 6) or $quality == 2"]);
        assert!(f.matches(&value_event(5.5, Quality::Valid)));
        assert!(f.matches(&value_event(100.0, Quality::Alarm)));
        assert!(!f.matches(&value_event(100.0, Quality::Valid)));

        let f = filter(&["$current < -1 || $current > 1.5e1"]);
        assert!(f.matches(&value_event(-2.0, Quality::Valid)));
        assert!(f.matches(&value_event(16.0, Quality::Valid)));
        assert!(!f.matches(&value_event(0.0, Quality::Valid)));
    }

    #[test]
    fn test_list_is_and_combined() {
        let f = filter(&["$current > 0", "$quality != 1"]);
        assert!(f.matches(&value_event(1.0, Quality::Valid)));
        assert!(!f.matches(&value_event(1.0, Quality::Invalid)));
    }

    #[test]
    fn test_counter_on_data_ready() {
        let f = filter(&["$counter >= 3"]);
        let mut event = value_event(0.0, Quality::Valid);
        event.event_type = EventType::DataReady;
        event.payload = EventPayload::DataReady(DataReady {
            name: "ampli".into(),
            data_type: 4,
            ctr: 3,
        });
        assert!(f.matches(&event));

        // no counter on a value event
        assert!(!f.matches(&value_event(5.0, Quality::Valid)));
    }

    #[test]
    fn test_error_events() {
        let mut event = value_event(0.0, Quality::Valid);
        event.payload = EventPayload::Error(vec![DevError::new("API_X", "x", "y")]);

        assert!(filter(&["$current > 10"]).matches(&event));
        assert!(!filter(&["$error == 0"]).matches(&event));
        assert!(filter(&["$error == 1"]).matches(&event));
    }

    #[test]
    fn test_blank_list_is_no_filter() {
        assert!(EventFilter::parse(&[]).unwrap().is_none());
        assert!(EventFilter::parse(&["  ".to_string()]).unwrap().is_none());
    }

    #[test]
    fn test_invalid_filters() {
        for bad in [
            "$current >",
            "$voltage > 1",
            "$current = 1",
            "($current > 1",
            "$current > 1 xor 2",
            "$current > 1 2",
            "# $current",
        ] {
            let err = EventFilter::parse(&[bad.to_string()]).unwrap_err();
            assert_eq!(err.reason(), "API_InvalidFilter", "{}", bad);
        }
    }
}
