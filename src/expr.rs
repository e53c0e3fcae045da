//! Typed arithmetic expressions for compound-movement formulas.
//!
//! Formulas are written in a small JavaScript-like syntax, e.g.
//! `primary < 100 ? -1.9 * deltaPrimary : 0.4 * deltaPrimary` or
//! `Math.sin(primary * (Math.PI / 180))`. They are parsed once at
//! configuration time into an [`Expr`] tree and checked against the set of
//! variables the formula is allowed to read; evaluation is then a pure walk
//! over the tree.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! cond    := or ('?' cond ':' cond)?
//! or      := and ('||' and)*
//! and     := eq ('&&' eq)*
//! eq      := rel (('==' | '!=') rel)*
//! rel     := add (('<' | '<=' | '>' | '>=') add)*
//! add     := mul (('+' | '-') mul)*
//! mul     := unary (('*' | '/' | '%') unary)*
//! unary   := ('-' | '+' | '!') unary | atom
//! atom    := number | ident | ident '(' args ')' | '(' cond ')'
//! ```

use std::fmt;

use crate::error::ConfigError;

/// A variable a formula may read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Var {
    /// Current angle of the primary joint.
    Primary,
    /// Current angle of the dependent joint.
    Dependent,
    /// Signed delta applied to the primary joint this tick.
    DeltaPrimary,
}

impl Var {
    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "primary" => Some(Var::Primary),
            "dependent" => Some(Var::Dependent),
            "deltaPrimary" => Some(Var::DeltaPrimary),
            _ => None,
        }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Var::Primary => "primary",
            Var::Dependent => "dependent",
            Var::DeltaPrimary => "deltaPrimary",
        };
        f.write_str(name)
    }
}

/// Variables available to a dependent joint's formula.
pub const DEPENDENT_VARS: &[Var] = &[Var::Primary, Var::Dependent, Var::DeltaPrimary];

/// Variables available to a primary-direction formula.
pub const PRIMARY_VARS: &[Var] = &[Var::Primary];

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Abs,
    Sqrt,
    Sign,
    Min,
    Max,
}

impl Func {
    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "sin" => Some(Func::Sin),
            "cos" => Some(Func::Cos),
            "tan" => Some(Func::Tan),
            "abs" => Some(Func::Abs),
            "sqrt" => Some(Func::Sqrt),
            "sign" => Some(Func::Sign),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            _ => None,
        }
    }

    fn arity_ok(&self, n: usize) -> bool {
        match self {
            Func::Min | Func::Max => n >= 1,
            _ => n == 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(Var),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

/// Values bound to the formula variables for one evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bindings {
    pub primary: f64,
    pub dependent: f64,
    pub delta_primary: f64,
}

impl Bindings {
    fn get(&self, var: Var) -> f64 {
        match var {
            Var::Primary => self.primary,
            Var::Dependent => self.dependent,
            Var::DeltaPrimary => self.delta_primary,
        }
    }
}

fn truthy(v: f64) -> bool {
    v != 0.0 && !v.is_nan()
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl Expr {
    pub fn eval(&self, b: &Bindings) -> f64 {
        match self {
            Expr::Num(n) => *n,
            Expr::Var(v) => b.get(*v),
            Expr::Unary(UnaryOp::Neg, e) => -e.eval(b),
            Expr::Unary(UnaryOp::Not, e) => bool_value(!truthy(e.eval(b))),
            Expr::Binary(op, l, r) => {
                // Short-circuit the logical operators like the source syntax does.
                match op {
                    BinOp::And => {
                        let lv = l.eval(b);
                        return if truthy(lv) { r.eval(b) } else { lv };
                    }
                    BinOp::Or => {
                        let lv = l.eval(b);
                        return if truthy(lv) { lv } else { r.eval(b) };
                    }
                    _ => {}
                }
                let (lv, rv) = (l.eval(b), r.eval(b));
                match op {
                    BinOp::Add => lv + rv,
                    BinOp::Sub => lv - rv,
                    BinOp::Mul => lv * rv,
                    BinOp::Div => lv / rv,
                    BinOp::Rem => lv % rv,
                    BinOp::Lt => bool_value(lv < rv),
                    BinOp::Le => bool_value(lv <= rv),
                    BinOp::Gt => bool_value(lv > rv),
                    BinOp::Ge => bool_value(lv >= rv),
                    BinOp::Eq => bool_value(lv == rv),
                    BinOp::Ne => bool_value(lv != rv),
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                }
            }
            Expr::Cond(c, t, e) => {
                if truthy(c.eval(b)) {
                    t.eval(b)
                } else {
                    e.eval(b)
                }
            }
            Expr::Call(func, args) => {
                let first = args.first().map(|a| a.eval(b)).unwrap_or(f64::NAN);
                match func {
                    Func::Sin => first.sin(),
                    Func::Cos => first.cos(),
                    Func::Tan => first.tan(),
                    Func::Abs => first.abs(),
                    Func::Sqrt => first.sqrt(),
                    Func::Sign => {
                        if first == 0.0 || first.is_nan() {
                            first
                        } else {
                            first.signum()
                        }
                    }
                    Func::Min => args.iter().map(|a| a.eval(b)).fold(f64::INFINITY, f64::min),
                    Func::Max => args
                        .iter()
                        .map(|a| a.eval(b))
                        .fold(f64::NEG_INFINITY, f64::max),
                }
            }
        }
    }

    fn visit_vars(&self, f: &mut impl FnMut(Var)) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(v) => f(*v),
            Expr::Unary(_, e) => e.visit_vars(f),
            Expr::Binary(_, l, r) => {
                l.visit_vars(f);
                r.visit_vars(f);
            }
            Expr::Cond(c, t, e) => {
                c.visit_vars(f);
                t.visit_vars(f);
                e.visit_vars(f);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.visit_vars(f)),
        }
    }
}

/// A parsed, variable-checked formula together with its source text.
#[derive(Clone, Debug, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse `source` and reject any variable not in `allowed`.
    pub fn parse(source: &str, allowed: &[Var]) -> Result<Self, ConfigError> {
        let tokens = tokenize(source).map_err(|reason| malformed(source, reason))?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.cond()?;
        if parser.pos != parser.tokens.len() {
            return Err(malformed(
                source,
                format!("unexpected {:?}", parser.tokens[parser.pos]),
            ));
        }

        let mut bad = None;
        expr.visit_vars(&mut |v| {
            if bad.is_none() && !allowed.contains(&v) {
                bad = Some(v);
            }
        });
        if let Some(v) = bad {
            return Err(ConfigError::UnknownVariable {
                formula: source.to_string(),
                variable: v.to_string(),
            });
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn eval(&self, bindings: &Bindings) -> f64 {
        self.expr.eval(bindings)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

fn malformed(source: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::MalformedFormula {
        formula: source.to_string(),
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
    "?", ":", "(", ")", ",",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    'outer: while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                i += 1;
                if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
                    i += 1;
                }
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text = &src[start..i];
            let n = text
                .parse::<f64>()
                .map_err(|_| format!("bad number {text:?}"))?;
            tokens.push(Token::Num(n));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(src[start..i].to_string()));
            continue;
        }

        for op in OPERATORS {
            if src[i..].starts_with(op) {
                // Strict and loose equality behave the same on numbers.
                let normalized = match *op {
                    "===" => "==",
                    "!==" => "!=",
                    other => other,
                };
                tokens.push(Token::Op(normalized));
                i += op.len();
                continue 'outer;
            }
        }

        return Err(format!("unexpected character {:?} at {}", c as char, i));
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn eat(&mut self, op: &str) -> bool {
        if self.peek_op() == Some(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> Result<(), ConfigError> {
        if self.eat(op) {
            Ok(())
        } else {
            Err(malformed(self.source, format!("expected {op:?}")))
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, ConfigError>,
    ) -> Result<Expr, ConfigError> {
        let mut lhs = next(self)?;
        'scan: loop {
            for (text, op) in ops {
                if self.eat(text) {
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'scan;
                }
            }
            return Ok(lhs);
        }
    }

    fn cond(&mut self) -> Result<Expr, ConfigError> {
        let test = self.or()?;
        if self.eat("?") {
            let then = self.cond()?;
            self.expect(":")?;
            let otherwise = self.cond()?;
            return Ok(Expr::Cond(Box::new(test), Box::new(then), Box::new(otherwise)));
        }
        Ok(test)
    }

    fn or(&mut self) -> Result<Expr, ConfigError> {
        self.binary_level(&[("||", BinOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ConfigError> {
        self.binary_level(&[("&&", BinOp::And)], Self::eq)
    }

    fn eq(&mut self) -> Result<Expr, ConfigError> {
        self.binary_level(&[("==", BinOp::Eq), ("!=", BinOp::Ne)], Self::rel)
    }

    fn rel(&mut self) -> Result<Expr, ConfigError> {
        self.binary_level(
            &[
                ("<=", BinOp::Le),
                (">=", BinOp::Ge),
                ("<", BinOp::Lt),
                (">", BinOp::Gt),
            ],
            Self::add,
        )
    }

    fn add(&mut self) -> Result<Expr, ConfigError> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::mul)
    }

    fn mul(&mut self) -> Result<Expr, ConfigError> {
        self.binary_level(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ConfigError> {
        if self.eat("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat("+") {
            return self.unary();
        }
        if self.eat("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, ConfigError> {
        let Some(token) = self.tokens.get(self.pos).cloned() else {
            return Err(malformed(self.source, "unexpected end of formula"));
        };
        self.pos += 1;

        match token {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::Op("(") => {
                let inner = self.cond()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Op(op) => Err(malformed(self.source, format!("unexpected {op:?}"))),
            Token::Ident(ident) => {
                let name = ident.strip_prefix("Math.").unwrap_or(&ident);
                if self.eat("(") {
                    let func = Func::from_ident(name)
                        .ok_or_else(|| malformed(self.source, format!("unknown function {ident:?}")))?;
                    let mut args = Vec::new();
                    if !self.eat(")") {
                        loop {
                            args.push(self.cond()?);
                            if self.eat(")") {
                                break;
                            }
                            self.expect(",")?;
                        }
                    }
                    if !func.arity_ok(args.len()) {
                        return Err(malformed(
                            self.source,
                            format!("wrong number of arguments to {ident:?}"),
                        ));
                    }
                    return Ok(Expr::Call(func, args));
                }

                match name {
                    "PI" => return Ok(Expr::Num(std::f64::consts::PI)),
                    "E" => return Ok(Expr::Num(std::f64::consts::E)),
                    "true" => return Ok(Expr::Num(1.0)),
                    "false" => return Ok(Expr::Num(0.0)),
                    _ => {}
                }

                Var::from_ident(&ident).map(Expr::Var).ok_or_else(|| {
                    ConfigError::UnknownVariable {
                        formula: self.source.to_string(),
                        variable: ident.clone(),
                    }
                })
            }
        }
    }
}
