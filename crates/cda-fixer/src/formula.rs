//! Algebraic formula evaluation over dataset variables.
//!
//! Derived variables are declared as expressions over source variable
//! short names, e.g. `"2*tp-e"` or `"0.-mer"`. Supported operators are
//! `+ - * /` with the usual precedence, plus parentheses. Evaluation is
//! pointwise across matching dimensions.

use cda_common::{DataArray, Dataset};

use crate::error::{FixerError, Result};

/// A parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    BinOp {
        op: Op,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Expr {
    /// Parse a formula string.
    pub fn parse(formula: &str) -> Result<Self> {
        let tokens = tokenize(formula)?;
        let mut parser = Parser {
            formula,
            tokens,
            pos: 0,
        };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(expr)
    }

    /// All variable names referenced by the formula.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars(&self, out: &mut Vec<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::BinOp { lhs, rhs, .. } => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
        }
    }

    /// Evaluate the formula against a dataset, producing an array named
    /// `target`. Fails with `DerivationError` if a referenced variable
    /// is absent.
    pub fn eval(&self, data: &Dataset, target: &str, formula: &str) -> Result<DataArray> {
        match self.eval_value(data, target, formula)? {
            Value::Array(mut arr) => {
                arr.name = target.to_string();
                Ok(arr)
            }
            Value::Scalar(_) => Err(FixerError::FormulaParse {
                formula: formula.to_string(),
                reason: "formula reduces to a constant".to_string(),
            }),
        }
    }

    fn eval_value(&self, data: &Dataset, target: &str, formula: &str) -> Result<Value> {
        match self {
            Expr::Num(x) => Ok(Value::Scalar(*x)),
            Expr::Var(name) => {
                let arr = data
                    .vars
                    .get(name)
                    .ok_or_else(|| FixerError::DerivationError {
                        var: target.to_string(),
                        formula: formula.to_string(),
                        missing: name.clone(),
                    })?;
                Ok(Value::Array(arr.clone()))
            }
            Expr::BinOp { op, lhs, rhs } => {
                let l = lhs.eval_value(data, target, formula)?;
                let r = rhs.eval_value(data, target, formula)?;
                apply_op(*op, l, r)
            }
        }
    }
}

enum Value {
    Scalar(f64),
    Array(DataArray),
}

fn apply_op(op: Op, l: Value, r: Value) -> Result<Value> {
    let f = |a: f64, b: f64| match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div => a / b,
    };
    match (l, r) {
        (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(a, b))),
        (Value::Array(a), Value::Scalar(b)) => Ok(Value::Array(a.map(|x| f(x, b)))),
        (Value::Scalar(a), Value::Array(b)) => Ok(Value::Array(b.map(|x| f(a, x)))),
        (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.zip_with(&b, f)?)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(Op),
    LParen,
    RParen,
}

fn tokenize(formula: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = formula.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Op(Op::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(Op::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(Op::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(Op::Div));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| FixerError::FormulaParse {
                    formula: formula.to_string(),
                    reason: format!("invalid number '{text}'"),
                })?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(FixerError::FormulaParse {
                    formula: formula.to_string(),
                    reason: format!("unexpected character '{other}'"),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    formula: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> FixerError {
        FixerError::FormulaParse {
            formula: self.formula.to_string(),
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    // expr := term (('+'|'-') term)*
    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if matches!(op, Op::Add | Op::Sub) => *op,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // term := factor (('*'|'/') factor)*
    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if matches!(op, Op::Mul | Op::Div) => *op,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // factor := NUM | IDENT | '-' factor | '(' expr ')'
    fn factor(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Num(x)) => Ok(Expr::Num(x)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::Op(Op::Sub)) => {
                let inner = self.factor()?;
                Ok(Expr::BinOp {
                    op: Op::Sub,
                    lhs: Box::new(Expr::Num(0.0)),
                    rhs: Box::new(inner),
                })
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("missing closing parenthesis")),
                }
            }
            _ => Err(self.error("expected number, variable or parenthesis")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cda_common::DataArray;

    fn dataset() -> Dataset {
        let mut ds = Dataset::new();
        ds.insert_var(
            DataArray::new("a", vec!["x".into()], vec![3], vec![1.0, 2.0, 3.0]).unwrap(),
        );
        ds.insert_var(
            DataArray::new("b", vec!["x".into()], vec![3], vec![10.0, 20.0, 30.0]).unwrap(),
        );
        ds
    }

    fn eval(formula: &str) -> Result<DataArray> {
        Expr::parse(formula)?.eval(&dataset(), "out", formula)
    }

    #[test]
    fn test_basic_arithmetic() {
        assert_eq!(eval("a+b").unwrap().values, vec![11.0, 22.0, 33.0]);
        assert_eq!(eval("b-a").unwrap().values, vec![9.0, 18.0, 27.0]);
        assert_eq!(eval("2*a").unwrap().values, vec![2.0, 4.0, 6.0]);
        assert_eq!(eval("b/a").unwrap().values, vec![10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("a+b*2").unwrap().values, vec![21.0, 42.0, 63.0]);
        assert_eq!(eval("(a+b)*2").unwrap().values, vec![22.0, 44.0, 66.0]);
    }

    #[test]
    fn test_unary_negation_idiom() {
        // The conventional way to negate in fix files
        assert_eq!(eval("0.-a").unwrap().values, vec![-1.0, -2.0, -3.0]);
        // Leading minus also accepted
        assert_eq!(eval("-a").unwrap().values, vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn test_missing_variable() {
        let err = eval("a+missing").unwrap_err();
        match err {
            FixerError::DerivationError { missing, .. } => assert_eq!(missing, "missing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_variables_listed() {
        let expr = Expr::parse("2*a - b/3600").unwrap();
        assert_eq!(expr.variables(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("a+").is_err());
        assert!(Expr::parse("(a").is_err());
        assert!(Expr::parse("a$b").is_err());
    }
}
