//! Parsing of layer equations (`O[b][k] += W[k][c] * I[b][c]`) and dimension relations
//! (`ix = 2*ox + 1*fx`).

use crate::common::{LayerDim, LayerOperand};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EquationError {
    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("Unexpected token {found} in '{text}'; expected {expected}")]
    UnexpectedToken {
        text: String,
        found: String,
        expected: &'static str,
    },
    #[error("Equation '{0}' has no input operand")]
    NoInputs(String),
    #[error("Operand {0} appears more than once in equation")]
    DuplicateOperand(LayerOperand),
    #[error("Relation '{0}' has two zero coefficients")]
    ZeroCoefficients(String),
    #[error("Dimension name '{0}' must be alphabetic")]
    InvalidDimName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(u64),
    LBracket,
    RBracket,
    Assign,
    AddAssign,
    Mul,
    Plus,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{s}'"),
            Token::Int(i) => write!(f, "'{i}'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::Assign => f.write_str("'='"),
            Token::AddAssign => f.write_str("'+='"),
            Token::Mul => f.write_str("'*'"),
            Token::Plus => f.write_str("'+'"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, EquationError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Assign);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Mul);
            }
            '+' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::AddAssign);
                } else {
                    tokens.push(Token::Plus);
                }
            }
            c if c.is_ascii_digit() => {
                let mut value = 0u64;
                while let Some(&(_, d)) = chars.peek() {
                    let Some(digit) = d.to_digit(10) else { break };
                    value = value.saturating_mul(10).saturating_add(u64::from(digit));
                    chars.next();
                }
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !(d.is_alphanumeric() || d == '_') {
                        break;
                    }
                    ident.push(d);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            c => return Err(EquationError::UnexpectedChar(c, offset)),
        }
    }
    Ok(tokens)
}

struct Cursor<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Result<Self, EquationError> {
        Ok(Cursor {
            text,
            tokens: tokenize(text)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn unexpected(&self, found: Option<Token>, expected: &'static str) -> EquationError {
        EquationError::UnexpectedToken {
            text: self.text.to_owned(),
            found: found.map_or_else(|| "end of input".to_owned(), |t| t.to_string()),
            expected,
        }
    }

    fn ident(&mut self) -> Result<String, EquationError> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(self.unexpected(other, "a name")),
        }
    }

    fn finish(&mut self) -> Result<(), EquationError> {
        match self.next() {
            None => Ok(()),
            other => Err(self.unexpected(other, "end of input")),
        }
    }
}

/// A parsed layer equation. The first operand is the output, the rest are inputs, in the order
/// they were written.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Equation {
    text: String,
    operands: Vec<(LayerOperand, Vec<LayerDim>)>,
}

impl Equation {
    pub fn output(&self) -> &LayerOperand {
        &self.operands[0].0
    }

    pub fn inputs(&self) -> impl Iterator<Item = &LayerOperand> {
        self.operands[1..].iter().map(|(op, _)| op)
    }

    /// All operands, output first.
    pub fn operands(&self) -> impl Iterator<Item = &LayerOperand> {
        self.operands.iter().map(|(op, _)| op)
    }

    pub fn contains(&self, operand: &LayerOperand) -> bool {
        self.operands.iter().any(|(op, _)| op == operand)
    }

    /// The dimensions indexing `operand`, in written order. Empty if the operand is absent.
    pub fn dims_of(&self, operand: &LayerOperand) -> &[LayerDim] {
        self.operands
            .iter()
            .find(|(op, _)| op == operand)
            .map(|(_, dims)| dims.as_slice())
            .unwrap_or(&[])
    }

    /// All dimensions used by any operand, deduplicated, in first-use order.
    pub fn all_dims(&self) -> Vec<LayerDim> {
        let mut out: Vec<LayerDim> = Vec::new();
        for (_, dims) in &self.operands {
            for d in dims {
                if !out.contains(d) {
                    out.push(d.clone());
                }
            }
        }
        out
    }

    fn parse_operand(cursor: &mut Cursor) -> Result<(LayerOperand, Vec<LayerDim>), EquationError> {
        let name = cursor.ident()?;
        let mut dims = Vec::new();
        while cursor.peek() == Some(&Token::LBracket) {
            cursor.next();
            match cursor.next() {
                Some(Token::RBracket) => continue,
                Some(Token::Ident(d)) => dims.push(LayerDim::new(&d)),
                other => return Err(cursor.unexpected(other, "a dimension name")),
            }
            match cursor.next() {
                Some(Token::RBracket) => {}
                other => return Err(cursor.unexpected(other, "']'")),
            }
        }
        Ok((LayerOperand::new(&name), dims))
    }
}

impl FromStr for Equation {
    type Err = EquationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cursor = Cursor::new(s)?;
        let mut operands = vec![Equation::parse_operand(&mut cursor)?];
        match cursor.next() {
            Some(Token::Assign | Token::AddAssign) => {}
            other => return Err(cursor.unexpected(other, "'=' or '+='")),
        }
        operands.push(Equation::parse_operand(&mut cursor)?);
        while matches!(cursor.peek(), Some(Token::Mul | Token::Plus)) {
            cursor.next();
            operands.push(Equation::parse_operand(&mut cursor)?);
        }
        cursor.finish()?;
        if operands.len() < 2 {
            return Err(EquationError::NoInputs(s.to_owned()));
        }
        for (i, (op, _)) in operands.iter().enumerate() {
            if operands[..i].iter().any(|(other, _)| other == op) {
                return Err(EquationError::DuplicateOperand(op.clone()));
            }
        }
        Ok(Equation {
            text: s.to_owned(),
            operands,
        })
    }
}

impl TryFrom<String> for Equation {
    type Error = EquationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Equation> for String {
    fn from(value: Equation) -> Self {
        value.text
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// An affine relation `dim = c1*a + c2*b` between a partially relevant operand dimension and two
/// loop dimensions. Coefficients default to 1 when omitted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct DimRelation {
    pub dim: LayerDim,
    pub terms: [(u64, LayerDim); 2],
}

impl DimRelation {
    fn parse_term(cursor: &mut Cursor) -> Result<(u64, LayerDim), EquationError> {
        let coefficient = match cursor.peek() {
            Some(Token::Int(c)) => {
                let c = *c;
                cursor.next();
                match cursor.next() {
                    Some(Token::Mul) => {}
                    other => return Err(cursor.unexpected(other, "'*'")),
                }
                c
            }
            _ => 1,
        };
        let name = cursor.ident()?;
        Ok((coefficient, checked_dim(&name)?))
    }
}

fn checked_dim(name: &str) -> Result<LayerDim, EquationError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(EquationError::InvalidDimName(name.to_owned()));
    }
    Ok(LayerDim::new(name))
}

impl FromStr for DimRelation {
    type Err = EquationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cursor = Cursor::new(s)?;
        let dim = checked_dim(&cursor.ident()?)?;
        match cursor.next() {
            Some(Token::Assign) => {}
            other => return Err(cursor.unexpected(other, "'='")),
        }
        let first = DimRelation::parse_term(&mut cursor)?;
        match cursor.next() {
            Some(Token::Plus) => {}
            other => return Err(cursor.unexpected(other, "'+'")),
        }
        let second = DimRelation::parse_term(&mut cursor)?;
        cursor.finish()?;
        if first.0 == 0 && second.0 == 0 {
            return Err(EquationError::ZeroCoefficients(s.to_owned()));
        }
        Ok(DimRelation {
            dim,
            terms: [first, second],
        })
    }
}

impl TryFrom<String> for DimRelation {
    type Error = EquationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DimRelation> for String {
    fn from(value: DimRelation) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DimRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [(c1, a), (c2, b)] = &self.terms;
        write!(f, "{} = {c1}*{a} + {c2}*{b}", self.dim)
    }
}
