//! Expression trees embedded in the bytecode stream.
//!
//! Expressions show up as standalone elements (usually assignments such as
//! `intA[3] += 1`) and as command parameters.  They are parsed once when a
//! scenario is decoded and evaluated against the machine every time the
//! owning element runs.

use std::fmt;

use crate::bytecode::decode_script_text;
use crate::decoder::{ByteCursor, DecodeError};
use crate::machine::{Machine, MachineError};
use crate::memory::{is_string_type, IntLocation};

const TOKEN_START: u8 = b'$';
const OPERATOR_START: u8 = b'\\';
const INT_CONSTANT_TAG: u8 = 0xFF;
const STORE_REGISTER_TAG: u8 = 0xC8;
const UNARY_MINUS: u8 = 0x01;
const ASSIGN_BASE: u8 = 0x14;
const ASSIGN_SET: u8 = 0x1E;

const MAX_EXPRESSION_DEPTH: usize = 64;

/// Binary operators in their bytecode numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Le,
    Lt,
    Ge,
    Gt,
    And,
    Or,
}

impl BinaryOp {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let op = match byte {
            0x00 => BinaryOp::Add,
            0x01 => BinaryOp::Sub,
            0x02 => BinaryOp::Mul,
            0x03 => BinaryOp::Div,
            0x04 => BinaryOp::Mod,
            0x05 => BinaryOp::BitAnd,
            0x06 => BinaryOp::BitOr,
            0x07 => BinaryOp::BitXor,
            0x08 => BinaryOp::Shl,
            0x09 => BinaryOp::Shr,
            0x28 => BinaryOp::Eq,
            0x29 => BinaryOp::Ne,
            0x2A => BinaryOp::Le,
            0x2B => BinaryOp::Lt,
            0x2C => BinaryOp::Ge,
            0x2D => BinaryOp::Gt,
            0x3C => BinaryOp::And,
            0x3D => BinaryOp::Or,
            _ => return None,
        };
        Some(op)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Le => "<=",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Gt => ">",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    pub fn apply(self, lhs: i32, rhs: i32) -> Result<i32, MachineError> {
        let value = match self {
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
            BinaryOp::Div => {
                if rhs == 0 {
                    return Err(MachineError::DivideByZero);
                }
                lhs.wrapping_div(rhs)
            }
            BinaryOp::Mod => {
                if rhs == 0 {
                    return Err(MachineError::DivideByZero);
                }
                lhs.wrapping_rem(rhs)
            }
            BinaryOp::BitAnd => lhs & rhs,
            BinaryOp::BitOr => lhs | rhs,
            BinaryOp::BitXor => lhs ^ rhs,
            BinaryOp::Shl => lhs.wrapping_shl(rhs as u32),
            BinaryOp::Shr => lhs.wrapping_shr(rhs as u32),
            BinaryOp::Eq => (lhs == rhs) as i32,
            BinaryOp::Ne => (lhs != rhs) as i32,
            BinaryOp::Le => (lhs <= rhs) as i32,
            BinaryOp::Lt => (lhs < rhs) as i32,
            BinaryOp::Ge => (lhs >= rhs) as i32,
            BinaryOp::Gt => (lhs > rhs) as i32,
            BinaryOp::And => (lhs != 0 && rhs != 0) as i32,
            BinaryOp::Or => (lhs != 0 || rhs != 0) as i32,
        };
        Ok(value)
    }
}

/// Binding strength from loosest to tightest.
const PRECEDENCE: &[&[BinaryOp]] = &[
    &[BinaryOp::Or],
    &[BinaryOp::And],
    &[
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::Le,
        BinaryOp::Lt,
        BinaryOp::Ge,
        BinaryOp::Gt,
    ],
    &[BinaryOp::BitAnd, BinaryOp::BitOr, BinaryOp::BitXor],
    &[BinaryOp::Shl, BinaryOp::Shr],
    &[BinaryOp::Add, BinaryOp::Sub],
    &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod],
];

/// Assignment flavour: plain `=` or a compound operator such as `+=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignOp {
    Set,
    Compound(BinaryOp),
}

impl AssignOp {
    fn from_byte(byte: u8) -> Option<Self> {
        if byte == ASSIGN_SET {
            return Some(AssignOp::Set);
        }
        if (ASSIGN_BASE..ASSIGN_SET).contains(&byte) {
            return BinaryOp::from_byte(byte - ASSIGN_BASE).map(AssignOp::Compound);
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    IntConstant(i32),
    StringConstant(String),
    StoreRegister,
    IntMemory {
        raw_type: i32,
        location: Box<Expression>,
    },
    StringMemory {
        raw_type: i32,
        location: Box<Expression>,
    },
    Negate(Box<Expression>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expression>,
        value: Box<Expression>,
    },
    /// Parenthesised group of several values passed as one parameter.
    Complex(Vec<Expression>),
}

impl Expression {
    pub fn int_memory(raw_type: i32, location: i32) -> Self {
        Expression::IntMemory {
            raw_type,
            location: Box::new(Expression::IntConstant(location)),
        }
    }

    pub fn string_memory(raw_type: i32, location: i32) -> Self {
        Expression::StringMemory {
            raw_type,
            location: Box::new(Expression::IntConstant(location)),
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(
            self,
            Expression::StringConstant(_) | Expression::StringMemory { .. }
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Expression::StringConstant(_) | Expression::StringMemory { .. } => "string",
            Expression::Complex(_) => "complex",
            _ => "int",
        }
    }

    pub fn integer_value(&self, machine: &mut Machine) -> Result<i32, MachineError> {
        match self {
            Expression::IntConstant(value) => Ok(*value),
            Expression::StoreRegister => Ok(machine.store_register()),
            Expression::IntMemory { raw_type, location } => {
                let index = location.integer_value(machine)?;
                Ok(machine.get_int_value(*raw_type, index)?)
            }
            Expression::Negate(operand) => Ok(operand.integer_value(machine)?.wrapping_neg()),
            Expression::Binary {
                op: BinaryOp::And,
                lhs,
                rhs,
            } => {
                if lhs.integer_value(machine)? == 0 {
                    return Ok(0);
                }
                Ok((rhs.integer_value(machine)? != 0) as i32)
            }
            Expression::Binary {
                op: BinaryOp::Or,
                lhs,
                rhs,
            } => {
                if lhs.integer_value(machine)? != 0 {
                    return Ok(1);
                }
                Ok((rhs.integer_value(machine)? != 0) as i32)
            }
            Expression::Binary { op, lhs, rhs } => {
                let left = lhs.integer_value(machine)?;
                let right = rhs.integer_value(machine)?;
                op.apply(left, right)
            }
            Expression::Assign { op, target, value } => {
                let incoming = value.integer_value(machine)?;
                assign(machine, *op, target, incoming)
            }
            other => Err(MachineError::TypeMismatch {
                expected: "int",
                found: other.kind(),
            }),
        }
    }

    pub fn string_value(&self, machine: &mut Machine) -> Result<String, MachineError> {
        match self {
            Expression::StringConstant(text) => Ok(text.clone()),
            Expression::StringMemory { raw_type, location } => {
                let index = location.integer_value(machine)?;
                Ok(machine.get_string_value(*raw_type, index)?.to_owned())
            }
            other => Err(MachineError::TypeMismatch {
                expected: "string",
                found: other.kind(),
            }),
        }
    }
}

fn assign(
    machine: &mut Machine,
    op: AssignOp,
    target: &Expression,
    incoming: i32,
) -> Result<i32, MachineError> {
    match target {
        Expression::IntMemory { raw_type, location } => {
            let index = location.integer_value(machine)?;
            let value = match op {
                AssignOp::Set => incoming,
                AssignOp::Compound(binary) => {
                    binary.apply(machine.get_int_value(*raw_type, index)?, incoming)?
                }
            };
            machine.set_int_value(*raw_type, index, value)?;
            Ok(value)
        }
        Expression::StoreRegister => {
            let value = match op {
                AssignOp::Set => incoming,
                AssignOp::Compound(binary) => binary.apply(machine.store_register(), incoming)?,
            };
            machine.set_store_register(value);
            Ok(value)
        }
        other => Err(MachineError::TypeMismatch {
            expected: "assignable int",
            found: other.kind(),
        }),
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::IntConstant(value) => write!(f, "{value}"),
            Expression::StringConstant(text) => write!(f, "\"{text}\""),
            Expression::StoreRegister => write!(f, "<store>"),
            Expression::IntMemory { raw_type, location } => match IntLocation::decode(*raw_type) {
                Ok(view) if view.bits == 0 => {
                    write!(f, "int{}[{location}]", view.bank.letter())
                }
                Ok(view) => write!(f, "int{}{}b[{location}]", view.bank.letter(), view.bits),
                Err(_) => write!(f, "int<{raw_type}>[{location}]"),
            },
            Expression::StringMemory { raw_type, location } => {
                let name = match *raw_type {
                    0x0A => "strK",
                    0x0C => "strM",
                    _ => "strS",
                };
                write!(f, "{name}[{location}]")
            }
            Expression::Negate(operand) => write!(f, "-{operand}"),
            Expression::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expression::Assign { op, target, value } => match op {
                AssignOp::Set => write!(f, "{target} = {value}"),
                AssignOp::Compound(binary) => write!(f, "{target} {}= {value}", binary.symbol()),
            },
            Expression::Complex(items) => {
                write!(f, "(")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Parse a full expression, including a trailing assignment.
pub fn parse_expression(cursor: &mut ByteCursor<'_>) -> Result<Expression, DecodeError> {
    expression_at(cursor, 0)
}

/// Parse one command parameter: an expression or a string literal.
pub fn parse_parameter(cursor: &mut ByteCursor<'_>) -> Result<Expression, DecodeError> {
    parameter_at(cursor, 0)
}

fn nested(cursor: &ByteCursor<'_>, depth: usize) -> Result<usize, DecodeError> {
    if depth >= MAX_EXPRESSION_DEPTH {
        return Err(DecodeError::MalformedExpression {
            position: cursor.position(),
            reason: "expression nested too deeply",
        });
    }
    Ok(depth + 1)
}

fn expression_at(cursor: &mut ByteCursor<'_>, depth: usize) -> Result<Expression, DecodeError> {
    let start = cursor.position();
    let lhs = parse_binary(cursor, 0, depth)?;
    let assign = match peek_operator(cursor) {
        Some(byte) => AssignOp::from_byte(byte),
        None => None,
    };
    let Some(op) = assign else {
        return Ok(lhs);
    };
    if !matches!(lhs, Expression::IntMemory { .. } | Expression::StoreRegister) {
        return Err(DecodeError::MalformedExpression {
            position: start,
            reason: "assignment target must be integer memory",
        });
    }
    cursor.skip(2)?;
    let inner = nested(cursor, depth)?;
    let value = expression_at(cursor, inner)?;
    Ok(Expression::Assign {
        op,
        target: Box::new(lhs),
        value: Box::new(value),
    })
}

fn parameter_at(cursor: &mut ByteCursor<'_>, depth: usize) -> Result<Expression, DecodeError> {
    match cursor.peek() {
        Some(TOKEN_START) | Some(OPERATOR_START) | Some(b'(') => expression_at(cursor, depth),
        Some(b'"') => parse_quoted(cursor),
        Some(_) => parse_bare_string(cursor),
        None => Err(DecodeError::UnexpectedEnd {
            position: cursor.position(),
        }),
    }
}

fn peek_operator(cursor: &ByteCursor<'_>) -> Option<u8> {
    if cursor.peek() == Some(OPERATOR_START) {
        cursor.peek_at(1)
    } else {
        None
    }
}

fn parse_binary(
    cursor: &mut ByteCursor<'_>,
    level: usize,
    depth: usize,
) -> Result<Expression, DecodeError> {
    let Some(operators) = PRECEDENCE.get(level) else {
        return parse_unary(cursor, depth);
    };
    let mut lhs = parse_binary(cursor, level + 1, depth)?;
    while let Some(op) = peek_operator(cursor)
        .and_then(BinaryOp::from_byte)
        .filter(|op| operators.contains(op))
    {
        cursor.skip(2)?;
        let rhs = parse_binary(cursor, level + 1, depth)?;
        lhs = Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
    }
    Ok(lhs)
}

fn parse_unary(cursor: &mut ByteCursor<'_>, depth: usize) -> Result<Expression, DecodeError> {
    if peek_operator(cursor) == Some(UNARY_MINUS) {
        cursor.skip(2)?;
        let inner = nested(cursor, depth)?;
        let operand = parse_unary(cursor, inner)?;
        return Ok(Expression::Negate(Box::new(operand)));
    }
    parse_token(cursor, depth)
}

fn parse_token(cursor: &mut ByteCursor<'_>, depth: usize) -> Result<Expression, DecodeError> {
    let position = cursor.position();
    match cursor.next_u8()? {
        TOKEN_START => match cursor.next_u8()? {
            INT_CONSTANT_TAG => Ok(Expression::IntConstant(cursor.read_i32_le()?)),
            STORE_REGISTER_TAG => Ok(Expression::StoreRegister),
            raw_type => {
                cursor.expect(b'[')?;
                let inner = nested(cursor, depth)?;
                let location = Box::new(expression_at(cursor, inner)?);
                cursor.expect(b']')?;
                let raw_type = i32::from(raw_type);
                if is_string_type(raw_type) {
                    Ok(Expression::StringMemory { raw_type, location })
                } else {
                    Ok(Expression::IntMemory { raw_type, location })
                }
            }
        },
        b'(' => {
            let inner = nested(cursor, depth)?;
            let mut items = Vec::new();
            loop {
                match cursor.peek() {
                    Some(b')') => {
                        cursor.skip(1)?;
                        break;
                    }
                    Some(b',') => cursor.skip(1)?,
                    _ => items.push(parameter_at(cursor, inner)?),
                }
            }
            if items.len() == 1 {
                Ok(items.remove(0))
            } else {
                Ok(Expression::Complex(items))
            }
        }
        _ => Err(DecodeError::MalformedExpression {
            position,
            reason: "expected `$` or `(` at start of expression token",
        }),
    }
}

fn parse_quoted(cursor: &mut ByteCursor<'_>) -> Result<Expression, DecodeError> {
    cursor.expect(b'"')?;
    let mut bytes = Vec::new();
    loop {
        let byte = cursor.next_u8()?;
        if byte == b'"' {
            break;
        }
        bytes.push(byte);
        if is_shift_jis_lead(byte) {
            bytes.push(cursor.next_u8()?);
        }
    }
    Ok(Expression::StringConstant(decode_script_text(&bytes, None)))
}

/// Unquoted string parameter, running up to the next delimiter.  A delimiter
/// in parameter position means the list is malformed.
fn parse_bare_string(cursor: &mut ByteCursor<'_>) -> Result<Expression, DecodeError> {
    let start = cursor.position();
    let mut bytes = Vec::new();
    while let Some(byte) = cursor.peek() {
        if matches!(byte, b',' | b')' | b'}' | b'\n') {
            break;
        }
        cursor.skip(1)?;
        bytes.push(byte);
        if is_shift_jis_lead(byte) {
            bytes.push(cursor.next_u8()?);
        }
    }
    if bytes.is_empty() {
        return Err(DecodeError::MalformedExpression {
            position: start,
            reason: "empty parameter",
        });
    }
    Ok(Expression::StringConstant(decode_script_text(&bytes, None)))
}

/// Lead bytes of two-byte Shift-JIS characters.
pub fn is_shift_jis_lead(byte: u8) -> bool {
    matches!(byte, 0x81..=0x9F | 0xE0..=0xEF)
}
