//! Byte stream decoding for scenario bytecode.
//!
//! Decoding happens in two passes.  The first pass walks the stream with
//! [`BytecodeFactory::read`], producing one element per call and recording
//! the byte offset each element started at.  The second pass rewrites every
//! pointer-bearing command so its targets refer to element offsets instead
//! of byte offsets.  The decoded lengths always sum to the stream length.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::bytecode::{
    BytecodeElement, CommandElement, CommandHeader, CommandKind, ExpressionElement, MetaElement,
    Pointer, SelectOption, TextoutElement, COMMAND_HEADER_SIZE,
};
use crate::expression::{is_shift_jis_lead, parse_expression, parse_parameter, Expression};

/// Kidoku table values at or above this mark entrypoints.
pub const ENTRYPOINT_MARKER: i32 = 1_000_000;

const JMP_MODTYPE: u8 = 0;
const JMP_MODULE: u8 = 1;
const SEL_MODULE: u8 = 2;

/// Cursor over a scenario byte stream.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    pub fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    pub fn skip(&mut self, count: usize) -> Result<(), DecodeError> {
        if self.pos + count > self.bytes.len() {
            return Err(DecodeError::UnexpectedEnd { position: self.pos });
        }
        self.pos += count;
        Ok(())
    }

    pub fn next_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = self.peek().ok_or(DecodeError::UnexpectedEnd { position: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn expect(&mut self, expected: u8) -> Result<(), DecodeError> {
        let position = self.pos;
        let found = self.next_u8()?;
        if found != expected {
            return Err(DecodeError::UnexpectedByte {
                position,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEnd { position: self.pos })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take::<2>()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take::<4>()?))
    }
}

/// Per-scenario context shared by every element read from one stream.
#[derive(Debug, Clone, Default)]
pub struct ConstructionData {
    kidoku_table: Vec<i32>,
    /// Byte offset of each element start mapped to its element offset.
    offsets: BTreeMap<u32, usize>,
}

impl ConstructionData {
    pub fn new(kidoku_table: Vec<i32>) -> Self {
        Self {
            kidoku_table,
            offsets: BTreeMap::new(),
        }
    }

    pub fn record_element(&mut self, byte_offset: usize, element_offset: usize) {
        self.offsets.insert(byte_offset as u32, element_offset);
    }

    pub fn resolve(&self, label: u32) -> Result<usize, DecodeError> {
        self.offsets
            .get(&label)
            .copied()
            .ok_or(DecodeError::UnresolvedPointer { label })
    }

    fn kidoku_entry(&self, index: u16) -> Option<i32> {
        self.kidoku_table.get(index as usize).copied()
    }
}

/// Reads single elements off a byte stream.
pub struct BytecodeFactory;

impl BytecodeFactory {
    /// Decode the element starting at `start`.  The caller advances by the
    /// returned element's [`BytecodeElement::bytecode_length`].
    pub fn read(
        stream: &[u8],
        start: usize,
        cdata: &ConstructionData,
    ) -> Result<BytecodeElement, DecodeError> {
        let mut cursor = ByteCursor::at(stream, start);
        let tag = cursor
            .peek()
            .ok_or(DecodeError::UnexpectedEnd { position: start })?;
        match tag {
            0 | b',' => Ok(BytecodeElement::Comma),
            b'\n' => {
                cursor.skip(1)?;
                let line = cursor.read_u16_le()?;
                Ok(BytecodeElement::Meta(MetaElement::line(i32::from(line))))
            }
            b'@' => {
                cursor.skip(1)?;
                let index = cursor.read_u16_le()?;
                let meta = match cdata.kidoku_entry(index) {
                    Some(value) if value >= ENTRYPOINT_MARKER => {
                        MetaElement::entrypoint(i32::from(index), value - ENTRYPOINT_MARKER)
                    }
                    _ => MetaElement::kidoku(i32::from(index)),
                };
                Ok(BytecodeElement::Meta(meta))
            }
            b'$' | b'\\' => {
                let expression = parse_expression(&mut cursor)?;
                let len = cursor.position() - start;
                Ok(BytecodeElement::Expression(ExpressionElement::new(
                    expression, len,
                )))
            }
            b'#' => read_command(&mut cursor).map(BytecodeElement::Command),
            byte if byte < 0x20 => Err(DecodeError::UnknownTag {
                position: start,
                byte,
            }),
            _ => read_textout(&mut cursor).map(BytecodeElement::Textout),
        }
    }
}

/// Decode a complete scenario stream and resolve its pointers.
pub fn decode_stream(
    stream: &[u8],
    kidoku_table: Vec<i32>,
) -> Result<Vec<BytecodeElement>, DecodeError> {
    let mut cdata = ConstructionData::new(kidoku_table);
    let mut elements = Vec::new();
    let mut position = 0;
    while position < stream.len() {
        let element = BytecodeFactory::read(stream, position, &cdata)?;
        cdata.record_element(position, elements.len());
        let length = element.bytecode_length();
        if length == 0 {
            return Err(DecodeError::UnknownTag {
                position,
                byte: stream[position],
            });
        }
        position += length;
        elements.push(element);
    }
    if position != stream.len() {
        return Err(DecodeError::LengthMismatch {
            decoded: position,
            expected: stream.len(),
        });
    }
    // Labels may also point one past the last element.
    cdata.record_element(stream.len(), elements.len());

    for element in &mut elements {
        if let BytecodeElement::Command(command) = element {
            for pointer in command.pointers_mut() {
                pointer.target = cdata.resolve(pointer.label)?;
            }
        }
    }
    Ok(elements)
}

fn read_textout(cursor: &mut ByteCursor<'_>) -> Result<TextoutElement, DecodeError> {
    let start = cursor.position();
    let mut quoted = false;
    let mut raw = Vec::new();
    while let Some(byte) = cursor.peek() {
        if !quoted && matches!(byte, 0 | b'#' | b'$' | b'\n' | b'@' | b',') {
            break;
        }
        cursor.skip(1)?;
        raw.push(byte);
        if byte == b'"' {
            quoted = !quoted;
        } else if is_shift_jis_lead(byte) {
            raw.push(cursor.next_u8()?);
        }
    }
    if raw.is_empty() {
        return Err(DecodeError::UnexpectedEnd { position: start });
    }
    Ok(TextoutElement::new(raw))
}

fn read_command(cursor: &mut ByteCursor<'_>) -> Result<CommandElement, DecodeError> {
    let start = cursor.position();
    cursor.expect(b'#')?;
    let modtype = cursor.next_u8()?;
    let module = cursor.next_u8()?;
    let opcode = cursor.read_u16_le()?;
    let argc = cursor.read_u16_le()?;
    let overload = cursor.next_u8()?;
    debug_assert_eq!(cursor.position() - start, COMMAND_HEADER_SIZE);
    let header = CommandHeader::new(modtype, module, opcode, argc, overload);

    let kind = match (modtype, module, opcode) {
        (JMP_MODTYPE, JMP_MODULE, 0 | 5) => CommandKind::Goto {
            target: read_pointer(cursor)?,
        },
        (JMP_MODTYPE, JMP_MODULE, 1 | 2 | 6 | 7) => {
            let condition = read_condition(cursor)?;
            CommandKind::GotoIf {
                condition,
                target: read_pointer(cursor)?,
            }
        }
        (JMP_MODTYPE, JMP_MODULE, 3 | 8) => {
            let value = read_condition(cursor)?;
            cursor.expect(b'{')?;
            let mut targets = Vec::with_capacity(argc as usize);
            for _ in 0..argc {
                targets.push(read_pointer(cursor)?);
            }
            cursor.expect(b'}')?;
            CommandKind::GotoOn { value, targets }
        }
        (JMP_MODTYPE, JMP_MODULE, 4 | 9) => {
            let value = read_condition(cursor)?;
            cursor.expect(b'{')?;
            let mut cases = Vec::with_capacity(argc as usize);
            let mut targets = Vec::with_capacity(argc as usize);
            for _ in 0..argc {
                cursor.expect(b'(')?;
                if cursor.peek() == Some(b')') {
                    cases.push(None);
                } else {
                    cases.push(Some(parse_expression(cursor)?));
                }
                cursor.expect(b')')?;
                targets.push(read_pointer(cursor)?);
            }
            cursor.expect(b'}')?;
            CommandKind::GotoCase {
                value,
                cases,
                targets,
            }
        }
        (JMP_MODTYPE, JMP_MODULE, 16) => {
            let params = if cursor.peek() == Some(b'(') {
                read_params(cursor)?
            } else {
                Vec::new()
            };
            CommandKind::GosubWith {
                params,
                target: read_pointer(cursor)?,
            }
        }
        (JMP_MODTYPE, SEL_MODULE, 0..=3) => read_select(cursor)?,
        _ => {
            if cursor.peek() == Some(b'(') {
                let mut params = read_params(cursor)?;
                if params.len() == 1 {
                    CommandKind::SingleArgFunction {
                        param: params.remove(0),
                    }
                } else {
                    CommandKind::Function { params }
                }
            } else {
                CommandKind::VoidFunction
            }
        }
    };

    let byte_len = cursor.position() - start;
    Ok(CommandElement::new(header, kind, byte_len))
}

fn read_pointer(cursor: &mut ByteCursor<'_>) -> Result<Pointer, DecodeError> {
    let label = cursor.read_u32_le()?;
    Ok(Pointer { label, target: 0 })
}

fn read_condition(cursor: &mut ByteCursor<'_>) -> Result<Expression, DecodeError> {
    cursor.expect(b'(')?;
    let expression = parse_expression(cursor)?;
    cursor.expect(b')')?;
    Ok(expression)
}

fn read_params(cursor: &mut ByteCursor<'_>) -> Result<Vec<Expression>, DecodeError> {
    cursor.expect(b'(')?;
    let mut params = Vec::new();
    loop {
        match cursor.peek() {
            Some(b')') => {
                cursor.skip(1)?;
                return Ok(params);
            }
            Some(b',') => cursor.skip(1)?,
            Some(_) => params.push(parse_parameter(cursor)?),
            None => {
                return Err(DecodeError::UnexpectedEnd {
                    position: cursor.position(),
                })
            }
        }
    }
}

fn read_select(cursor: &mut ByteCursor<'_>) -> Result<CommandKind, DecodeError> {
    let window = if cursor.peek() == Some(b'(') {
        Some(read_condition(cursor)?)
    } else {
        None
    };
    cursor.expect(b'{')?;
    let mut options = Vec::new();
    let mut line = 0;
    loop {
        match cursor.peek() {
            Some(b'}') => {
                cursor.skip(1)?;
                break;
            }
            Some(b'\n') => {
                cursor.skip(1)?;
                line = i32::from(cursor.read_u16_le()?);
            }
            Some(b',') => cursor.skip(1)?,
            Some(_) => {
                let text = parse_parameter(cursor)?;
                options.push(SelectOption { text, line });
            }
            None => {
                return Err(DecodeError::UnexpectedEnd {
                    position: cursor.position(),
                })
            }
        }
    }
    Ok(CommandKind::Select { window, options })
}

/// Decoding failures; all are fatal for the scenario being built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of bytecode at byte {position}")]
    UnexpectedEnd { position: usize },
    #[error("unknown element tag {byte:#04x} at byte {position}")]
    UnknownTag { position: usize, byte: u8 },
    #[error("expected byte {expected:#04x} at {position}, found {found:#04x}")]
    UnexpectedByte {
        position: usize,
        expected: u8,
        found: u8,
    },
    #[error("malformed expression at byte {position}: {reason}")]
    MalformedExpression {
        position: usize,
        reason: &'static str,
    },
    #[error("pointer to byte {label} does not start an element")]
    UnresolvedPointer { label: u32 },
    #[error("decoded {decoded} bytes but stream holds {expected}")]
    LengthMismatch { decoded: usize, expected: usize },
}
