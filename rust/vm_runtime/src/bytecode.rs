//! Bytecode element model for scene scripts.
//!
//! A scenario is a flat list of elements decoded from its byte stream.  The
//! set of element kinds is closed, so every per-element operation (length,
//! execution, source representation) is a single `match` over
//! [`BytecodeElement`] rather than a trait object.  Pointer-bearing commands
//! carry targets already resolved to element offsets within their scenario.

use std::fmt;

use encoding_rs::SHIFT_JIS;
use tracing::trace;

use crate::expression::Expression;
use crate::machine::{Machine, MachineError};

/// Size of the fixed command header: tag, modtype, module, opcode (u16),
/// argc (u16), overload.
pub const COMMAND_HEADER_SIZE: usize = 8;

/// Size in bytes of an encoded pointer.
pub const POINTER_SIZE: usize = 4;

/// Size in bytes of a line or kidoku marker.
pub const META_SIZE: usize = 3;

/// Element offset within a scenario.
pub type ElementOffset = usize;

/// Jump target as stored in the byte stream plus its resolved element offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    /// Byte offset from the start of the scenario bytecode.
    pub label: u32,
    /// Element offset the label resolved to.
    pub target: ElementOffset,
}

impl Pointer {
    /// Pointer to an element offset, for scenarios assembled without bytes.
    pub fn to_element(target: ElementOffset) -> Self {
        Self {
            label: target as u32,
            target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKind {
    Line,
    Kidoku,
    Entrypoint,
}

/// Source line, kidoku and entrypoint markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaElement {
    pub kind: MetaKind,
    /// Line number or kidoku index, depending on `kind`.
    pub value: i32,
    /// Entrypoint index for `MetaKind::Entrypoint`.
    pub entrypoint: Option<i32>,
}

impl MetaElement {
    pub fn line(line: i32) -> Self {
        Self {
            kind: MetaKind::Line,
            value: line,
            entrypoint: None,
        }
    }

    pub fn kidoku(index: i32) -> Self {
        Self {
            kind: MetaKind::Kidoku,
            value: index,
            entrypoint: None,
        }
    }

    pub fn entrypoint(kidoku: i32, entrypoint: i32) -> Self {
        Self {
            kind: MetaKind::Entrypoint,
            value: kidoku,
            entrypoint: Some(entrypoint),
        }
    }
}

/// Raw display text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextoutElement {
    raw: Vec<u8>,
}

impl TextoutElement {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Printable text with quoting removed.
    pub fn text(&self) -> String {
        self.decode(None)
    }

    /// Like [`TextoutElement::text`], for a scenario with the given encoding tag.
    pub fn decode(&self, encoding: Option<i32>) -> String {
        let unquoted: Vec<u8> = self.raw.iter().copied().filter(|b| *b != b'"').collect();
        decode_script_text(&unquoted, encoding)
    }
}

/// Decode script bytes to text.
///
/// Scripts are written in cp932.  Nonzero encoding tags name per-language
/// remappings layered on the same byte layout, so they share the cp932 table.
pub fn decode_script_text(bytes: &[u8], encoding: Option<i32>) -> String {
    if let Some(tag) = encoding.filter(|tag| *tag != 0) {
        trace!(tag, "decoding remapped text as cp932");
    }
    let (text, had_errors) = SHIFT_JIS.decode_without_bom_handling(bytes);
    if had_errors {
        trace!(len = bytes.len(), "replaced malformed cp932 sequences");
    }
    text.into_owned()
}

/// Standalone expression, typically an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionElement {
    pub expression: Expression,
    byte_len: usize,
}

impl ExpressionElement {
    pub fn new(expression: Expression, byte_len: usize) -> Self {
        Self {
            expression,
            byte_len,
        }
    }
}

/// Identity fields from the fixed command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHeader {
    pub modtype: u8,
    pub module: u8,
    pub opcode: u16,
    pub argc: u16,
    pub overload: u8,
}

impl CommandHeader {
    pub fn new(modtype: u8, module: u8, opcode: u16, argc: u16, overload: u8) -> Self {
        Self {
            modtype,
            module,
            opcode,
            argc,
            overload,
        }
    }
}

/// One choice of a select command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOption {
    pub text: Expression,
    pub line: i32,
}

/// Shape-specific payload of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Goto {
        target: Pointer,
    },
    GotoIf {
        condition: Expression,
        target: Pointer,
    },
    /// `cases[i]` of `None` is the default case.
    GotoCase {
        value: Expression,
        cases: Vec<Option<Expression>>,
        targets: Vec<Pointer>,
    },
    GotoOn {
        value: Expression,
        targets: Vec<Pointer>,
    },
    GosubWith {
        params: Vec<Expression>,
        target: Pointer,
    },
    Select {
        window: Option<Expression>,
        options: Vec<SelectOption>,
    },
    Function {
        params: Vec<Expression>,
    },
    VoidFunction,
    SingleArgFunction {
        param: Expression,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandElement {
    pub header: CommandHeader,
    pub kind: CommandKind,
    byte_len: usize,
}

impl CommandElement {
    pub fn new(header: CommandHeader, kind: CommandKind, byte_len: usize) -> Self {
        Self {
            header,
            kind,
            byte_len,
        }
    }

    pub fn modtype(&self) -> u8 {
        self.header.modtype
    }

    pub fn module(&self) -> u8 {
        self.header.module
    }

    pub fn opcode(&self) -> u16 {
        self.header.opcode
    }

    pub fn argc(&self) -> u16 {
        self.header.argc
    }

    pub fn overload(&self) -> u8 {
        self.header.overload
    }

    /// Parameter expressions, in order.
    pub fn params(&self) -> &[Expression] {
        match &self.kind {
            CommandKind::GotoIf { condition, .. } => std::slice::from_ref(condition),
            CommandKind::GotoCase { value, .. } | CommandKind::GotoOn { value, .. } => {
                std::slice::from_ref(value)
            }
            CommandKind::GosubWith { params, .. } | CommandKind::Function { params } => params,
            CommandKind::SingleArgFunction { param } => std::slice::from_ref(param),
            CommandKind::Select {
                window: Some(window),
                ..
            } => std::slice::from_ref(window),
            CommandKind::Goto { .. }
            | CommandKind::VoidFunction
            | CommandKind::Select { window: None, .. } => &[],
        }
    }

    pub fn param(&self, index: usize) -> Result<&Expression, MachineError> {
        self.params()
            .get(index)
            .ok_or(MachineError::MissingParameter {
                opcode: self.opcode(),
                index,
            })
    }

    pub fn pointers(&self) -> &[Pointer] {
        match &self.kind {
            CommandKind::Goto { target }
            | CommandKind::GotoIf { target, .. }
            | CommandKind::GosubWith { target, .. } => std::slice::from_ref(target),
            CommandKind::GotoCase { targets, .. } | CommandKind::GotoOn { targets, .. } => {
                targets
            }
            _ => &[],
        }
    }

    pub fn pointer(&self, index: usize) -> Result<Pointer, MachineError> {
        self.pointers()
            .get(index)
            .copied()
            .ok_or(MachineError::MissingPointer {
                opcode: self.opcode(),
                index,
            })
    }

    pub fn pointers_mut(&mut self) -> &mut [Pointer] {
        match &mut self.kind {
            CommandKind::Goto { target }
            | CommandKind::GotoIf { target, .. }
            | CommandKind::GosubWith { target, .. } => std::slice::from_mut(target),
            CommandKind::GotoCase { targets, .. } | CommandKind::GotoOn { targets, .. } => {
                targets
            }
            _ => &mut [],
        }
    }
}

/// One decoded element of a scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BytecodeElement {
    Comma,
    Meta(MetaElement),
    Textout(TextoutElement),
    Expression(ExpressionElement),
    Command(CommandElement),
}

impl BytecodeElement {
    /// Number of bytes this element occupied in the scenario stream.
    pub fn bytecode_length(&self) -> usize {
        match self {
            BytecodeElement::Comma => 1,
            BytecodeElement::Meta(_) => META_SIZE,
            BytecodeElement::Textout(text) => text.raw.len(),
            BytecodeElement::Expression(expression) => expression.byte_len,
            BytecodeElement::Command(command) => command.byte_len,
        }
    }

    /// Entrypoint index if this element marks one.
    pub fn entrypoint(&self) -> Option<i32> {
        match self {
            BytecodeElement::Meta(meta) if meta.kind == MetaKind::Entrypoint => meta.entrypoint,
            _ => None,
        }
    }

    pub fn pointers(&self) -> &[Pointer] {
        match self {
            BytecodeElement::Command(command) => command.pointers(),
            _ => &[],
        }
    }

    pub fn run_on_machine(&self, machine: &mut Machine) -> Result<(), MachineError> {
        match self {
            BytecodeElement::Comma => {
                machine.advance_instruction_pointer();
                Ok(())
            }
            BytecodeElement::Meta(meta) => {
                match meta.kind {
                    MetaKind::Line => machine.set_line_number(meta.value),
                    MetaKind::Kidoku | MetaKind::Entrypoint => machine.record_kidoku(meta.value),
                }
                machine.advance_instruction_pointer();
                Ok(())
            }
            BytecodeElement::Textout(text) => machine.perform_textout(text),
            BytecodeElement::Expression(expression) => machine.execute_expression(expression),
            BytecodeElement::Command(command) => machine.execute_command(command),
        }
    }

    /// Disassembly-style rendering of the element.
    pub fn source_representation(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BytecodeElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BytecodeElement::Comma => write!(f, "<CommaElement>"),
            BytecodeElement::Meta(meta) => match meta.kind {
                MetaKind::Line => write!(f, "#line {}", meta.value),
                MetaKind::Kidoku => write!(f, "{{- Kidoku {} -}}", meta.value),
                MetaKind::Entrypoint => {
                    write!(f, "#entrypoint {}", meta.entrypoint.unwrap_or_default())
                }
            },
            BytecodeElement::Textout(text) => write!(f, "\"{}\"", text.text()),
            BytecodeElement::Expression(expression) => write!(f, "{}", expression.expression),
            BytecodeElement::Command(command) => write!(f, "{command}"),
        }
    }
}

impl fmt::Display for CommandElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = &self.header;
        write!(
            f,
            "op<{}:{:03}:{:05}, {}>",
            header.modtype, header.module, header.opcode, header.overload
        )?;
        match &self.kind {
            CommandKind::GotoCase { value, cases, .. } => {
                write!(f, "({value}){{")?;
                for (case, pointer) in cases.iter().zip(self.pointers()) {
                    match case {
                        Some(case) => write!(f, " ({case}) @{}", pointer.target)?,
                        None => write!(f, " () @{}", pointer.target)?,
                    }
                }
                return write!(f, " }}");
            }
            CommandKind::Select { options, .. } => {
                write_params(f, self.params())?;
                write!(f, "{{")?;
                for option in options {
                    write!(f, " {}", option.text)?;
                }
                return write!(f, " }}");
            }
            CommandKind::VoidFunction | CommandKind::Goto { .. } => {}
            _ => write_params(f, self.params())?,
        }
        for pointer in self.pointers() {
            write!(f, " @{}", pointer.target)?;
        }
        Ok(())
    }
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[Expression]) -> fmt::Result {
    write!(f, "(")?;
    for (index, param) in params.iter().enumerate() {
        if index > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{param}")?;
    }
    write!(f, ")")
}
