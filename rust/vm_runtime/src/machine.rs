//! The scene machine: call stack, memory and the tick loop.
//!
//! Frames address code as (scene, element offset) and are resolved through
//! the shared [`Archive`] whenever an element is needed, so the stack never
//! borrows from scenario storage.  Each tick runs exactly one unit of work:
//! one step of the top long operation if any are pending, otherwise the
//! element under the top frame.  Errors raised by that work are caught here and
//! either halt the machine or skip the failing element, depending on
//! `halt_on_exception`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bytecode::{CommandElement, ElementOffset, ExpressionElement, TextoutElement};
use crate::long_operation::{LongOperation, TextoutLongOperation};
use crate::memory::{LocalMemory, Memory, MemoryError};
use crate::modules::ModuleTable;
use crate::scenario::{Archive, Scenario};
use crate::system::System;

/// Why a frame was pushed; returns must match it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    Root,
    Gosub,
    Farcall,
    LongOperation,
}

/// Position in the archive plus the reason the frame exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub scene: i32,
    pub offset: ElementOffset,
    pub frame_type: FrameType,
}

impl StackFrame {
    pub fn new(scene: i32, offset: ElementOffset, frame_type: FrameType) -> Self {
        Self {
            scene,
            offset,
            frame_type,
        }
    }
}

pub struct Machine {
    archive: Arc<Archive>,
    modules: Arc<ModuleTable>,
    system: Box<dyn System>,
    call_stack: Vec<StackFrame>,
    long_operations: Vec<Box<dyn LongOperation>>,
    memory: Memory,
    store_register: i32,
    line: i32,
    kidoku: BTreeMap<i32, BTreeSet<i32>>,
    halted: bool,
    halt_on_exception: bool,
    last_error: Option<MachineError>,
}

impl Machine {
    /// Build a machine positioned at the start of the configured scene.
    pub fn new(
        archive: Arc<Archive>,
        modules: Arc<ModuleTable>,
        system: Box<dyn System>,
    ) -> Result<Self, MachineError> {
        let configured = system.config().seen_start;
        let first = archive
            .first_scene()
            .ok_or(MachineError::InvalidScenario(configured.unwrap_or_default()))?;
        let scene = match configured {
            Some(scene) if archive.scenario(scene).is_some() => scene,
            Some(scene) => {
                warn!(scene, fallback = first, "start scene missing from archive");
                first
            }
            None => first,
        };
        let halt_on_exception = system.config().halt_on_exception;
        Ok(Self {
            archive,
            modules,
            system,
            call_stack: vec![StackFrame::new(scene, 0, FrameType::Root)],
            long_operations: Vec::new(),
            memory: Memory::new(),
            store_register: 0,
            line: 0,
            kidoku: BTreeMap::new(),
            halted: false,
            halt_on_exception,
            last_error: None,
        })
    }

    /// Run one tick.  Failures never escape; see [`Machine::last_error`].
    pub fn execute_next_instruction(&mut self) {
        if self.halted {
            return;
        }
        if !self.long_operations.is_empty() {
            if let Err(failure) = self.step_long_operation() {
                self.report(failure);
                if self.halt_on_exception {
                    self.halted = true;
                }
            }
            return;
        }
        if let Err(failure) = self.execute_current_element() {
            self.report(failure);
            if self.halt_on_exception {
                self.halted = true;
            } else {
                self.advance_instruction_pointer();
            }
        }
    }

    /// Tick until the machine halts.  A long operation that never completes
    /// keeps this from returning.
    pub fn execute_until_halted(&mut self) {
        while !self.halted {
            self.execute_next_instruction();
        }
    }

    fn execute_current_element(&mut self) -> Result<(), MachineError> {
        let frame = self.top_frame()?;
        let archive = Arc::clone(&self.archive);
        let scenario = archive
            .scenario(frame.scene)
            .ok_or(MachineError::InvalidScenario(frame.scene))?;
        match scenario.element(frame.offset) {
            Some(element) => element.run_on_machine(self),
            None => {
                debug!(scene = frame.scene, offset = frame.offset, "ran off end of scenario");
                self.halted = true;
                Ok(())
            }
        }
    }

    fn step_long_operation(&mut self) -> Result<(), MachineError> {
        let Some(mut operation) = self.long_operations.pop() else {
            return Ok(());
        };
        let depth = self.long_operations.len();
        match operation.step(self) {
            Ok(false) => {
                self.long_operations.insert(depth, operation);
                Ok(())
            }
            Ok(true) => {
                debug!(operation = operation.name(), "long operation finished");
                self.pop_long_operation_frame();
                Ok(())
            }
            Err(failure) => {
                debug!(operation = operation.name(), "long operation discarded");
                self.pop_long_operation_frame();
                Err(failure)
            }
        }
    }

    fn pop_long_operation_frame(&mut self) {
        if let Some(index) = self
            .call_stack
            .iter()
            .rposition(|frame| frame.frame_type == FrameType::LongOperation)
        {
            self.call_stack.remove(index);
        }
    }

    fn report(&mut self, failure: MachineError) {
        let scene = self.call_stack.last().map(|frame| frame.scene);
        error!(
            scene = scene.unwrap_or(-1),
            line = self.line,
            error = %failure,
            halting = self.halt_on_exception,
            "instruction failed"
        );
        self.last_error = Some(failure);
    }

    /// Move the top frame to the next element, halting at the end of its
    /// scenario.
    pub fn advance_instruction_pointer(&mut self) {
        self.step_instruction_pointer();
        if let Some(frame) = self.call_stack.last() {
            let length = self
                .archive
                .scenario(frame.scene)
                .map(Scenario::len)
                .unwrap_or(0);
            if frame.offset >= length {
                self.halted = true;
            }
        }
    }

    /// Move the top frame to the next element without the end-of-scenario
    /// check.  Calls use this before pushing so returns resume after them.
    pub fn step_instruction_pointer(&mut self) {
        if let Some(frame) = self.call_stack.last_mut() {
            frame.offset += 1;
        }
    }

    /// Continue at `entrypoint` of `scene` in place of the current frame.
    pub fn jump(&mut self, scene: i32, entrypoint: i32) -> Result<(), MachineError> {
        let offset = self.resolve_entrypoint(scene, entrypoint)?;
        let frame = self
            .call_stack
            .last_mut()
            .ok_or(MachineError::EmptyCallStack)?;
        frame.scene = scene;
        frame.offset = offset;
        debug!(scene, entrypoint, "jump");
        Ok(())
    }

    pub fn farcall(&mut self, scene: i32, entrypoint: i32) -> Result<(), MachineError> {
        let offset = self.resolve_entrypoint(scene, entrypoint)?;
        self.call_stack.push(StackFrame::new(scene, offset, FrameType::Farcall));
        debug!(scene, entrypoint, depth = self.call_stack.len(), "farcall");
        Ok(())
    }

    pub fn return_from_farcall(&mut self) -> Result<(), MachineError> {
        self.pop_frame(FrameType::Farcall)
    }

    /// Call `offset` within the current scenario.
    pub fn gosub(&mut self, offset: ElementOffset) -> Result<(), MachineError> {
        let scene = self.top_frame()?.scene;
        self.check_position(scene, offset)?;
        self.call_stack.push(StackFrame::new(scene, offset, FrameType::Gosub));
        debug!(scene, offset, depth = self.call_stack.len(), "gosub");
        Ok(())
    }

    /// Gosub from the element under the pointer, so the return lands on the
    /// element after it.  The caller frame only moves once the target checks out.
    pub fn gosub_from_current(&mut self, offset: ElementOffset) -> Result<(), MachineError> {
        let scene = self.top_frame()?.scene;
        self.check_position(scene, offset)?;
        self.step_instruction_pointer();
        self.gosub(offset)
    }

    /// Farcall counterpart of [`Machine::gosub_from_current`].
    pub fn farcall_from_current(
        &mut self,
        scene: i32,
        entrypoint: i32,
    ) -> Result<(), MachineError> {
        self.resolve_entrypoint(scene, entrypoint)?;
        self.step_instruction_pointer();
        self.farcall(scene, entrypoint)
    }

    pub fn return_from_gosub(&mut self) -> Result<(), MachineError> {
        self.pop_frame(FrameType::Gosub)
    }

    /// Reposition the current frame within its scenario.
    pub fn goto_location(&mut self, offset: ElementOffset) -> Result<(), MachineError> {
        let scene = self.top_frame()?.scene;
        self.check_position(scene, offset)?;
        if let Some(frame) = self.call_stack.last_mut() {
            frame.offset = offset;
        }
        Ok(())
    }

    fn pop_frame(&mut self, expected: FrameType) -> Result<(), MachineError> {
        let top = self.top_frame()?;
        if top.frame_type != expected {
            return Err(MachineError::CallStackMismatch {
                expected,
                found: top.frame_type,
            });
        }
        if self.call_stack.len() == 1 {
            return Err(MachineError::CannotPopRoot);
        }
        self.call_stack.pop();
        debug!(?expected, depth = self.call_stack.len(), "returned");
        Ok(())
    }

    fn resolve_entrypoint(
        &self,
        scene: i32,
        entrypoint: i32,
    ) -> Result<ElementOffset, MachineError> {
        self.archive
            .scenario(scene)
            .ok_or(MachineError::InvalidScenario(scene))?
            .find_entrypoint(entrypoint)
    }

    fn check_position(&self, scene: i32, offset: ElementOffset) -> Result<(), MachineError> {
        let scenario = self
            .archive
            .scenario(scene)
            .ok_or(MachineError::InvalidScenario(scene))?;
        if offset > scenario.len() {
            return Err(MachineError::InvalidPosition { scene, offset });
        }
        Ok(())
    }

    fn top_frame(&self) -> Result<StackFrame, MachineError> {
        self.call_stack
            .last()
            .copied()
            .ok_or(MachineError::EmptyCallStack)
    }

    /// Suspend bytecode execution until `operation` completes.
    pub fn push_long_operation(&mut self, operation: Box<dyn LongOperation>) {
        if let Some(top) = self.call_stack.last().copied() {
            self.call_stack.push(StackFrame {
                frame_type: FrameType::LongOperation,
                ..top
            });
        }
        debug!(operation = operation.name(), "long operation pushed");
        self.long_operations.push(operation);
    }

    pub fn pending_long_operations(&self) -> usize {
        self.long_operations.len()
    }

    pub fn perform_textout(&mut self, text: &TextoutElement) -> Result<(), MachineError> {
        let decoded = text.decode(self.text_encoding());
        self.step_instruction_pointer();
        self.push_long_operation(Box::new(TextoutLongOperation::new(&decoded)));
        Ok(())
    }

    pub fn execute_expression(&mut self, element: &ExpressionElement) -> Result<(), MachineError> {
        element.expression.integer_value(self)?;
        self.advance_instruction_pointer();
        Ok(())
    }

    pub fn execute_command(&mut self, command: &CommandElement) -> Result<(), MachineError> {
        let modules = Arc::clone(&self.modules);
        modules.dispatch(self, command)
    }

    pub fn get_int_value(&self, raw_type: i32, location: i32) -> Result<i32, MachineError> {
        Ok(self.memory.get_int_value(raw_type, location)?)
    }

    pub fn set_int_value(
        &mut self,
        raw_type: i32,
        location: i32,
        value: i32,
    ) -> Result<(), MachineError> {
        Ok(self.memory.set_int_value(raw_type, location, value)?)
    }

    pub fn get_string_value(&self, raw_type: i32, location: i32) -> Result<&str, MachineError> {
        Ok(self.memory.get_string_value(raw_type, location)?)
    }

    pub fn set_string_value(
        &mut self,
        raw_type: i32,
        location: i32,
        value: impl Into<String>,
    ) -> Result<(), MachineError> {
        Ok(self.memory.set_string_value(raw_type, location, value)?)
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn store_register(&self) -> i32 {
        self.store_register
    }

    pub fn set_store_register(&mut self, value: i32) {
        self.store_register = value;
    }

    pub fn line_number(&self) -> i32 {
        self.line
    }

    pub fn set_line_number(&mut self, line: i32) {
        self.line = line;
    }

    /// Mark kidoku `index` of the current scene as read.
    pub fn record_kidoku(&mut self, index: i32) {
        if let Some(frame) = self.call_stack.last() {
            self.kidoku.entry(frame.scene).or_default().insert(index);
        }
    }

    pub fn kidoku_seen(&self, scene: i32, index: i32) -> bool {
        self.kidoku
            .get(&scene)
            .is_some_and(|seen| seen.contains(&index))
    }

    pub fn scene_number(&self) -> Option<i32> {
        self.call_stack.last().map(|frame| frame.scene)
    }

    pub fn instruction_offset(&self) -> Option<ElementOffset> {
        self.call_stack.last().map(|frame| frame.offset)
    }

    /// Text encoding of the scenario currently executing.
    pub fn text_encoding(&self) -> Option<i32> {
        self.scene_number()
            .and_then(|scene| self.archive.scenario(scene))
            .map(Scenario::encoding)
    }

    pub fn call_stack(&self) -> &[StackFrame] {
        &self.call_stack
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn halt_on_exception(&self) -> bool {
        self.halt_on_exception
    }

    pub fn set_halt_on_exception(&mut self, halt: bool) {
        self.halt_on_exception = halt;
    }

    /// Most recent failure caught at the tick boundary.
    pub fn last_error(&self) -> Option<&MachineError> {
        self.last_error.as_ref()
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn system(&self) -> &dyn System {
        self.system.as_ref()
    }

    pub fn system_mut(&mut self) -> &mut dyn System {
        self.system.as_mut()
    }

    /// Swap in state read from a save file.  Pending long operations are
    /// dropped and the machine resumes running.
    pub(crate) fn install_saved_state(
        &mut self,
        local: LocalMemory,
        line: i32,
        call_stack: Vec<StackFrame>,
    ) {
        self.memory.replace_local(local);
        self.line = line;
        self.call_stack = call_stack;
        self.long_operations.clear();
        self.halted = false;
        self.last_error = None;
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("call_stack", &self.call_stack)
            .field("long_operations", &self.long_operations)
            .field("store_register", &self.store_register)
            .field("line", &self.line)
            .field("halted", &self.halted)
            .field("halt_on_exception", &self.halt_on_exception)
            .finish_non_exhaustive()
    }
}

/// Errors raised while executing bytecode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error("scenario {0} is not in the archive")]
    InvalidScenario(i32),
    #[error("scenario {scene} has no entrypoint {entrypoint}")]
    InvalidEntrypoint { scene: i32, entrypoint: i32 },
    #[error("offset {offset} lies outside scenario {scene}")]
    InvalidPosition { scene: i32, offset: ElementOffset },
    #[error("call stack is empty")]
    EmptyCallStack,
    #[error("return expected a {expected:?} frame but the top frame is {found:?}")]
    CallStackMismatch {
        expected: FrameType,
        found: FrameType,
    },
    #[error("cannot pop the root frame")]
    CannotPopRoot,
    #[error("no module registered for type {modtype}, number {module}")]
    UndefinedModule { modtype: u8, module: u8 },
    #[error("module {module} has no opcode {opcode} overload {overload}")]
    UndefinedOpcode {
        module: String,
        opcode: u16,
        overload: u8,
    },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("division by zero")]
    DivideByZero,
    #[error("opcode {opcode} is missing parameter {index}")]
    MissingParameter { opcode: u16, index: usize },
    #[error("opcode {opcode} is missing pointer {index}")]
    MissingPointer { opcode: u16, index: usize },
    #[error("more than {limit} string arguments")]
    TooManyArguments { limit: usize },
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
}
