//! Operations that span several machine ticks.
//!
//! While a long operation is pending, each tick runs one of its steps instead
//! of a bytecode element.  The operation reports when it is finished; the
//! machine then drops it and resumes the script.

use std::fmt;

use crate::machine::{Machine, MachineError};

pub trait LongOperation {
    fn name(&self) -> &str;

    /// Run one tick of work. Returns `true` once the operation is complete.
    fn step(&mut self, machine: &mut Machine) -> Result<bool, MachineError>;
}

impl<F> LongOperation for F
where
    F: FnMut(&mut Machine) -> Result<bool, MachineError>,
{
    fn name(&self) -> &str {
        "closure"
    }

    fn step(&mut self, machine: &mut Machine) -> Result<bool, MachineError> {
        self(machine)
    }
}

impl fmt::Debug for dyn LongOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LongOperation({})", self.name())
    }
}

/// Types text into the active window one character per tick.
#[derive(Debug, Clone)]
pub struct TextoutLongOperation {
    characters: Vec<char>,
    shown: usize,
}

impl TextoutLongOperation {
    pub fn new(text: &str) -> Self {
        Self {
            characters: text.chars().collect(),
            shown: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.characters.len() - self.shown
    }
}

impl LongOperation for TextoutLongOperation {
    fn name(&self) -> &str {
        "textout"
    }

    fn step(&mut self, machine: &mut Machine) -> Result<bool, MachineError> {
        let text = machine.system_mut().text_mut();
        let end = if text.message_no_wait() || text.fast_text_mode() {
            self.characters.len()
        } else {
            (self.shown + 1).min(self.characters.len())
        };
        let chunk: String = self.characters[self.shown..end].iter().collect();
        if !chunk.is_empty() {
            text.display_text(&chunk);
        }
        self.shown = end;
        Ok(self.shown == self.characters.len())
    }
}

/// Waits for the player to pick one of several options.
#[derive(Debug, Clone)]
pub struct SelectLongOperation {
    window: Option<i32>,
    options: Vec<String>,
}

impl SelectLongOperation {
    pub fn new(window: Option<i32>, options: Vec<String>) -> Self {
        Self { window, options }
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }
}

impl LongOperation for SelectLongOperation {
    fn name(&self) -> &str {
        "select"
    }

    fn step(&mut self, machine: &mut Machine) -> Result<bool, MachineError> {
        if self.options.is_empty() {
            machine.set_store_register(0);
            return Ok(true);
        }
        let choice = machine
            .system_mut()
            .text_mut()
            .poll_selection(self.window, &self.options);
        match choice {
            Some(index) => {
                machine.set_store_register(index as i32);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
