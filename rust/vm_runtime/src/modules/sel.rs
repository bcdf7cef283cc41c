//! Selection module (type 0, number 2).

use crate::bytecode::{CommandElement, CommandKind};
use crate::long_operation::SelectLongOperation;
use crate::machine::{Machine, MachineError};

use super::OpcodeModule;

pub const MODULE_TYPE: u8 = 0;
pub const MODULE_NUMBER: u8 = 2;

pub fn module() -> OpcodeModule {
    let mut module = OpcodeModule::new("Sel", MODULE_TYPE, MODULE_NUMBER);
    module
        .add_control_op(0, 0, "select_w", select)
        .add_control_op(1, 0, "select", select)
        .add_control_op(2, 0, "select_s2", select)
        .add_control_op(3, 0, "select_s", select);
    module
}

/// Present the options and suspend until the player picks one.  The chosen
/// index ends up in the store register.
fn select(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    let CommandKind::Select { window, options } = &command.kind else {
        return Err(MachineError::MissingParameter {
            opcode: command.opcode(),
            index: 0,
        });
    };
    let window = match window {
        Some(window) => Some(window.integer_value(machine)?),
        None => None,
    };
    let mut choices = Vec::with_capacity(options.len());
    for option in options {
        choices.push(option.text.string_value(machine)?);
    }
    machine.step_instruction_pointer();
    machine.push_long_operation(Box::new(SelectLongOperation::new(window, choices)));
    Ok(())
}
