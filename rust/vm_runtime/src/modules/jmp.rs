//! Control flow module (type 0, number 1).
//!
//! Every operation here positions the instruction pointer itself.  Calls move
//! the caller past the call element before pushing, so returning resumes at
//! the following element.

use crate::bytecode::{CommandElement, CommandKind};
use crate::expression::Expression;
use crate::machine::{Machine, MachineError};
use crate::memory::{IntBankId, STRK_TYPE, STRING_K_SIZE};

use super::OpcodeModule;

pub const MODULE_TYPE: u8 = 0;
pub const MODULE_NUMBER: u8 = 1;

pub fn module() -> OpcodeModule {
    let mut module = OpcodeModule::new("Jmp", MODULE_TYPE, MODULE_NUMBER);
    module
        .add_control_op(0, 0, "goto", goto)
        .add_control_op(1, 0, "goto_if", goto_if)
        .add_control_op(2, 0, "goto_unless", goto_unless)
        .add_control_op(3, 0, "goto_on", goto_on)
        .add_control_op(4, 0, "goto_case", goto_case)
        .add_control_op(5, 0, "gosub", gosub)
        .add_control_op(6, 0, "gosub_if", gosub_if)
        .add_control_op(7, 0, "gosub_unless", gosub_unless)
        .add_control_op(8, 0, "gosub_on", gosub_on)
        .add_control_op(9, 0, "gosub_case", gosub_case)
        .add_control_op(10, 0, "ret", ret)
        .add_control_op(11, 0, "jump", jump)
        .add_control_op(11, 1, "jump", jump)
        .add_control_op(12, 0, "farcall", farcall)
        .add_control_op(12, 1, "farcall", farcall)
        .add_control_op(13, 0, "rtl", rtl)
        .add_control_op(16, 0, "gosub_with", gosub_with)
        .add_control_op(17, 0, "ret_with", ret_with)
        .add_control_op(18, 0, "farcall_with", farcall_with)
        .add_control_op(19, 0, "rtl_with", rtl_with);
    module
}

fn goto(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    machine.goto_location(command.pointer(0)?.target)
}

fn goto_if(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    branch_if(machine, command, true, false)
}

fn goto_unless(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    branch_if(machine, command, false, false)
}

fn gosub_if(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    branch_if(machine, command, true, true)
}

fn gosub_unless(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    branch_if(machine, command, false, true)
}

fn goto_on(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    branch_on(machine, command, false)
}

fn gosub_on(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    branch_on(machine, command, true)
}

fn goto_case(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    branch_case(machine, command, false)
}

fn gosub_case(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    branch_case(machine, command, true)
}

fn gosub(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    let target = command.pointer(0)?.target;
    machine.gosub_from_current(target)
}

fn ret(machine: &mut Machine, _command: &CommandElement) -> Result<(), MachineError> {
    machine.return_from_gosub()
}

fn jump(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    let (scene, entrypoint) = scene_and_entrypoint(machine, command)?;
    machine.jump(scene, entrypoint)
}

fn farcall(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    let (scene, entrypoint) = scene_and_entrypoint(machine, command)?;
    machine.farcall_from_current(scene, entrypoint)
}

fn rtl(machine: &mut Machine, _command: &CommandElement) -> Result<(), MachineError> {
    machine.return_from_farcall()
}

fn gosub_with(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    let target = command.pointer(0)?.target;
    copy_arguments(machine, command.params())?;
    machine.gosub_from_current(target)
}

fn ret_with(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    let value = optional_int(machine, command, 0)?.unwrap_or(0);
    machine.return_from_gosub()?;
    machine.set_store_register(value);
    Ok(())
}

fn farcall_with(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    let (scene, entrypoint) = scene_and_entrypoint(machine, command)?;
    let arguments = command.params().get(2..).unwrap_or_default();
    copy_arguments(machine, arguments)?;
    machine.farcall_from_current(scene, entrypoint)
}

fn rtl_with(machine: &mut Machine, command: &CommandElement) -> Result<(), MachineError> {
    let value = optional_int(machine, command, 0)?.unwrap_or(0);
    machine.return_from_farcall()?;
    machine.set_store_register(value);
    Ok(())
}

fn branch_if(
    machine: &mut Machine,
    command: &CommandElement,
    when: bool,
    call: bool,
) -> Result<(), MachineError> {
    let condition = command.param(0)?.integer_value(machine)? != 0;
    if condition != when {
        machine.advance_instruction_pointer();
        return Ok(());
    }
    enter(machine, command.pointer(0)?.target, call)
}

fn branch_on(
    machine: &mut Machine,
    command: &CommandElement,
    call: bool,
) -> Result<(), MachineError> {
    let index = command.param(0)?.integer_value(machine)?;
    let target = usize::try_from(index)
        .ok()
        .and_then(|index| command.pointers().get(index));
    match target {
        Some(pointer) => enter(machine, pointer.target, call),
        None => {
            machine.advance_instruction_pointer();
            Ok(())
        }
    }
}

fn branch_case(
    machine: &mut Machine,
    command: &CommandElement,
    call: bool,
) -> Result<(), MachineError> {
    let CommandKind::GotoCase {
        value,
        cases,
        targets,
    } = &command.kind
    else {
        return Err(MachineError::MissingPointer {
            opcode: command.opcode(),
            index: 0,
        });
    };
    let value = value.integer_value(machine)?;
    for (case, pointer) in cases.iter().zip(targets) {
        let matched = match case {
            None => true,
            Some(case) => case.integer_value(machine)? == value,
        };
        if matched {
            return enter(machine, pointer.target, call);
        }
    }
    machine.advance_instruction_pointer();
    Ok(())
}

fn enter(machine: &mut Machine, target: usize, call: bool) -> Result<(), MachineError> {
    if call {
        machine.gosub_from_current(target)
    } else {
        machine.goto_location(target)
    }
}

fn scene_and_entrypoint(
    machine: &mut Machine,
    command: &CommandElement,
) -> Result<(i32, i32), MachineError> {
    let scene = command.param(0)?.integer_value(machine)?;
    let entrypoint = optional_int(machine, command, 1)?.unwrap_or(0);
    Ok((scene, entrypoint))
}

fn optional_int(
    machine: &mut Machine,
    command: &CommandElement,
    index: usize,
) -> Result<Option<i32>, MachineError> {
    command
        .params()
        .get(index)
        .map(|param| param.integer_value(machine))
        .transpose()
}

/// Integer arguments land in intL[0..], string arguments in strK[0..].
fn copy_arguments(machine: &mut Machine, arguments: &[Expression]) -> Result<(), MachineError> {
    let int_l = IntBankId::L.bytecode_index();
    let mut next_int = 0;
    let mut next_string = 0;
    for argument in arguments {
        if argument.is_string() {
            if next_string >= STRING_K_SIZE as i32 {
                return Err(MachineError::TooManyArguments {
                    limit: STRING_K_SIZE,
                });
            }
            let text = argument.string_value(machine)?;
            machine.set_string_value(STRK_TYPE, next_string, text)?;
            next_string += 1;
        } else {
            let value = argument.integer_value(machine)?;
            machine.set_int_value(int_l, next_int, value)?;
            next_int += 1;
        }
    }
    Ok(())
}
