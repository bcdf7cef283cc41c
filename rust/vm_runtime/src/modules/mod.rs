//! Opcode modules and the dispatch table that routes commands to them.
//!
//! Every command names a (module type, module number) pair in its header.  The
//! table maps the packed pair onto the module that implements it; the module
//! then picks a handler by opcode and overload.  Tables are assembled once with
//! [`ModuleTableBuilder`] and are immutable afterwards, so the machine shares
//! one behind an `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::bytecode::CommandElement;
use crate::machine::{Machine, MachineError};

pub mod jmp;
pub mod sel;

/// Pack a module type and number into the table key: type in the high byte.
#[inline]
pub fn pack_module_number(module_type: u8, module_number: u8) -> u16 {
    (u16::from(module_type) << 8) | u16::from(module_number)
}

/// Inverse of [`pack_module_number`].
#[inline]
pub fn unpack_module_number(packed: u16) -> (u8, u8) {
    ((packed >> 8) as u8, (packed & 0xFF) as u8)
}

/// A set of opcode handlers sharing one module key.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;
    fn module_type(&self) -> u8;
    fn module_number(&self) -> u8;

    /// Execute `command` against the machine.
    fn dispatch(&self, machine: &mut Machine, command: &CommandElement)
        -> Result<(), MachineError>;

    fn packed_key(&self) -> u16 {
        pack_module_number(self.module_type(), self.module_number())
    }
}

pub type OpcodeHandler = fn(&mut Machine, &CommandElement) -> Result<(), MachineError>;

#[derive(Clone, Copy)]
struct Operation {
    name: &'static str,
    handler: OpcodeHandler,
    /// Ordinary operations leave the pointer alone and are advanced here;
    /// control operations position it themselves.
    advances: bool,
}

/// Module whose handlers are keyed by (opcode, overload).
pub struct OpcodeModule {
    name: String,
    module_type: u8,
    module_number: u8,
    operations: HashMap<(u16, u8), Operation>,
}

impl OpcodeModule {
    pub fn new(name: impl Into<String>, module_type: u8, module_number: u8) -> Self {
        Self {
            name: name.into(),
            module_type,
            module_number,
            operations: HashMap::new(),
        }
    }

    /// Register an operation after which the instruction pointer advances.
    pub fn add_op(
        &mut self,
        opcode: u16,
        overload: u8,
        name: &'static str,
        handler: OpcodeHandler,
    ) -> &mut Self {
        self.insert(opcode, overload, name, handler, true)
    }

    /// Register an operation that positions the instruction pointer itself.
    pub fn add_control_op(
        &mut self,
        opcode: u16,
        overload: u8,
        name: &'static str,
        handler: OpcodeHandler,
    ) -> &mut Self {
        self.insert(opcode, overload, name, handler, false)
    }

    fn insert(
        &mut self,
        opcode: u16,
        overload: u8,
        name: &'static str,
        handler: OpcodeHandler,
        advances: bool,
    ) -> &mut Self {
        self.operations.insert(
            (opcode, overload),
            Operation {
                name,
                handler,
                advances,
            },
        );
        self
    }

    pub fn operation_name(&self, opcode: u16, overload: u8) -> Option<&'static str> {
        self.operations
            .get(&(opcode, overload))
            .map(|operation| operation.name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Module for OpcodeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn module_type(&self) -> u8 {
        self.module_type
    }

    fn module_number(&self) -> u8 {
        self.module_number
    }

    fn dispatch(
        &self,
        machine: &mut Machine,
        command: &CommandElement,
    ) -> Result<(), MachineError> {
        let operation = self
            .operations
            .get(&(command.opcode(), command.overload()))
            .ok_or_else(|| MachineError::UndefinedOpcode {
                module: self.name.clone(),
                opcode: command.opcode(),
                overload: command.overload(),
            })?;
        (operation.handler)(machine, command)?;
        if operation.advances {
            machine.advance_instruction_pointer();
        }
        Ok(())
    }
}

impl fmt::Debug for OpcodeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcodeModule")
            .field("name", &self.name)
            .field("module_type", &self.module_type)
            .field("module_number", &self.module_number)
            .field("operations", &self.operations.len())
            .finish()
    }
}

/// Collects modules and rejects duplicate keys.
#[derive(Default)]
pub struct ModuleTableBuilder {
    modules: BTreeMap<u16, Box<dyn Module>>,
}

impl ModuleTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded with the control-flow and selection modules.
    pub fn standard() -> Result<Self, ModuleError> {
        let mut builder = Self::new();
        builder.attach(Box::new(jmp::module()))?;
        builder.attach(Box::new(sel::module()))?;
        Ok(builder)
    }

    pub fn attach(&mut self, module: Box<dyn Module>) -> Result<(), ModuleError> {
        let key = module.packed_key();
        if let Some(existing) = self.modules.get(&key) {
            return Err(ModuleError::Clash {
                key,
                existing: existing.name().to_owned(),
                incoming: module.name().to_owned(),
            });
        }
        debug!(
            module = module.name(),
            module_type = module.module_type(),
            module_number = module.module_number(),
            "attached opcode module"
        );
        self.modules.insert(key, module);
        Ok(())
    }

    pub fn build(self) -> ModuleTable {
        ModuleTable {
            modules: self.modules,
        }
    }
}

/// Immutable lookup from packed module key to module.
pub struct ModuleTable {
    modules: BTreeMap<u16, Box<dyn Module>>,
}

impl ModuleTable {
    pub fn standard() -> Result<Self, ModuleError> {
        Ok(ModuleTableBuilder::standard()?.build())
    }

    pub fn module(&self, module_type: u8, module_number: u8) -> Option<&dyn Module> {
        self.modules
            .get(&pack_module_number(module_type, module_number))
            .map(|module| module.as_ref())
    }

    pub fn keys(&self) -> impl Iterator<Item = u16> + '_ {
        self.modules.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn dispatch(
        &self,
        machine: &mut Machine,
        command: &CommandElement,
    ) -> Result<(), MachineError> {
        let module = self
            .module(command.modtype(), command.module())
            .ok_or(MachineError::UndefinedModule {
                modtype: command.modtype(),
                module: command.module(),
            })?;
        module.dispatch(machine, command)
    }
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.modules
                    .iter()
                    .map(|(key, module)| (*key, module.name().to_owned())),
            )
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("module '{incoming}' clashes with '{existing}' on key {key:#06x}")]
    Clash {
        key: u16,
        existing: String,
        incoming: String,
    },
}
