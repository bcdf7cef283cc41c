//! Scenarios and the archive that owns them.
//!
//! A scenario is immutable once built.  Call-stack frames refer to a scenario
//! by number and to an element by offset, and resolve both through the
//! archive whenever they need the live element.

use std::collections::BTreeMap;

use crate::bytecode::{BytecodeElement, ElementOffset};
use crate::decoder::{decode_stream, DecodeError};
use crate::machine::MachineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    scene: i32,
    encoding: i32,
    elements: Vec<BytecodeElement>,
    entrypoints: BTreeMap<i32, ElementOffset>,
}

impl Scenario {
    /// Assemble a scenario from already decoded elements.
    pub fn from_elements(scene: i32, elements: Vec<BytecodeElement>, encoding: i32) -> Self {
        let entrypoints = elements
            .iter()
            .enumerate()
            .filter_map(|(offset, element)| element.entrypoint().map(|entry| (entry, offset)))
            .collect();
        Self {
            scene,
            encoding,
            elements,
            entrypoints,
        }
    }

    /// Decode a scenario from its bytecode and kidoku table.
    pub fn decode(
        scene: i32,
        bytes: &[u8],
        kidoku_table: Vec<i32>,
        encoding: i32,
    ) -> Result<Self, DecodeError> {
        let elements = decode_stream(bytes, kidoku_table)?;
        Ok(Self::from_elements(scene, elements, encoding))
    }

    pub fn scene_number(&self) -> i32 {
        self.scene
    }

    /// Text encoding tag of the scenario's strings.
    pub fn encoding(&self) -> i32 {
        self.encoding
    }

    pub fn element(&self, offset: ElementOffset) -> Option<&BytecodeElement> {
        self.elements.get(offset)
    }

    pub fn elements(&self) -> &[BytecodeElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn entrypoints(&self) -> impl Iterator<Item = (i32, ElementOffset)> + '_ {
        self.entrypoints.iter().map(|(entry, offset)| (*entry, *offset))
    }

    /// Element offset of the marker for `entrypoint`.
    pub fn find_entrypoint(&self, entrypoint: i32) -> Result<ElementOffset, MachineError> {
        self.entrypoints
            .get(&entrypoint)
            .copied()
            .ok_or(MachineError::InvalidEntrypoint {
                scene: self.scene,
                entrypoint,
            })
    }
}

/// Every scenario of a game, keyed by scene number.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    scenarios: BTreeMap<i32, Scenario>,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a scenario, replacing any previous one with the same number.
    pub fn insert(&mut self, scenario: Scenario) -> Option<Scenario> {
        self.scenarios.insert(scenario.scene_number(), scenario)
    }

    pub fn scenario(&self, scene: i32) -> Option<&Scenario> {
        self.scenarios.get(&scene)
    }

    pub fn first_scene(&self) -> Option<i32> {
        self.scenarios.keys().next().copied()
    }

    pub fn scene_numbers(&self) -> impl Iterator<Item = i32> + '_ {
        self.scenarios.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

impl FromIterator<Scenario> for Archive {
    fn from_iter<I: IntoIterator<Item = Scenario>>(iter: I) -> Self {
        let mut archive = Archive::new();
        for scenario in iter {
            archive.insert(scenario);
        }
        archive
    }
}
