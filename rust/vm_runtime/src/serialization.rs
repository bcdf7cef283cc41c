//! Save files.
//!
//! A save file is four JSON records, one per line, in this order: the header,
//! local memory, the machine record (line number and pruned call stack) and
//! the system snapshot.  The order is the format; reordering breaks existing
//! saves.
//!
//! Loading is staged.  Every record is parsed and every frame is resolved
//! against the machine's archive before anything on the machine or its system
//! changes, so a corrupt file leaves both untouched.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::machine::{FrameType, Machine, StackFrame};
use crate::memory::{LocalMemory, Memory};
use crate::system::{System, SystemSnapshot};

mod timestamp_format {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveGameHeader {
    pub title: String,
    #[serde(with = "timestamp_format")]
    pub save_time: SystemTime,
}

impl SaveGameHeader {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            save_time: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MachineRecord {
    line: i32,
    call_stack: Vec<StackFrame>,
}

const HEADER: &str = "header";
const LOCAL_MEMORY: &str = "local memory";
const MACHINE: &str = "machine";
const SYSTEM: &str = "system";

/// Path of the save file for `slot`.
pub fn build_save_game_filename(system: &dyn System, slot: u32) -> PathBuf {
    system.game_save_directory().join(format!("save{slot:03}.sav"))
}

/// Frames below the first long-operation frame; only those can be resumed.
pub fn pruned_call_stack(call_stack: &[StackFrame]) -> Vec<StackFrame> {
    call_stack
        .iter()
        .take_while(|frame| frame.frame_type != FrameType::LongOperation)
        .copied()
        .collect()
}

pub fn save_game_for_slot(machine: &Machine, slot: u32) -> Result<PathBuf, SaveError> {
    let path = build_save_game_filename(machine.system(), slot);
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(directory)?;
    // The slot is only replaced once the new save is fully on disk.
    let staged = NamedTempFile::new_in(directory)?;
    let mut writer = BufWriter::new(staged);
    save_game_to(&mut writer, machine)?;
    let staged = writer.into_inner().map_err(|err| err.into_error())?;
    staged.persist(&path).map_err(|err| err.error)?;
    info!(slot, path = %path.display(), "game saved");
    Ok(path)
}

pub fn save_game_to<W: Write>(mut writer: W, machine: &Machine) -> Result<(), SaveError> {
    let header = SaveGameHeader::new(machine.system().graphics().window_subtitle());
    let record = MachineRecord {
        line: machine.line_number(),
        call_stack: pruned_call_stack(machine.call_stack()),
    };
    write_record(&mut writer, HEADER, &header)?;
    write_record(&mut writer, LOCAL_MEMORY, machine.memory().local())?;
    write_record(&mut writer, MACHINE, &record)?;
    write_record(&mut writer, SYSTEM, &machine.system().snapshot())?;
    Ok(())
}

pub fn load_game_for_slot(machine: &mut Machine, slot: u32) -> Result<(), SaveError> {
    let path = build_save_game_filename(machine.system(), slot);
    let reader = BufReader::new(File::open(&path)?);
    load_game_from(reader, machine)?;
    info!(slot, path = %path.display(), "game loaded");
    Ok(())
}

pub fn load_game_from<R: BufRead>(reader: R, machine: &mut Machine) -> Result<(), SaveError> {
    let mut lines = reader.lines();
    let _header: SaveGameHeader = read_record(&mut lines, HEADER)?;
    let local = read_local_memory(&mut lines)?;
    let record: MachineRecord = read_record(&mut lines, MACHINE)?;
    let snapshot: SystemSnapshot = read_record(&mut lines, SYSTEM)?;
    validate_call_stack(machine, &record.call_stack)?;

    machine.system_mut().reset();
    machine.install_saved_state(local, record.line, record.call_stack);
    let system = machine.system_mut();
    system.restore(snapshot);
    let graphics = system.graphics_mut();
    graphics.replay_graphics_stack();
    graphics.mark_screen_for_refresh();
    Ok(())
}

pub fn load_header_for_slot(
    system: &dyn System,
    slot: u32,
) -> Result<SaveGameHeader, SaveError> {
    let path = build_save_game_filename(system, slot);
    load_header_from(BufReader::new(File::open(path)?))
}

pub fn load_header_from<R: BufRead>(reader: R) -> Result<SaveGameHeader, SaveError> {
    read_record(&mut reader.lines(), HEADER)
}

/// Read the local memory of `slot` into `memory`, leaving global memory
/// alone.  Used to preview a slot without loading it.
pub fn load_local_memory_for_slot(
    system: &dyn System,
    slot: u32,
    memory: &mut Memory,
) -> Result<(), SaveError> {
    let path = build_save_game_filename(system, slot);
    load_local_memory_from(BufReader::new(File::open(path)?), memory)
}

pub fn load_local_memory_from<R: BufRead>(
    reader: R,
    memory: &mut Memory,
) -> Result<(), SaveError> {
    let mut lines = reader.lines();
    let _header: SaveGameHeader = read_record(&mut lines, HEADER)?;
    let local = read_local_memory(&mut lines)?;
    memory.replace_local(local);
    Ok(())
}

fn read_local_memory<R: BufRead>(lines: &mut Lines<R>) -> Result<LocalMemory, SaveError> {
    let local: LocalMemory = read_record(lines, LOCAL_MEMORY)?;
    local.validate().map_err(SaveError::CorruptSaveFile)?;
    Ok(local)
}

fn validate_call_stack(machine: &Machine, call_stack: &[StackFrame]) -> Result<(), SaveError> {
    match call_stack.first() {
        None => {
            return Err(SaveError::CorruptSaveFile(
                "saved call stack is empty".to_owned(),
            ))
        }
        Some(frame) if frame.frame_type != FrameType::Root => {
            return Err(SaveError::CorruptSaveFile(format!(
                "bottom frame is {:?}, expected Root",
                frame.frame_type
            )))
        }
        Some(_) => {}
    }
    for frame in call_stack {
        let scenario = machine.archive().scenario(frame.scene).ok_or_else(|| {
            SaveError::CorruptSaveFile(format!("unknown scenario {}", frame.scene))
        })?;
        if frame.offset > scenario.len() {
            return Err(SaveError::CorruptSaveFile(format!(
                "offset {} is past the end of scenario {} ({} elements)",
                frame.offset,
                frame.scene,
                scenario.len()
            )));
        }
        if frame.frame_type == FrameType::LongOperation {
            return Err(SaveError::CorruptSaveFile(
                "long operation frames cannot be restored".to_owned(),
            ));
        }
    }
    Ok(())
}

fn write_record<W: Write, T: Serialize + ?Sized>(
    writer: &mut W,
    record: &'static str,
    value: &T,
) -> Result<(), SaveError> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|source| SaveError::Format { record, source })?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn read_record<R: BufRead, T: DeserializeOwned>(
    lines: &mut Lines<R>,
    record: &'static str,
) -> Result<T, SaveError> {
    let line = lines.next().ok_or(SaveError::MissingRecord(record))??;
    serde_json::from_str(&line).map_err(|source| SaveError::Format { record, source })
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("save file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed {record} record: {source}")]
    Format {
        record: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("save file ends before the {0} record")]
    MissingRecord(&'static str),
    #[error("corrupt save file: {0}")]
    CorruptSaveFile(String),
}
