//! Host services the machine calls into.
//!
//! Rendering, audio and input live outside the VM core.  The machine only
//! needs a narrow slice of them: text pacing and display, the graphics replay
//! stack, a save directory and the game configuration.  [`NullSystem`] is a
//! headless implementation that records what it was asked to do.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::GameConfig;

/// Number of text windows a game may address.
pub const TEXT_WINDOW_COUNT: usize = 64;

pub trait System {
    fn game_save_directory(&self) -> PathBuf;
    fn config(&self) -> &GameConfig;
    fn text(&self) -> &dyn TextSystem;
    fn text_mut(&mut self) -> &mut dyn TextSystem;
    fn graphics(&self) -> &dyn GraphicsSystem;
    fn graphics_mut(&mut self) -> &mut dyn GraphicsSystem;

    /// Return every subsystem to its startup state.
    fn reset(&mut self);

    /// State that travels with a save file.
    fn snapshot(&self) -> SystemSnapshot;
    fn restore(&mut self, snapshot: SystemSnapshot);
}

pub trait TextSystem {
    fn message_no_wait(&self) -> bool;
    fn set_message_no_wait(&mut self, enabled: bool);
    fn fast_text_mode(&self) -> bool;
    fn set_fast_text_mode(&mut self, enabled: bool);

    fn active_window(&self) -> i32;
    fn set_active_window(&mut self, window: i32);
    fn key_cursor(&self) -> i32;
    fn set_key_cursor(&mut self, cursor: i32);

    /// Append text to the active window.
    fn display_text(&mut self, text: &str);

    /// Text shown so far in `window`.
    fn window_text(&self, window: i32) -> &str;

    /// Non-blocking check for a choice; `None` while the player is deciding.
    fn poll_selection(&mut self, window: Option<i32>, options: &[String]) -> Option<usize>;

    fn reset(&mut self);
}

pub trait GraphicsSystem {
    fn window_subtitle(&self) -> &str;
    fn set_window_subtitle(&mut self, subtitle: &str);

    fn graphics_stack(&self) -> &[GraphicsStackFrame];
    fn add_graphics_stack_frame(&mut self, frame: GraphicsStackFrame);
    fn set_graphics_stack(&mut self, stack: Vec<GraphicsStackFrame>);
    fn clear_graphics_stack(&mut self);

    /// Re-issue the recorded graphics commands after a load.
    fn replay_graphics_stack(&mut self);
    fn mark_screen_for_refresh(&mut self);

    fn reset(&mut self);
}

/// Rectangle in device coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// One recorded graphics command; replayed in order to rebuild the screen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsStackFrame {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_rect: Option<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_dc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_rect: Option<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<bool>,
}

impl GraphicsStackFrame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_target_dc(mut self, dc: i32) -> Self {
        self.target_dc = Some(dc);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub graphics_stack: Vec<GraphicsStackFrame>,
    pub active_window: i32,
    pub key_cursor: i32,
}

/// Fixed number of slots whose contents are created on first access.
#[derive(Debug, Clone)]
pub struct SlotArray<T> {
    slots: Vec<Option<T>>,
}

impl<T> SlotArray<T> {
    pub fn new(size: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(size).collect(),
        }
    }

    /// Number of slots, allocated or not.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Result<Option<&T>, SlotError> {
        self.slots
            .get(index)
            .map(Option::as_ref)
            .ok_or(SlotError::OutOfRange {
                index,
                size: self.slots.len(),
            })
    }

    pub fn get_or_insert_with(
        &mut self,
        index: usize,
        create: impl FnOnce() -> T,
    ) -> Result<&mut T, SlotError> {
        let size = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SlotError::OutOfRange { index, size })?;
        Ok(slot.get_or_insert_with(create))
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(_)))
    }

    /// Allocated slots in index order.
    pub fn allocated(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)))
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

impl<T: Default> SlotArray<T> {
    pub fn get_or_default(&mut self, index: usize) -> Result<&mut T, SlotError> {
        self.get_or_insert_with(index, T::default)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {index} out of range for {size} slots")]
    OutOfRange { index: usize, size: usize },
}

/// Text system that keeps displayed text per window and answers selections
/// from a queue.
#[derive(Debug, Clone)]
pub struct NullTextSystem {
    message_no_wait: bool,
    fast_text_mode: bool,
    active_window: i32,
    key_cursor: i32,
    windows: SlotArray<String>,
    selections: VecDeque<usize>,
}

impl NullTextSystem {
    pub fn new(message_no_wait: bool) -> Self {
        Self {
            message_no_wait,
            fast_text_mode: false,
            active_window: 0,
            key_cursor: 0,
            windows: SlotArray::new(TEXT_WINDOW_COUNT),
            selections: VecDeque::new(),
        }
    }

    /// Answer the next selection with `choice`.
    pub fn queue_selection(&mut self, choice: usize) {
        self.selections.push_back(choice);
    }
}

impl TextSystem for NullTextSystem {
    fn message_no_wait(&self) -> bool {
        self.message_no_wait
    }

    fn set_message_no_wait(&mut self, enabled: bool) {
        self.message_no_wait = enabled;
    }

    fn fast_text_mode(&self) -> bool {
        self.fast_text_mode
    }

    fn set_fast_text_mode(&mut self, enabled: bool) {
        self.fast_text_mode = enabled;
    }

    fn active_window(&self) -> i32 {
        self.active_window
    }

    fn set_active_window(&mut self, window: i32) {
        self.active_window = window;
    }

    fn key_cursor(&self) -> i32 {
        self.key_cursor
    }

    fn set_key_cursor(&mut self, cursor: i32) {
        self.key_cursor = cursor;
    }

    fn display_text(&mut self, text: &str) {
        let Ok(index) = usize::try_from(self.active_window) else {
            return;
        };
        if let Ok(window) = self.windows.get_or_default(index) {
            window.push_str(text);
        }
    }

    fn window_text(&self, window: i32) -> &str {
        usize::try_from(window)
            .ok()
            .and_then(|index| self.windows.get(index).ok().flatten())
            .map(String::as_str)
            .unwrap_or("")
    }

    fn poll_selection(&mut self, _window: Option<i32>, options: &[String]) -> Option<usize> {
        let choice = self.selections.pop_front()?;
        Some(choice.min(options.len().saturating_sub(1)))
    }

    fn reset(&mut self) {
        self.active_window = 0;
        self.key_cursor = 0;
        self.windows.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct NullGraphicsSystem {
    window_subtitle: String,
    stack: Vec<GraphicsStackFrame>,
}

impl NullGraphicsSystem {
    pub fn new(window_subtitle: impl Into<String>) -> Self {
        Self {
            window_subtitle: window_subtitle.into(),
            ..Self::default()
        }
    }
}

impl GraphicsSystem for NullGraphicsSystem {
    fn window_subtitle(&self) -> &str {
        &self.window_subtitle
    }

    fn set_window_subtitle(&mut self, subtitle: &str) {
        self.window_subtitle = subtitle.to_owned();
    }

    fn graphics_stack(&self) -> &[GraphicsStackFrame] {
        &self.stack
    }

    fn add_graphics_stack_frame(&mut self, frame: GraphicsStackFrame) {
        self.stack.push(frame);
    }

    fn set_graphics_stack(&mut self, stack: Vec<GraphicsStackFrame>) {
        self.stack = stack;
    }

    fn clear_graphics_stack(&mut self) {
        self.stack.clear();
    }

    fn replay_graphics_stack(&mut self) {
        debug!(frames = self.stack.len(), "replaying graphics stack");
    }

    fn mark_screen_for_refresh(&mut self) {}

    fn reset(&mut self) {
        self.stack.clear();
    }
}

/// Headless system bundle.
#[derive(Debug, Clone)]
pub struct NullSystem {
    config: GameConfig,
    text: NullTextSystem,
    graphics: NullGraphicsSystem,
}

impl NullSystem {
    pub fn new(config: GameConfig) -> Self {
        let text = NullTextSystem::new(config.message_no_wait);
        let graphics = NullGraphicsSystem::new(config.window_subtitle.clone());
        Self {
            config,
            text,
            graphics,
        }
    }

    /// Concrete text system, for queueing selections before a run.
    pub fn null_text_mut(&mut self) -> &mut NullTextSystem {
        &mut self.text
    }
}

impl Default for NullSystem {
    fn default() -> Self {
        Self::new(GameConfig::default())
    }
}

impl System for NullSystem {
    fn game_save_directory(&self) -> PathBuf {
        self.config.save_directory.clone()
    }

    fn config(&self) -> &GameConfig {
        &self.config
    }

    fn text(&self) -> &dyn TextSystem {
        &self.text
    }

    fn text_mut(&mut self) -> &mut dyn TextSystem {
        &mut self.text
    }

    fn graphics(&self) -> &dyn GraphicsSystem {
        &self.graphics
    }

    fn graphics_mut(&mut self) -> &mut dyn GraphicsSystem {
        &mut self.graphics
    }

    fn reset(&mut self) {
        TextSystem::reset(&mut self.text);
        GraphicsSystem::reset(&mut self.graphics);
    }

    fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            graphics_stack: self.graphics.graphics_stack().to_vec(),
            active_window: self.text.active_window(),
            key_cursor: self.text.key_cursor(),
        }
    }

    fn restore(&mut self, snapshot: SystemSnapshot) {
        self.graphics.set_graphics_stack(snapshot.graphics_stack);
        self.text.set_active_window(snapshot.active_window);
        self.text.set_key_cursor(snapshot.key_cursor);
    }
}
