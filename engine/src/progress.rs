//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the
//! pipeline from whatever front end displays it.
//!
//! The CLI implements it to print stage banners and entry names in verbose
//! mode.

use std::path::Path;

use crate::model::Action;

/// Trait for receiving progress updates from a running task.
///
/// All methods are called synchronously, in pipeline order, and only when the
/// task was configured with `verbose`.
pub trait ProgressCallback: Send {
    /// Called before a stage starts working on its input.
    fn on_stage_started(&self, action: Action);

    /// Called for each entry packed or unpacked, with its path relative to
    /// the source root.
    fn on_entry(&self, action: Action, path: &Path);

    /// Called once the stage has produced `output`.
    fn on_stage_completed(&self, action: Action, output: &Path);
}
