//! Application-level orchestration.
//!
//! This module owns the migration task lifecycle (start, poll, teardown), the
//! one-shot conversion flow and the command loop that UI layers drive. UI/CLI
//! layers call into this module to keep responsibilities separated.

mod controller;
mod conversion;
mod task;

pub(crate) use controller::{run_controller, ConsoleContext, UiCommand};
pub(crate) use conversion::ConversionHelper;
pub(crate) use task::{PollSettings, TaskController};
