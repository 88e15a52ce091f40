//! Application-level orchestration utilities.
//!
//! This module owns job run lifecycle control (start/stop) and post-run processing
//! such as record extraction, raw log persistence and exports. CLI layers call into
//! this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, UiCommand};
pub(crate) use post_process::process_run_completion;
