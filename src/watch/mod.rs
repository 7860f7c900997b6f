//! Log watching
//!
//! Scans process output, live or from a growing log file, for a marker
//! line and extracts the value it carries, always under a hard deadline.

mod pattern;
mod source;
mod watcher;

pub use pattern::MarkerPattern;
pub use source::{FileFollower, LineSource};
pub use watcher::{extract_block, tail_lines, wait_for_marker, wait_for_path, LogWatchResult};
