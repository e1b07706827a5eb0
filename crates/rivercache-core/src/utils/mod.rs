//! Display helpers shared by front ends.

pub mod format;

pub use format::{format_age, format_duration, format_flow, format_level, truncate_string};
