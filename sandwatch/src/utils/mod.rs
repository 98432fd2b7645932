//! Utility modules for Sandwatch.
//!
//! # Modules
//!
//! - [`debounce`]: Quiet-period coalescing of watch events into change hints
//! - [`text`]: Duration formatting and line-window helpers

pub mod debounce;
pub mod text;

pub use debounce::{HintDebouncer, HintEvent};
pub use text::{format_duration, head_lines, tail_lines};
