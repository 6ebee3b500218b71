//! Command-line entry points.

pub mod enqueue;
pub mod push;
pub mod tasks;
pub mod worker;
