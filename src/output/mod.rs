//! Filesystem output shared by the state store and the approval gate.

pub mod files;

pub use files::{read_if_exists, write_atomic};
