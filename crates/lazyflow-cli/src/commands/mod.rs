//! CLI command implementations.

pub mod bench;
pub mod blocks;
pub mod common;
pub mod config;
pub mod labels;
