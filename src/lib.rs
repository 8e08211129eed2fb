#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

pub mod correlator;
pub mod cpu;
pub mod engine;
pub mod hook;
pub mod proc;
pub mod range;
pub mod record;
pub mod regs_bridge;
pub mod result;
pub mod session;
pub mod stack;
