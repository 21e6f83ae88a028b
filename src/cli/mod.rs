//! Command-line driver: the batch command protocol parser and the script
//! runner that feeds it to a tree. The binary in `src/bin/perchdb.rs`
//! wires this to stdin/stdout; keeping the loop here keeps it testable
//! against in-memory buffers.

mod commands;

pub use commands::{execute, run_script, Command};
