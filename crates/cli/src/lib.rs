//! Command-line drivers for excoder: a streaming console generator and the HTTP server.

pub mod cli;
pub mod console;
