//! Kernel primitives for the excoder transformer forward pass.
//!
//! Every kernel writes into a caller-provided buffer so the evaluator can run a whole
//! forward pass out of one reusable scratch arena.

pub mod activation;
pub mod attention;
pub mod layernorm;
pub mod linear;
pub mod utils;

pub use activation::*;
pub use attention::*;
pub use layernorm::*;
pub use linear::*;
pub use utils::*;
