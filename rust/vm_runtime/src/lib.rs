//! Scene VM runtime: bytecode decoding, dispatch, execution and save files.

pub mod bytecode;
pub mod config;
pub mod decoder;
pub mod expression;
pub mod long_operation;
pub mod machine;
pub mod memory;
pub mod modules;
pub mod scenario;
pub mod serialization;
pub mod system;
