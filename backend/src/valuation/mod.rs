//! Valuation module - pure stages plus the pipeline that sequences them

pub mod advise;
pub mod engine;
pub mod error;
pub mod market;
pub mod normalize;
pub mod pipeline;
pub mod types;
pub mod utils;
pub mod validate;

pub use types::*;
