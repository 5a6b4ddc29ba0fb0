//! Core crate for the tessera tiled super-resolution engine.

pub mod blend;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model_cache;
pub mod params;
pub mod pipeline;
pub mod session;
pub mod tensor;
