// src/processing/mod.rs
pub mod chunk_buffer;
pub mod routing;

pub use chunk_buffer::ChunkBuffer;
pub use routing::RoutingTarget;
