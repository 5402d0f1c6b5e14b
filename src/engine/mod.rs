//! Core engine: normalize → generate → dedup → publish, driven per match
//! by the orchestrator and supervised by the registry.

pub mod dedup;
pub mod generator;
pub mod lifecycle;
pub mod limiter;
pub mod normalizer;
pub mod orchestrator;
pub mod publisher;
pub mod registry;
