#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod combined;
pub mod config;
pub mod cox;
pub mod design;
pub mod engine;
pub mod executor;
pub mod pipeline;
pub mod progress;
pub mod reconstruct;
pub mod report;
pub mod types;

#[path = "../store/mod.rs"]
pub mod store;

#[path = "../clinical/data.rs"]
pub mod clinical;

#[path = "../shared/volume.rs"]
pub mod volume;
