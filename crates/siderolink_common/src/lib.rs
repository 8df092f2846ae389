#[macro_use]
extern crate tracing;

pub mod config;
pub mod model;
pub mod resource;
pub mod store;
pub mod token;

pub use resource::{Kind, Metadata, Phase, Resource};
pub use store::{LabelQuery, ObjectStore, StoreError, WatchEvent};
