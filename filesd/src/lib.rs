//! Registry of Prometheus scrape targets, published as a file-based service
//! discovery file.

mod error;
pub mod registry;
pub mod sd_file;
pub mod store;
mod target_group;

pub use {
    error::{Error, Result},
    registry::{Mutation, Outcome, Registry, RegistryHandle},
    sd_file::SdFile,
    store::{EntryStore, SledStore, StoreLocation},
    target_group::{dedup_targets, Signature, TargetGroup, ValidationError},
};
