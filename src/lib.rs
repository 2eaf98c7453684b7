pub mod catalog;
pub mod client;
pub mod config;

pub use catalog::{CatalogError, DirectoryService, TagRecord, TagSlot};
pub use client::{CatalogClient, SubsonicClient};
pub use config::ServerConfig;
