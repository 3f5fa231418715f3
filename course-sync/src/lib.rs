pub mod azure_repos;
pub mod blob_storage;
pub mod cli;
pub mod load_config;
pub mod sqlite_store;

pub use cli::{run, Cli, Commands};
