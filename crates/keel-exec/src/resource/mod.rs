//! Resource fetch identity and the fetcher.

pub mod fetcher;
pub mod instance;

pub use fetcher::{FetchRequest, FetchSession, Fetcher, ResourceFetcher};
pub use instance::{lock_name, ResourceInstance};
