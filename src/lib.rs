pub mod backend;
pub mod cache;
pub mod cloud;
pub mod config;
pub mod error;
pub mod facade;
pub mod http;
pub mod locator;

pub use backend::{Entry, EntryPager, EntryPages, ListFilter, Registry, Sink, Source};
pub use config::StagConfig;
pub use error::{Result, StagError};
pub use facade::Stag;
pub use locator::{resolve, Locator};
