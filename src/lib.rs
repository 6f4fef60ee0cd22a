pub mod backend;
pub mod cli;
pub mod config;
pub mod delegate;
pub mod expire;
pub mod favicons;
pub mod redirects;
pub mod store;
pub mod tasks;
pub mod tracker;
pub mod transition;
pub mod types;

pub use backend::{AddPageArgs, HistoryBackend, Opener};
pub use config::Config;
pub use delegate::{Delegate, NoopDelegate};
pub use store::HistoryStore;
