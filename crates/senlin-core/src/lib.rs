pub mod config;
pub mod error;
pub mod events;
pub mod store;
pub mod types;

pub use config::SenlinConfig;
pub use error::{Result, SenlinError};
pub use events::ActionEvent;
pub use store::{ActionFilter, ActionStore, Release, StoreError};
pub use types::*;
