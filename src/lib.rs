pub mod api;
pub mod args;
pub mod base;
pub mod commands;
mod config;
pub mod consolidate;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod knowledge;
pub mod pipeline;
pub mod raw;
pub mod table;
mod utils;
pub mod warehouse;


pub use api::Mode;
pub use config::{Config, Credentials};
pub use error::Error;
pub use error::Result;
