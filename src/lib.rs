pub mod command;
pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};
