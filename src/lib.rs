pub mod channel;
pub mod chat;
pub mod common;
pub mod config;
pub mod error;
pub mod storage;
pub mod tabs;
pub mod ui;

pub use error::{Error, Result};
