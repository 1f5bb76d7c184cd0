#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod backend;
pub mod comments;
pub mod config;
pub mod likes;
pub mod media;
pub mod model;
pub mod realtime;
pub mod scroll;
pub mod session;
pub mod storage;
pub mod views;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
