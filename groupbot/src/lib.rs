mod error;

pub mod chat;
pub mod config;
pub mod database;
pub mod message;
pub mod schedule;
pub mod server;
pub mod service;
pub mod utils;

pub use error::{Error, Result};

// Use of a mod or pub mod is not actually necessary.
pub mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// User agent sent with every HTTP request.
pub fn user_agent() -> String {
    format!(
        "groupbot/{} {}",
        built_info::PKG_VERSION,
        built_info::TARGET
    )
}
