pub use wxcore;

pub mod bot;
pub mod client;
pub mod config;
pub mod handlers;
pub mod login;
pub mod puid;
pub mod qrcode;
pub mod request;
pub mod store;
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bot::Bot;
pub use client::Client;
pub use config::ClientConfig;
