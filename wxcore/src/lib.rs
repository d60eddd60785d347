pub mod login;
pub mod net;
pub mod puid;
pub mod session;
pub mod sync;
pub mod types;
