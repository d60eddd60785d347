pub mod codec;
pub mod debounce;
pub mod error;
pub mod session_store;

pub use codec::{Loaded, Miss};
pub use debounce::Debouncer;
pub use error::StoreError;
pub use session_store::{SessionSnapshot, SessionStore};
