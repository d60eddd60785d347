pub mod contact;
pub mod events;
pub mod message;
pub mod system;

pub use contact::{ChatFlags, ChatKind, ContactSnapshot, RawContact};
pub use message::{ChatRef, MessageKind, NormalizedMessage, RawMessage};
pub use system::SystemAccounts;
