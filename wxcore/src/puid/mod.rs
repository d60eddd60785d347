//! Durable chat identifiers.
//!
//! The service reissues routing names every session. This module maps the
//! attributes of an observed chat (routing name, wxid, remark name and a
//! descriptive caption) to one stable opaque id per chat.

pub mod bimap;
pub mod caption;
pub mod map;

pub use bimap::BiMap;
pub use caption::Caption;
pub use map::{ChatObservation, MatchSource, PuidMap, PuidTables, Resolution};
