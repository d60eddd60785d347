pub mod router;
pub mod traits;

pub use router::MessageRouter;
pub use traits::MessageHandler;
