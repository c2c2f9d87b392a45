//! Domain model: operation tags and lifecycle states.

pub mod state;
pub mod tag;

pub use self::state::OpState;
pub use self::tag::{Tag, TagAllocator};
