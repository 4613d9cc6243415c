//! Live avatar instances and the event plumbing that feeds them

pub mod avatar;
pub mod events;
pub mod registry;

pub use avatar::{Avatar, AvatarFrame, UpdateStats};
pub use events::*;
pub use registry::AvatarRegistry;
