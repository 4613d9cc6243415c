// slv-avatar: avatar deformation and appearance baking for the SLV viewer

pub mod error;
pub mod utils;
pub mod config;
pub mod assets;
pub mod avatar;
pub mod world;

// Re-export commonly used types for convenience
pub use config::{load_settings, AvatarSettings};
pub use error::{AvatarError, AvatarResult, ErrorCategory};
pub use world::{Avatar, AvatarEvent, AvatarFrame, AvatarRegistry};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
