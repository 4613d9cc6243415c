pub mod settings;

// Re-export commonly used types
pub use settings::{
    AvatarSettings, BakeSettings, DeformationSettings, LoggingSettings,
    load_settings, load_settings_from, save_settings, save_settings_to,
    DEFAULT_FALLBACK_TEXTURE,
};
