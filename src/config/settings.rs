use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::avatar::morph_data::{MAX_MORPH_VERTEX_INDEX, SIGNIFICANT_DELTA};
use crate::avatar::Sex;

const CONFIG_FILE: &str = "avatar.toml";

/// Default avatar texture shown until the first bake of a region succeeds
pub const DEFAULT_FALLBACK_TEXTURE: Uuid = Uuid::from_u128(0xc228d1cf_4b5d_4ba8_84f4_899a0796aa97);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeformationSettings {
    /// Upper bound on vertex indices accepted while loading morph blocks
    pub max_morph_vertex_index: u32,
    /// Per-channel magnitude below which an authored delta is dropped
    pub significant_delta: f32,
    pub default_sex: Sex,
}

impl Default for DeformationSettings {
    fn default() -> Self {
        Self {
            max_morph_vertex_index: MAX_MORPH_VERTEX_INDEX,
            significant_delta: SIGNIFICANT_DELTA,
            default_sex: Sex::Female,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeSettings {
    pub resolution: u32,
    pub fallback_texture: Uuid,
}

impl Default for BakeSettings {
    fn default() -> Self {
        Self {
            resolution: 512,
            fallback_texture: DEFAULT_FALLBACK_TEXTURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarSettings {
    pub deformation: DeformationSettings,
    pub baking: BakeSettings,
    pub logging: LoggingSettings,
}

fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "slv", "slv-avatar").map(|proj| proj.config_dir().join(CONFIG_FILE))
}

pub fn save_settings_to(path: &Path, settings: &AvatarSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let toml = toml::to_string_pretty(settings)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(path, toml)
}

/// Read settings from `path`, falling back to defaults when the file is absent
/// or unreadable.
pub fn load_settings_from(path: &Path) -> AvatarSettings {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) => {
            debug!("No settings at {}: {}", path.display(), e);
            return AvatarSettings::default();
        }
    };
    match toml::from_str::<AvatarSettings>(&data) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Ignoring unparsable settings file {}: {}", path.display(), e);
            AvatarSettings::default()
        }
    }
}

pub fn save_settings(settings: &AvatarSettings) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_settings_to(&path, settings),
        None => Ok(()),
    }
}

pub fn load_settings() -> AvatarSettings {
    config_path()
        .map(|path| load_settings_from(&path))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AvatarSettings::default();
        assert_eq!(settings.deformation.max_morph_vertex_index, 10_000);
        assert_eq!(settings.deformation.significant_delta, 0.0001);
        assert_eq!(settings.baking.resolution, 512);
        assert_eq!(settings.baking.fallback_texture, DEFAULT_FALLBACK_TEXTURE);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: AvatarSettings = toml::from_str("[baking]\nresolution = 1024\n").unwrap();
        assert_eq!(settings.baking.resolution, 1024);
        assert_eq!(settings.baking.fallback_texture, DEFAULT_FALLBACK_TEXTURE);
        assert_eq!(settings.deformation, DeformationSettings::default());
    }

    #[test]
    fn test_settings_persistence() {
        let path = std::env::temp_dir()
            .join(format!("slv-avatar-{}", Uuid::new_v4()))
            .join(CONFIG_FILE);
        let mut settings = AvatarSettings::default();
        settings.deformation.default_sex = Sex::Male;
        settings.baking.resolution = 256;

        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path), settings);

        fs::write(&path, "not [valid toml").unwrap();
        assert_eq!(load_settings_from(&path), AvatarSettings::default());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
