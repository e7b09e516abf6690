//! TOML configuration file loading
//!
//! Supports `~/.config/prep-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;
use crate::instructions::MenuMix;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Remote agent session settings
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Audio contract overrides
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Kitchen numbers fed into the instructions
    #[serde(default)]
    pub prep: PrepFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Remote agent session settings
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// WebSocket endpoint of the Live API
    pub endpoint: Option<String>,

    /// Model identifier (e.g. "models/gemini-2.5-flash-native-audio-preview-12-2025")
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Kore")
    pub voice: Option<String>,

    /// Full instruction text, replacing the generated one
    pub instructions: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
    pub frame_samples: Option<usize>,
}

/// Prep planner inputs
#[derive(Debug, Default, Deserialize)]
pub struct PrepFileConfig {
    /// Projected meals for the next service
    pub target_volume: Option<u32>,

    /// Product mix, one entry per menu item
    #[serde(default)]
    pub menu: Vec<MenuMix>,

    /// Extra text appended to the instructions
    pub extra: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub gemini: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ConfigFile {
    match config_file_path() {
        Some(path) => load_config_from(&path),
        None => ConfigFile::default(),
    }
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_config_from(path: &Path) -> ConfigFile {
    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Parse config file text
///
/// # Errors
///
/// Returns `Toml` if the text is not valid TOML for this schema
pub fn parse_config(content: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/prep-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("prep-voice").join("config.toml"))
}
