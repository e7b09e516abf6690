//! Configuration management for prep-voice

pub mod file;

use secrecy::SecretString;

use crate::instructions::{PrepContext, build_instructions};
use crate::transport::SessionSetup;
use crate::voice::{CaptureConfig, FRAME_SAMPLES, PLAYBACK_SAMPLE_RATE, SAMPLE_RATE};
use crate::{Error, Result};

/// Live API WebSocket endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used for prep conversations
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

/// Resolved configuration
#[derive(Debug)]
pub struct Config {
    /// Live API key, required only for `talk`
    pub api_key: Option<SecretString>,

    /// WebSocket endpoint
    pub endpoint: String,

    /// Remote model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: Option<String>,

    /// Instruction text replacing the generated one
    pub instructions_override: Option<String>,

    /// Kitchen numbers for the generated instructions
    pub prep: PrepContext,

    /// Outbound (microphone) rate
    pub input_sample_rate: u32,

    /// Inbound (agent speech) rate
    pub output_sample_rate: u32,

    /// Samples per outbound frame
    pub frame_samples: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: None,
            instructions_override: None,
            prep: PrepContext::default(),
            input_sample_rate: SAMPLE_RATE,
            output_sample_rate: PLAYBACK_SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if an environment override cannot be parsed
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Layer environment values over a parsed config file
    ///
    /// Empty environment values count as unset.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a value is out of range or cannot be parsed
    pub fn resolve<F>(fc: file::ConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let api_key = lookup("GEMINI_API_KEY")
            .or_else(|| lookup("API_KEY"))
            .or(fc.api_keys.gemini)
            .map(SecretString::from);

        let target_volume = match lookup("PREP_VOICE_TARGET_VOLUME") {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|e| {
                Error::Config(format!("PREP_VOICE_TARGET_VOLUME must be a whole number: {e}"))
            })?),
            None => fc.prep.target_volume,
        };

        let prep = PrepContext {
            target_volume: target_volume.unwrap_or_default(),
            menu: fc.prep.menu,
            extra: fc.prep.extra,
        };

        if let Some(bad) = prep
            .menu
            .iter()
            .find(|m| !(0.0..=1.0).contains(&m.product_mix))
        {
            return Err(Error::Config(format!(
                "product mix for {} must be between 0 and 1, got {}",
                bad.name, bad.product_mix
            )));
        }

        let config = Self {
            api_key,
            endpoint: lookup("PREP_VOICE_ENDPOINT")
                .or(fc.session.endpoint)
                .unwrap_or(defaults.endpoint),
            model: lookup("PREP_VOICE_MODEL")
                .or(fc.session.model)
                .unwrap_or(defaults.model),
            voice: lookup("PREP_VOICE_VOICE").or(fc.session.voice),
            instructions_override: lookup("PREP_VOICE_INSTRUCTIONS").or(fc.session.instructions),
            prep,
            input_sample_rate: fc.audio.input_sample_rate.unwrap_or(defaults.input_sample_rate),
            output_sample_rate: fc
                .audio
                .output_sample_rate
                .unwrap_or(defaults.output_sample_rate),
            frame_samples: fc.audio.frame_samples.unwrap_or(defaults.frame_samples),
        };

        if config.input_sample_rate == 0 || config.output_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if config.frame_samples == 0 {
            return Err(Error::Config("frame_samples must be non-zero".to_string()));
        }

        Ok(config)
    }

    /// Move the API key out, or fail naming where to set it
    ///
    /// # Errors
    ///
    /// Returns `Config` if no key was configured
    pub fn take_api_key(&mut self) -> Result<SecretString> {
        self.api_key.take().ok_or_else(|| {
            Error::Config(
                "no API key: set GEMINI_API_KEY or api_keys.gemini in the config file".to_string(),
            )
        })
    }

    /// Instruction text for the session setup
    #[must_use]
    pub fn instructions(&self) -> String {
        self.instructions_override
            .clone()
            .unwrap_or_else(|| build_instructions(&self.prep))
    }

    #[must_use]
    pub fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            instructions: self.instructions(),
            voice: self.voice.clone(),
            input_sample_rate: self.input_sample_rate,
            output_sample_rate: self.output_sample_rate,
        }
    }

    #[must_use]
    pub const fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.input_sample_rate,
            frame_samples: self.frame_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn parse_file(toml_text: &str) -> file::ConfigFile {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(file::ConfigFile::default(), env_from(&[])).unwrap();

        assert!(config.api_key.is_none());
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.output_sample_rate, 24000);
        assert_eq!(config.frame_samples, 4096);
    }

    #[test]
    fn test_env_overrides_file() {
        let fc = parse_file(
            r#"
            [session]
            model = "models/from-file"
            voice = "Puck"

            [api_keys]
            gemini = "file-key"
            "#,
        );
        let config = Config::resolve(
            fc,
            env_from(&[("PREP_VOICE_MODEL", "models/from-env"), ("GEMINI_API_KEY", "env-key")]),
        )
        .unwrap();

        assert_eq!(config.model, "models/from-env");
        assert_eq!(config.voice.as_deref(), Some("Puck"));
        assert_eq!(config.api_key.unwrap().expose_secret(), "env-key");
    }

    #[test]
    fn test_api_key_fallbacks() {
        let mut config =
            Config::resolve(file::ConfigFile::default(), env_from(&[("API_KEY", "generic")]))
                .unwrap();
        assert_eq!(config.take_api_key().unwrap().expose_secret(), "generic");
        assert!(config.take_api_key().is_err());

        let mut config = Config::resolve(
            file::ConfigFile::default(),
            env_from(&[("GEMINI_API_KEY", "  ")]),
        )
        .unwrap();
        assert!(matches!(config.take_api_key(), Err(Error::Config(_))));
    }

    #[test]
    fn test_target_volume_layers() {
        let fc = parse_file("[prep]\ntarget_volume = 120");
        let config = Config::resolve(fc, env_from(&[])).unwrap();
        assert_eq!(config.prep.target_volume, 120);

        let fc = parse_file("[prep]\ntarget_volume = 120");
        let config =
            Config::resolve(fc, env_from(&[("PREP_VOICE_TARGET_VOLUME", "300")])).unwrap();
        assert_eq!(config.prep.target_volume, 300);

        let result = Config::resolve(
            file::ConfigFile::default(),
            env_from(&[("PREP_VOICE_TARGET_VOLUME", "lots")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_out_of_range_mix() {
        let fc = parse_file(
            r#"
            [[prep.menu]]
            name = "Soup"
            product_mix = 1.5
            "#,
        );
        assert!(matches!(
            Config::resolve(fc, env_from(&[])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_instructions_override() {
        let fc = parse_file("[prep]\ntarget_volume = 90");
        let config = Config::resolve(fc, env_from(&[])).unwrap();
        assert!(config.instructions().contains("90 meals"));

        let config = Config::resolve(
            file::ConfigFile::default(),
            env_from(&[("PREP_VOICE_INSTRUCTIONS", "Be brief.")]),
        )
        .unwrap();
        assert_eq!(config.session_setup().instructions, "Be brief.");
    }

    #[test]
    fn test_rejects_zero_rates() {
        let fc = parse_file("[audio]\ninput_sample_rate = 0");
        assert!(Config::resolve(fc, env_from(&[])).is_err());
    }
}
