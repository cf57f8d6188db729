//! Engine configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Options recognized by the parallel render engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderEngineConfig {
    /// Number of swapchain back buffers
    pub back_buffer_count: u32,
    /// Taskflow slots pipelined in flight; `None` follows `back_buffer_count`
    pub in_flight_frames: Option<u32>,
    /// Validation layers passed through to device creation
    pub validation_layers: Vec<String>,
}

impl Default for RenderEngineConfig {
    fn default() -> Self {
        Self {
            back_buffer_count: 3,
            in_flight_frames: None,
            validation_layers: Vec::new(),
        }
    }
}

impl RenderEngineConfig {
    /// Load and validate a configuration from a `.toml` or `.ron` file
    pub fn load_from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|error| EngineError::Config {
            reason: format!("cannot read '{}': {error}", path.display()),
        })?;
        let config: Self = match path.extension().and_then(std::ffi::OsStr::to_str) {
            Some("toml") => toml::from_str(&contents).map_err(|error| EngineError::Config {
                reason: format!("'{}': {error}", path.display()),
            })?,
            Some("ron") => ron::from_str(&contents).map_err(|error| EngineError::Config {
                reason: format!("'{}': {error}", path.display()),
            })?,
            _ => {
                return Err(EngineError::Config {
                    reason: format!("unsupported config format: '{}'", path.display()),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration next to the format implied by the extension
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let contents = match path.extension().and_then(std::ffi::OsStr::to_str) {
            Some("toml") => toml::to_string_pretty(self).map_err(|error| EngineError::Config {
                reason: error.to_string(),
            })?,
            Some("ron") => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|error| EngineError::Config {
                    reason: error.to_string(),
                })?,
            _ => {
                return Err(EngineError::Config {
                    reason: format!("unsupported config format: '{}'", path.display()),
                })
            }
        };
        std::fs::write(path, contents).map_err(|error| EngineError::Config {
            reason: format!("cannot write '{}': {error}", path.display()),
        })
    }

    /// Check the option values against what the engine can actually run.
    ///
    /// Zero counts cannot drive a frame loop, and more in-flight slots than
    /// back buffers would hand the same swapchain image to two slots.
    pub fn validate(&self) -> EngineResult<()> {
        if self.back_buffer_count == 0 {
            return Err(EngineError::Config {
                reason: "back_buffer_count must be at least 1".to_string(),
            });
        }
        if let Some(in_flight_frames) = self.in_flight_frames {
            if in_flight_frames == 0 {
                return Err(EngineError::Config {
                    reason: "in_flight_frames must be at least 1".to_string(),
                });
            }
            if in_flight_frames > self.back_buffer_count {
                return Err(EngineError::Config {
                    reason: format!(
                        "in_flight_frames ({in_flight_frames}) cannot exceed back_buffer_count ({})",
                        self.back_buffer_count
                    ),
                });
            }
        }
        if self.validation_layers.iter().any(String::is_empty) {
            return Err(EngineError::Config {
                reason: "validation layer names must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Number of execution slots the engine pipelines
    pub fn effective_in_flight_frames(&self) -> u32 {
        self.in_flight_frames.unwrap_or(self.back_buffer_count).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_frames_follow_the_back_buffer_count() {
        let config = RenderEngineConfig {
            back_buffer_count: 2,
            ..RenderEngineConfig::default()
        };
        assert_eq!(config.effective_in_flight_frames(), 2);

        let pinned = RenderEngineConfig {
            back_buffer_count: 3,
            in_flight_frames: Some(2),
            ..RenderEngineConfig::default()
        };
        assert_eq!(pinned.effective_in_flight_frames(), 2);
    }

    #[test]
    fn invalid_option_values_are_rejected() {
        let no_buffers = RenderEngineConfig {
            back_buffer_count: 0,
            ..RenderEngineConfig::default()
        };
        assert!(matches!(
            no_buffers.validate(),
            Err(EngineError::Config { .. })
        ));

        let too_deep = RenderEngineConfig {
            back_buffer_count: 2,
            in_flight_frames: Some(3),
            ..RenderEngineConfig::default()
        };
        assert!(matches!(too_deep.validate(), Err(EngineError::Config { .. })));

        let unnamed_layer = RenderEngineConfig {
            validation_layers: vec![String::new()],
            ..RenderEngineConfig::default()
        };
        assert!(matches!(
            unnamed_layer.validate(),
            Err(EngineError::Config { .. })
        ));

        assert!(RenderEngineConfig::default().validate().is_ok());
    }

    #[test]
    fn file_round_trip_preserves_the_options() {
        let config = RenderEngineConfig {
            back_buffer_count: 3,
            in_flight_frames: Some(2),
            validation_layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
        };
        let path = std::env::temp_dir().join(format!(
            "graph_engine_config_{}.toml",
            std::process::id()
        ));
        config.save_to_file(&path).unwrap();
        let loaded = RenderEngineConfig::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded.back_buffer_count, 3);
        assert_eq!(loaded.in_flight_frames, Some(2));
        assert_eq!(loaded.validation_layers, config.validation_layers);
    }

    #[test]
    fn unknown_extensions_are_refused() {
        let config = RenderEngineConfig::default();
        assert!(matches!(
            config.save_to_file("engine-options.yaml"),
            Err(EngineError::Config { .. })
        ));
    }
}
