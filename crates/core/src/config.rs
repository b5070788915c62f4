//! Render configuration.
//!
//! A [`RenderConfig`] is built from defaults, optionally overlaid by a JSON
//! file (`--config <path>`), and finally by the command-line options in
//! [`RenderArgs`]. Only options that were given override the file.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Renderer settings that stay fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Initial window width in pixels.
    pub width: u32,
    /// Initial window height in pixels.
    pub height: u32,
    /// Samples per pixel (`N` in the frame uniform).
    pub samples: u32,
    /// Closest-hit program name. Also used in screenshot file names.
    pub method: String,
    /// Schedule a screenshot of the accumulated image.
    pub capture: bool,
    /// Exit as soon as the screenshot has been written.
    pub offline: bool,
    /// Number of frames blended into the captured image.
    pub frames: u32,
    /// Frames rendered before accumulation starts.
    pub tolerance: u32,
    /// Neighbour count of the spatial reuse pass (`M`).
    pub reservoir_merge: u32,
    /// Enable the Khronos validation layer.
    pub validation: bool,
    /// Directory holding the compiled SPIR-V modules.
    pub shader_dir: PathBuf,
    /// Optional JSON light list.
    pub lights: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            samples: 1,
            method: "restir".to_string(),
            capture: false,
            offline: false,
            frames: 1,
            tolerance: 0,
            reservoir_merge: 5,
            validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from("shaders/spirv"),
            lights: None,
        }
    }
}

impl RenderConfig {
    /// Load a configuration file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Build a configuration from command-line arguments (program name
    /// already stripped).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unknown or malformed options (and for
    /// `--help`, whose text is the message), and any error of
    /// [`RenderConfig::from_file`] or [`RenderConfig::validate`].
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = std::iter::once("restir".to_string()).chain(args.into_iter().map(Into::into));
        let args = RenderArgs::try_parse_from(argv).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_cli(&args)
    }

    /// Loads `--config` if given, overlays the other options and validates.
    pub fn from_cli(args: &RenderArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        args.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Reject values the renderer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "window size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.samples == 0 {
            return Err(Error::Config("samples must be at least 1".to_string()));
        }
        if self.frames == 0 {
            return Err(Error::Config("frames must be at least 1".to_string()));
        }
        if self.method.is_empty() {
            return Err(Error::Config("method name is empty".to_string()));
        }
        if self.offline && !self.capture {
            return Err(Error::Config(
                "offline mode requires --capture, nothing would end the run".to_string(),
            ));
        }
        Ok(())
    }

    /// The frame counter value at which the accumulated image is complete.
    #[inline]
    pub fn capture_frame(&self) -> u64 {
        u64::from(self.tolerance) + u64::from(self.frames)
    }
}

/// Command-line options. Every option is optional so that a config file
/// value survives unless the option is given.
#[derive(Debug, Clone, Default, PartialEq, Parser)]
#[command(name = "restir", version, about = "Real-time ReSTIR renderer")]
pub struct RenderArgs {
    /// JSON configuration applied before the other options
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Samples per pixel
    #[arg(short = 'n', long)]
    pub samples: Option<u32>,

    /// Closest-hit program, also used in screenshot names
    #[arg(short, long)]
    pub method: Option<String>,

    /// Save a screenshot of the accumulated image
    #[arg(short, long)]
    pub capture: bool,

    /// Exit once the screenshot is written
    #[arg(short, long)]
    pub offline: bool,

    /// Frames blended into the screenshot
    #[arg(short, long)]
    pub frames: Option<u32>,

    /// Frames rendered before accumulation starts
    #[arg(short, long)]
    pub tolerance: Option<u32>,

    /// Neighbours merged by spatial reuse
    #[arg(short = 'M', long = "merge")]
    pub reservoir_merge: Option<u32>,

    /// Initial window width
    #[arg(short = 'W', long)]
    pub width: Option<u32>,

    /// Initial window height
    #[arg(short = 'H', long)]
    pub height: Option<u32>,

    /// JSON light list
    #[arg(short, long, value_name = "PATH")]
    pub lights: Option<PathBuf>,

    /// Directory of compiled SPIR-V modules
    #[arg(long, value_name = "DIR")]
    pub shader_dir: Option<PathBuf>,

    /// Enable the Khronos validation layer
    #[arg(long, overrides_with = "no_validation")]
    pub validation: bool,

    /// Disable the Khronos validation layer
    #[arg(long, overrides_with = "validation")]
    pub no_validation: bool,
}

impl RenderArgs {
    /// Overlays the options that were given onto `config`.
    pub fn apply(&self, config: &mut RenderConfig) {
        if let Some(samples) = self.samples {
            config.samples = samples;
        }
        if let Some(method) = &self.method {
            config.method = method.clone();
        }
        config.capture |= self.capture;
        config.offline |= self.offline;
        if let Some(frames) = self.frames {
            config.frames = frames;
        }
        if let Some(tolerance) = self.tolerance {
            config.tolerance = tolerance;
        }
        if let Some(merge) = self.reservoir_merge {
            config.reservoir_merge = merge;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(lights) = &self.lights {
            config.lights = Some(lights.clone());
        }
        if let Some(dir) = &self.shader_dir {
            config.shader_dir = dir.clone();
        }
        if self.validation {
            config.validation = true;
        } else if self.no_validation {
            config.validation = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RenderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.samples, 1);
        assert_eq!(config.reservoir_merge, 5);
        assert!(!config.capture);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = RenderConfig::from_args([
            "-n", "4", "-m", "restir/spatial", "-c", "-f", "6", "-t", "2",
        ])
        .unwrap();

        assert_eq!(config.samples, 4);
        assert_eq!(config.method, "restir/spatial");
        assert!(config.capture);
        assert_eq!(config.frames, 6);
        assert_eq!(config.tolerance, 2);
        assert_eq!(config.capture_frame(), 8);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let err = RenderConfig::from_args(["--bogus"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_value_is_rejected() {
        assert!(RenderConfig::from_args(["-n"]).is_err());
        assert!(RenderConfig::from_args(["-f", "many"]).is_err());
    }

    #[test]
    fn test_zero_frames_rejected() {
        let err = RenderConfig::from_args(["-f", "0"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_help_and_size_flags_do_not_collide() {
        let err = RenderConfig::from_args(["-h"]).unwrap_err();
        match err {
            Error::Config(text) => assert!(text.contains("Usage")),
            other => panic!("unexpected error {other:?}"),
        }

        let config = RenderConfig::from_args(["-W", "640", "--height", "360"]).unwrap();
        assert_eq!((config.width, config.height), (640, 360));
    }

    #[test]
    fn test_validation_toggle_last_wins() {
        let config = RenderConfig::from_args(["--validation", "--no-validation"]).unwrap();
        assert!(!config.validation);
        let config = RenderConfig::from_args(["--no-validation", "--validation"]).unwrap();
        assert!(config.validation);
    }

    #[test]
    fn test_args_definition_is_consistent() {
        use clap::CommandFactory;
        RenderArgs::command().debug_assert();
    }

    #[test]
    fn test_offline_requires_capture() {
        assert!(RenderConfig::from_args(["-o"]).is_err());
        assert!(RenderConfig::from_args(["-o", "-c"]).is_ok());
    }

    #[test]
    fn test_config_file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "samples": 8, "frames": 3, "method": "pt" }}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = RenderConfig::from_args(["-f", "5", "--config", path.as_str()]).unwrap();
        assert_eq!(config.samples, 8);
        assert_eq!(config.method, "pt");
        // flag wins over the file
        assert_eq!(config.frames, 5);
        // untouched fields keep defaults
        assert_eq!(config.width, 1280);
    }

    #[test]
    fn test_absent_options_keep_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "capture": true, "reservoir_merge": 9, "width": 320 }}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = RenderConfig::from_args(["--config", path.as_str(), "-n", "2"]).unwrap();
        assert!(config.capture);
        assert_eq!(config.reservoir_merge, 9);
        assert_eq!(config.width, 320);
        assert_eq!(config.samples, 2);
    }
}
