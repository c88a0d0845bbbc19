//! Configuration management
//!
//! This module handles loading, validation, and management of the Shield configuration.
//! Configuration is stored in TOML format at ~/.shield/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Output, work and audit locations, log level
//! - **llm**: Hosted language model endpoint
//! - **executor**: Retry and replan bounds, stage timeout
//! - **generator**: Generated tool storage, interpreter and import allow-list
//! - **video**: Detector cadence, thresholds, tracker and blur settings
//! - **audio**: Redaction mode, padding, fuzzy matching, live buffering
//! - **verification**: Release thresholds for video and audio
//!
//! Every section is optional in the file; missing keys take their defaults.
//!
//! # Examples
//!
//! ```no_run
//! use shield_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Output: {:?}", config.core.output_dir);
//! println!("Retries per step: {}", config.executor.max_retries);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use shield_sdk::errors::ShieldError;
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::RedactionMode;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,

    #[serde(default)]
    pub llm: LLMConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub verification: VerificationConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Where committed job outputs land (supports ~ expansion)
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Scratch space for staged step outputs (supports ~ expansion)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSONL audit trail location (supports ~ expansion)
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

/// Language model endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Base URL of an OpenAI-compatible chat completions API
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Executor recovery bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Local retries per step before escalating to a replan
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Replans per job before aborting
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,

    /// Timeout for one detection or transform phase
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
}

/// Tool generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Generated tool sources are stored here (supports ~ expansion)
    #[serde(default = "default_tools_dir")]
    pub tools_dir: PathBuf,

    /// Interpreter generated tools run under
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Top-level modules generated code may import
    #[serde(default = "default_allowed_imports")]
    pub allowed_imports: Vec<String>,

    /// Generation attempts per missing tool before planning fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout for one call into a generated tool
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
}

/// Video engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Run the primary detector every Nth frame
    #[serde(default = "default_detect_every")]
    pub detect_every: u32,

    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,

    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,

    /// Consecutive prediction-only frames before a track is dropped
    #[serde(default = "default_max_predicted_frames")]
    pub max_predicted_frames: u32,

    #[serde(default = "default_clahe_clip_limit")]
    pub clahe_clip_limit: f32,

    /// CLAHE grid size per axis
    #[serde(default = "default_clahe_tiles")]
    pub clahe_tiles: u32,

    /// Frames whose luma standard deviation falls below this are enhanced
    #[serde(default = "default_low_contrast_stddev")]
    pub low_contrast_stddev: f32,

    /// Face boxes are scaled by this factor about their center before blurring
    #[serde(default = "default_blur_scale")]
    pub blur_scale: f32,

    /// Blur kernel size, must be odd
    #[serde(default = "default_kernel")]
    pub kernel: u32,

    /// Tracker search margin around the previous box, in pixels
    #[serde(default = "default_tracker_search_radius")]
    pub tracker_search_radius: u32,

    /// Minimum normalized cross-correlation for a tracker hit
    #[serde(default = "default_tracker_min_correlation")]
    pub tracker_min_correlation: f32,

    /// Frames buffered between producer and consumer in live mode
    #[serde(default = "default_live_buffer_frames")]
    pub live_buffer_frames: usize,

    /// External face detector command; reads an image path, prints JSON boxes
    #[serde(default)]
    pub detector_command: Vec<String>,

    /// Per-frame limit for the detector command; the child is killed past it
    #[serde(default = "default_detector_timeout")]
    pub detector_timeout_secs: u64,
}

/// Audio engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub mode: RedactionMode,

    #[serde(default = "default_beep_hz")]
    pub beep_hz: f32,

    /// Applied segments are extended by this much, clamped to the clip
    #[serde(default = "default_pad_ms")]
    pub pad_ms: u64,

    /// Minimum normalized similarity for a multi-word fuzzy match
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,

    /// Playback delay of the live redactor
    #[serde(default = "default_live_delay_ms")]
    pub live_delay_ms: u64,

    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,

    /// External transcriber command; reads a WAV path, prints JSON words
    #[serde(default)]
    pub transcriber_command: Vec<String>,

    #[serde(default = "default_transcriber_timeout")]
    pub transcriber_timeout_secs: u64,
}

/// Release thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_ratio_threshold")]
    pub max_miss_ratio: f64,

    #[serde(default = "default_ratio_threshold")]
    pub max_short_gap_ratio: f64,

    /// Gaps shorter than this count toward the short-gap ratio
    #[serde(default = "default_short_gap_secs")]
    pub short_gap_secs: f64,

    #[serde(default = "default_max_laplacian_variance")]
    pub max_laplacian_variance: f64,

    #[serde(default = "default_max_segment_secs")]
    pub max_segment_secs: f64,

    #[serde(default = "default_max_overlap_ratio")]
    pub max_overlap_ratio: f64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("~/.shield/output")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("~/.shield/work")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("~/.shield/audit.jsonl")
}

fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_replans() -> u32 {
    2
}

fn default_stage_timeout() -> u64 {
    600
}

fn default_tools_dir() -> PathBuf {
    PathBuf::from("~/.shield/tools")
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_allowed_imports() -> Vec<String> {
    [
        "cv2",
        "numpy",
        "os",
        "time",
        "json",
        "pathlib",
        "torch",
        "torchaudio",
        "whisper",
        "pydub",
        "librosa",
        "soundfile",
        "typing",
        "abc",
        "registry",
        "tool_api",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_attempts() -> u32 {
    2
}

fn default_tool_timeout() -> u64 {
    300
}

fn default_detector_timeout() -> u64 {
    30
}

fn default_transcriber_timeout() -> u64 {
    300
}

fn default_detect_every() -> u32 {
    3
}

fn default_score_threshold() -> f32 {
    0.5
}

fn default_nms_threshold() -> f32 {
    0.3
}

fn default_max_predicted_frames() -> u32 {
    60
}

fn default_clahe_clip_limit() -> f32 {
    4.0
}

fn default_clahe_tiles() -> u32 {
    6
}

fn default_low_contrast_stddev() -> f32 {
    32.0
}

fn default_blur_scale() -> f32 {
    2.0
}

fn default_kernel() -> u32 {
    31
}

fn default_tracker_search_radius() -> u32 {
    24
}

fn default_tracker_min_correlation() -> f32 {
    0.6
}

fn default_live_buffer_frames() -> usize {
    8
}

fn default_beep_hz() -> f32 {
    1000.0
}

fn default_pad_ms() -> u64 {
    150
}

fn default_fuzzy_threshold() -> f64 {
    0.8
}

fn default_live_delay_ms() -> u64 {
    2000
}

fn default_chunk_ms() -> u64 {
    1000
}

fn default_ratio_threshold() -> f64 {
    0.10
}

fn default_short_gap_secs() -> f64 {
    0.5
}

fn default_max_laplacian_variance() -> f64 {
    50.0
}

fn default_max_segment_secs() -> f64 {
    15.0
}

fn default_max_overlap_ratio() -> f64 {
    0.5
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            work_dir: default_work_dir(),
            log_level: default_log_level(),
            audit_log: default_audit_log(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_llm_timeout(),
            temperature: default_temperature(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_replans: default_max_replans(),
            stage_timeout_secs: default_stage_timeout(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            tools_dir: default_tools_dir(),
            interpreter: default_interpreter(),
            allowed_imports: default_allowed_imports(),
            max_attempts: default_max_attempts(),
            tool_timeout_secs: default_tool_timeout(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            detect_every: default_detect_every(),
            score_threshold: default_score_threshold(),
            nms_threshold: default_nms_threshold(),
            max_predicted_frames: default_max_predicted_frames(),
            clahe_clip_limit: default_clahe_clip_limit(),
            clahe_tiles: default_clahe_tiles(),
            low_contrast_stddev: default_low_contrast_stddev(),
            blur_scale: default_blur_scale(),
            kernel: default_kernel(),
            tracker_search_radius: default_tracker_search_radius(),
            tracker_min_correlation: default_tracker_min_correlation(),
            live_buffer_frames: default_live_buffer_frames(),
            detector_command: Vec::new(),
            detector_timeout_secs: default_detector_timeout(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mode: RedactionMode::default(),
            beep_hz: default_beep_hz(),
            pad_ms: default_pad_ms(),
            fuzzy_threshold: default_fuzzy_threshold(),
            live_delay_ms: default_live_delay_ms(),
            chunk_ms: default_chunk_ms(),
            transcriber_command: Vec::new(),
            transcriber_timeout_secs: default_transcriber_timeout(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_miss_ratio: default_ratio_threshold(),
            max_short_gap_ratio: default_ratio_threshold(),
            short_gap_secs: default_short_gap_secs(),
            max_laplacian_variance: default_max_laplacian_variance(),
            max_segment_secs: default_max_segment_secs(),
            max_overlap_ratio: default_max_overlap_ratio(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.shield/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, TOML parsing fails, or
    /// validation fails.
    pub fn load_or_create() -> Result<Self, ShieldError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ShieldError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ShieldError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ShieldError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| ShieldError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Default configuration with every directory placed under `root`
    ///
    /// Used by tests and by callers that want a self-contained job area.
    pub fn rooted_at(root: &Path) -> Result<Self, ShieldError> {
        let mut config = Self::default();
        config.core.output_dir = root.join("output");
        config.core.work_dir = root.join("work");
        config.core.audit_log = root.join("audit.jsonl");
        config.generator.tools_dir = root.join("tools");
        config.validate_and_process()?;
        Ok(config)
    }

    fn create_default(path: &Path) -> Result<Self, ShieldError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ShieldError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Write the unexpanded form so the file stays portable
        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| ShieldError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| ShieldError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.shield/config.toml)
    pub fn default_config_path() -> Result<PathBuf, ShieldError> {
        let home = dirs::home_dir().ok_or_else(|| {
            ShieldError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(".shield").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// Validates values, expands ~ in paths and creates the output, work and
    /// tools directories.
    pub fn validate_and_process(&mut self) -> Result<(), ShieldError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(ShieldError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ShieldError::Config(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.generator.max_attempts == 0 {
            return Err(ShieldError::Config(
                "generator.max_attempts must be at least 1".to_string(),
            ));
        }

        let video = &self.video;
        if video.detect_every == 0 {
            return Err(ShieldError::Config(
                "video.detect_every must be at least 1".to_string(),
            ));
        }
        if video.kernel < 3 || video.kernel % 2 == 0 {
            return Err(ShieldError::Config(format!(
                "video.kernel must be an odd number >= 3, got {}",
                video.kernel
            )));
        }
        if video.max_predicted_frames == 0 || video.clahe_tiles == 0 {
            return Err(ShieldError::Config(
                "video.max_predicted_frames and video.clahe_tiles must be at least 1".to_string(),
            ));
        }
        if video.blur_scale < 1.0 {
            return Err(ShieldError::Config(
                "video.blur_scale must be at least 1.0".to_string(),
            ));
        }
        if video.detector_timeout_secs == 0 {
            return Err(ShieldError::Config(
                "video.detector_timeout_secs must be at least 1".to_string(),
            ));
        }
        if video.live_buffer_frames == 0 {
            return Err(ShieldError::Config(
                "video.live_buffer_frames must be at least 1".to_string(),
            ));
        }
        check_unit("video.score_threshold", video.score_threshold as f64)?;
        check_unit("video.nms_threshold", video.nms_threshold as f64)?;
        check_unit(
            "video.tracker_min_correlation",
            video.tracker_min_correlation as f64,
        )?;

        let audio = &self.audio;
        if audio.chunk_ms == 0 {
            return Err(ShieldError::Config(
                "audio.chunk_ms must be at least 1".to_string(),
            ));
        }
        if audio.live_delay_ms < audio.chunk_ms {
            return Err(ShieldError::Config(
                "audio.live_delay_ms must be at least one chunk".to_string(),
            ));
        }
        if audio.transcriber_timeout_secs == 0 {
            return Err(ShieldError::Config(
                "audio.transcriber_timeout_secs must be at least 1".to_string(),
            ));
        }
        if audio.beep_hz <= 0.0 {
            return Err(ShieldError::Config(
                "audio.beep_hz must be positive".to_string(),
            ));
        }
        check_unit("audio.fuzzy_threshold", audio.fuzzy_threshold)?;

        let v = &self.verification;
        check_unit("verification.max_miss_ratio", v.max_miss_ratio)?;
        check_unit("verification.max_short_gap_ratio", v.max_short_gap_ratio)?;
        check_unit("verification.max_overlap_ratio", v.max_overlap_ratio)?;
        if v.short_gap_secs <= 0.0 || v.max_segment_secs <= 0.0 || v.max_laplacian_variance <= 0.0
        {
            return Err(ShieldError::Config(
                "verification durations and variance limits must be positive".to_string(),
            ));
        }

        self.core.output_dir = expand_path(&self.core.output_dir)?;
        self.core.work_dir = expand_path(&self.core.work_dir)?;
        self.core.audit_log = expand_path(&self.core.audit_log)?;
        self.generator.tools_dir = expand_path(&self.generator.tools_dir)?;

        for dir in [
            &self.core.output_dir,
            &self.core.work_dir,
            &self.generator.tools_dir,
        ] {
            fs::create_dir_all(dir).map_err(|e| {
                ShieldError::Config(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }

        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), ShieldError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ShieldError::Config(format!(
            "{} must be between 0.0 and 1.0, got {}",
            name, value
        )))
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, ShieldError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| ShieldError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| {
            ShieldError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| ShieldError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
