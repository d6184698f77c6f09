//! Configuration for media capture sessions
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::media::ContainerFormat;
use crate::{Error, Result};

/// Main configuration for the capture core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Recorder configuration
    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Transcoding configuration
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// Relay (TURN) configuration
    #[serde(default)]
    pub turn: TurnConfig,

    /// Object storage and metadata configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Session timing knobs
    #[serde(default)]
    pub session: SessionConfig,
}

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Preferred container format
    #[serde(default = "default_format")]
    pub format: ContainerFormat,

    /// Container format used when the preferred one fails to start
    #[serde(default = "default_fallback_format")]
    pub fallback_format: ContainerFormat,

    /// Root directory for per-session temporary directories
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// How long finalize waits for a pending recorder start
    #[serde(default = "default_start_wait_secs")]
    pub start_wait_secs: u64,

    /// How long a freshly spawned writer must stay alive to count as started
    #[serde(default = "default_start_grace_ms")]
    pub start_grace_ms: u64,

    /// Delay between the first track and the start request so that
    /// companion tracks of the same offer are attached first
    #[serde(default = "default_track_settle_ms")]
    pub track_settle_ms: u64,
}

fn default_format() -> ContainerFormat {
    ContainerFormat::Mp4
}

fn default_fallback_format() -> ContainerFormat {
    ContainerFormat::Matroska
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_start_wait_secs() -> u64 {
    5
}

fn default_start_grace_ms() -> u64 {
    400
}

fn default_track_settle_ms() -> u64 {
    250
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            fallback_format: default_fallback_format(),
            tmp_dir: default_tmp_dir(),
            start_wait_secs: default_start_wait_secs(),
            start_grace_ms: default_start_grace_ms(),
            track_settle_ms: default_track_settle_ms(),
        }
    }
}

impl RecorderConfig {
    pub fn start_wait(&self) -> Duration {
        Duration::from_secs(self.start_wait_secs)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn track_settle(&self) -> Duration {
        Duration::from_millis(self.track_settle_ms)
    }
}

/// Transcoding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Constant output frame rate
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// x264 preset
    #[serde(default = "default_preset")]
    pub preset: String,

    /// x264 constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u32,

    /// Maximum concurrently running transcoder processes
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_fps() -> u32 {
    30
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_crf() -> u32 {
    23
}

fn default_max_concurrent() -> usize {
    2
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            fps: default_fps(),
            preset: default_preset(),
            crf: default_crf(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Relay (TURN) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Shared secret for minting relay credentials
    #[serde(default)]
    pub secret: Option<String>,

    /// Explicit relay host; derived from the frontend domain when unset
    #[serde(default)]
    pub host: Option<String>,

    /// Public frontend domain, with or without scheme
    #[serde(default = "default_frontend_domain")]
    pub frontend_domain: String,

    /// Advertise TLS relay (turns:) in addition to UDP
    #[serde(default)]
    pub enable_turns: bool,

    /// Credential time-to-live in seconds
    #[serde(default = "default_turn_ttl")]
    pub ttl_secs: u64,
}

fn default_frontend_domain() -> String {
    "anqa.cloud".to_string()
}

fn default_turn_ttl() -> u64 {
    3600
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            secret: None,
            host: None,
            frontend_domain: default_frontend_domain(),
            enable_turns: false,
            ttl_secs: default_turn_ttl(),
        }
    }
}

/// Object storage and metadata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the storage/metadata REST service
    #[serde(default)]
    pub url: String,

    /// Service key used for both storage and metadata calls
    #[serde(default)]
    pub service_key: String,

    /// Bucket holding recordings
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Table holding one row per session
    #[serde(default = "default_metadata_table")]
    pub metadata_table: String,

    /// Request timeout in seconds
    #[serde(default = "default_storage_timeout")]
    pub timeout_secs: u64,
}

fn default_bucket() -> String {
    "recordings".to_string()
}

fn default_metadata_table() -> String {
    "screenings".to_string()
}

fn default_storage_timeout() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_key: String::new(),
            bucket: default_bucket(),
            metadata_table: default_metadata_table(),
            timeout_secs: default_storage_timeout(),
        }
    }
}

/// Session timing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on waiting for ICE gathering before answering
    #[serde(default = "default_ice_gather_timeout")]
    pub ice_gather_timeout_ms: u64,

    /// Analysis reporting window
    #[serde(default = "default_analysis_window")]
    pub analysis_window_secs: u64,

    /// Number of recording flush probes during finalize
    #[serde(default = "default_flush_checks")]
    pub flush_checks: u32,

    /// Delay between flush probes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

fn default_ice_gather_timeout() -> u64 {
    2000
}

fn default_analysis_window() -> u64 {
    5
}

fn default_flush_checks() -> u32 {
    20
}

fn default_flush_interval() -> u64 {
    200
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_gather_timeout_ms: default_ice_gather_timeout(),
            analysis_window_secs: default_analysis_window(),
            flush_checks: default_flush_checks(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

impl SessionConfig {
    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }

    pub fn analysis_window(&self) -> Duration {
        Duration::from_secs(self.analysis_window_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl CaptureConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = CaptureConfig::default();
        config.apply_env();
        config
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) {
        // Recorder
        if let Some(v) = env_non_empty("WEBRTC_RECORDER_FORMAT") {
            self.recorder.format = ContainerFormat::normalize(&v);
        }
        if let Some(v) = env_non_empty("WEBRTC_RECORDER_FALLBACK") {
            self.recorder.fallback_format = ContainerFormat::normalize(&v);
        }
        if let Some(v) = env_non_empty("CAPTURE_TMP_DIR") {
            self.recorder.tmp_dir = PathBuf::from(v);
        }

        // Transcode
        if let Some(v) = env_non_empty("FFMPEG_PATH") {
            self.transcode.ffmpeg_path = v;
        }
        if let Some(v) = env_parse("FFMPEG_FPS") {
            self.transcode.fps = v;
        }
        if let Some(v) = env_non_empty("FFMPEG_PRESET") {
            self.transcode.preset = v;
        }
        if let Some(v) = env_parse("FFMPEG_CRF") {
            self.transcode.crf = v;
        }
        if let Some(v) = env_parse("FFMPEG_MAX_CONCURRENT") {
            self.transcode.max_concurrent = v;
        }

        // Relay
        if let Some(v) = env_non_empty("TURN_STATIC_AUTH_SECRET") {
            self.turn.secret = Some(v);
        }
        if let Some(v) = env_non_empty("TURN_HOST") {
            self.turn.host = Some(v);
        }
        if let Some(v) = env_non_empty("DOMAIN_FRONTEND") {
            self.turn.frontend_domain = v;
        }
        if env_flag("TURN_ENABLE_TURNS") || env_flag("TURN_ENABLE_TLS") {
            self.turn.enable_turns = true;
        }

        // Storage
        if let Some(v) = env_non_empty("SUPABASE_URL") {
            self.storage.url = v;
        }
        if let Some(v) = env_non_empty("SUPABASE_SERVICE_ROLE_KEY") {
            self.storage.service_key = v;
        }
        if let Some(v) = env_non_empty("SUPABASE_RECORDINGS_BUCKET") {
            self.storage.bucket = v;
        }
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                let mut config = Self::from_file(p)?;
                config.apply_env();
                return Ok(config);
            }
        }
        Ok(Self::from_env())
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.transcode.fps == 0 {
            return Err(Error::InvalidConfig("transcode.fps must be > 0".to_string()));
        }
        if self.transcode.crf > 51 {
            return Err(Error::InvalidConfig(format!(
                "transcode.crf must be within 0-51, got {}",
                self.transcode.crf
            )));
        }
        if self.transcode.max_concurrent == 0 {
            return Err(Error::InvalidConfig(
                "transcode.max_concurrent must be > 0".to_string(),
            ));
        }
        if self.storage.bucket.trim().is_empty() {
            return Err(Error::InvalidConfig("storage.bucket must not be empty".to_string()));
        }
        if self.turn.ttl_secs == 0 {
            return Err(Error::InvalidConfig("turn.ttl_secs must be > 0".to_string()));
        }
        // Each of these feeds a tokio timer that rejects a zero period
        for (name, value) in [
            ("session.analysis_window_secs", self.session.analysis_window_secs),
            ("session.flush_interval_ms", self.session.flush_interval_ms),
            ("session.ice_gather_timeout_ms", self.session.ice_gather_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_non_empty(key).and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> bool {
    env_non_empty(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
