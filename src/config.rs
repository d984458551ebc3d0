use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::internal::models::{Frame, Viewport};

pub const CONFIG_FILE_NAME: &str = "vrt.ron";

/// Environment variables checked, in order, for the Figma access token.
pub const TOKEN_ENV_VARS: [&str; 2] = ["FIGMA_ACCESS_TOKEN", "FIGMA_TOKEN"];

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Design file key, from figma.com/design/{file_key}/...
    pub file_key: String,
    /// Frames under test. Names must be unique; they key every store.
    pub frames: Vec<Frame>,
    /// Root URL of the running implementation.
    pub base_url: String,
    /// Figma REST API root.
    pub api_base_url: String,
    pub baseline_dir: String,
    pub screenshot_dir: String,
    pub diff_dir: String,
    /// Per-pixel colour distance tolerated by the comparator (0..=1, lower is stricter).
    pub threshold: f64,
    /// Extra attempts for a failed image download.
    pub download_retries: u32,
    pub capture: CaptureSettings,
    /// External visual-test steps. Absent means those steps never run.
    pub vrt: Option<VrtSettings>,
    /// Where to write a JSON report of the run, if anywhere.
    pub report_path: Option<String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct CaptureSettings {
    /// Upper bound for navigation, network idle and screenshot.
    pub timeout_secs: u64,
    /// How long the page must stop requesting resources to count as idle.
    pub idle_quiet_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            idle_quiet_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct VrtSettings {
    /// Snapshot directory read by the external test runner.
    pub snapshot_dir: String,
    /// Appended to the frame name, e.g. "-chromium-linux".
    pub snapshot_suffix: String,
    pub test_command: Vec<String>,
    pub upload_command: Option<Vec<String>>,
}

impl Default for VrtSettings {
    fn default() -> Self {
        Self {
            snapshot_dir: "e2e/visual.spec.ts-snapshots".to_string(),
            snapshot_suffix: "-chromium-linux".to_string(),
            test_command: ["npx", "playwright", "test", "e2e/visual.spec.ts"]
                .map(String::from)
                .to_vec(),
            upload_command: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub module_levels: BTreeMap<String, String>,
    /// When set, logs go to a daily rolling file here instead of stderr.
    pub log_directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: BTreeMap::new(),
            log_directory: None,
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directive string, e.g. `info,reqwest=warn`.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.level.clone();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level));
        }
        filter_str
    }
}

fn default_frames() -> Vec<Frame> {
    vec![Frame::new(
        "1-591",
        "homepage-desktop",
        Viewport::new(1920.0, 7019.98),
    )]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            file_key: "cWiDCn3brmySFIcidCmP3E".to_string(),
            frames: default_frames(),
            base_url: "http://localhost:3000".to_string(),
            api_base_url: crate::api::FIGMA_API_BASE_URL.to_string(),
            baseline_dir: "e2e/baselines/figma".to_string(),
            screenshot_dir: "e2e/screenshots".to_string(),
            diff_dir: "e2e/diff".to_string(),
            threshold: crate::internal::compare::DEFAULT_THRESHOLD,
            download_retries: 2,
            capture: CaptureSettings::default(),
            vrt: None,
            report_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from an explicit path. Read or parse failures are errors.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: AppConfig = ron::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Look for `vrt.ron` in the working directory, next to the executable, then in the
    /// user config directory. Falls back to defaults when nothing usable is found.
    pub fn load() -> Self {
        let mut candidates = Vec::new();

        // 1. Current working directory
        candidates.push(PathBuf::from(CONFIG_FILE_NAME));

        // 2. Next to executable
        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            candidates.push(dir.join(CONFIG_FILE_NAME));
        }

        // 3. User config directory
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("figma-vrt").join(CONFIG_FILE_NAME));
        }

        for path in candidates {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::error!("Ignoring config at {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.frames.is_empty() {
            bail!("config lists no frames");
        }

        let mut seen = HashSet::new();
        for frame in &self.frames {
            if frame.name.trim().is_empty() {
                bail!("frame with node id '{}' has an empty name", frame.node_id);
            }
            // names become file names in every store
            if frame.name.contains(['/', '\\']) || frame.name == "." || frame.name == ".." {
                bail!(
                    "frame name '{}' must not contain path separators or be '.' or '..'",
                    frame.name
                );
            }
            if frame.node_id.trim().is_empty() {
                bail!("frame '{}' has an empty node id", frame.name);
            }
            if !(frame.viewport.width > 0.0 && frame.viewport.height > 0.0) {
                bail!("frame '{}' has a non-positive viewport", frame.name);
            }
            if !seen.insert(frame.name.as_str()) {
                bail!("duplicate frame name '{}'", frame.name);
            }
        }

        if !(0.0..=1.0).contains(&self.threshold) {
            bail!("threshold {} is outside 0..=1", self.threshold);
        }

        Ok(())
    }
}

/// First non-empty token from `FIGMA_ACCESS_TOKEN` or `FIGMA_TOKEN`.
pub fn token_from_env() -> Option<String> {
    TOKEN_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}
