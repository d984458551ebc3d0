use anyhow::{Context, Result, anyhow};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::capture::{ChromeCapturer, PageCapturer, capture_all};
use super::compare::compare_bytes;
use super::fetcher::{FetchError, FetchOptions, fetch_references};
use super::models::{ComparisonResult, Frame};
use super::store::{FsStore, ImageStore};
use crate::api::FigmaClient;
use crate::config::{AppConfig, CaptureSettings, VrtSettings};

/// Pipeline steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumIter, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Fetch,
    Capture,
    Compare,
    BaselineCopy,
    ExternalTest,
    Upload,
}

impl Step {
    fn phase(self) -> Phase {
        match self {
            Self::Fetch => Phase::Fetching,
            Self::Capture => Phase::Capturing,
            Self::Compare => Phase::Comparing,
            Self::BaselineCopy => Phase::CopyingBaselines,
            Self::ExternalTest => Phase::Testing,
            Self::Upload => Phase::Uploading,
        }
    }

    fn is_external(self) -> bool {
        matches!(self, Self::ExternalTest | Self::Upload)
    }
}

/// Which steps one invocation runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Fetch, capture and compare, followed by the external steps when configured.
    #[default]
    All,
    FetchOnly,
    CaptureOnly,
    CompareOnly,
    /// Capture and compare against whatever baselines are cached.
    SkipFetch,
    /// Fetch, then hand the baselines to the external visual-test runner.
    Vrt,
    /// An explicit combination of steps, still run in `Step` order.
    Steps(BTreeSet<Step>),
}

impl RunMode {
    /// Mode for a set of individually selected steps. No selection means `All`.
    pub fn from_steps(steps: BTreeSet<Step>) -> Self {
        let single: Vec<Step> = steps.iter().copied().collect();
        match single.as_slice() {
            [] => Self::All,
            [Step::Fetch] => Self::FetchOnly,
            [Step::Capture] => Self::CaptureOnly,
            [Step::Compare] => Self::CompareOnly,
            _ => Self::Steps(steps),
        }
    }

    fn includes(&self, step: Step, vrt_configured: bool) -> bool {
        use Step::*;
        match self {
            Self::All => match step {
                Fetch | Capture | Compare => true,
                BaselineCopy | ExternalTest | Upload => vrt_configured,
            },
            Self::FetchOnly => step == Fetch,
            Self::CaptureOnly => step == Capture,
            Self::CompareOnly => step == Compare,
            Self::SkipFetch => matches!(step, Capture | Compare),
            Self::Vrt => matches!(step, Fetch | BaselineCopy | ExternalTest | Upload),
            Self::Steps(steps) => steps.contains(&step),
        }
    }

    /// Steps selected by this mode, in execution order.
    pub fn steps(&self, vrt_configured: bool) -> Vec<Step> {
        Step::iter()
            .filter(|step| self.includes(*step, vrt_configured))
            .collect()
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::FetchOnly => f.write_str("fetch-only"),
            Self::CaptureOnly => f.write_str("capture-only"),
            Self::CompareOnly => f.write_str("compare-only"),
            Self::SkipFetch => f.write_str("skip-fetch"),
            Self::Vrt => f.write_str("vrt"),
            Self::Steps(steps) => {
                let names: Vec<String> = steps.iter().map(ToString::to_string).collect();
                f.write_str(&names.join("+"))
            }
        }
    }
}

impl Serialize for RunMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Orchestrator state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Phase {
    Idle,
    Fetching,
    Capturing,
    Comparing,
    CopyingBaselines,
    Testing,
    Uploading,
    Reporting,
    Done,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    MissingCredential(FetchError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid pipeline transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step: Step,
    pub status: StepStatus,
    pub detail: String,
}

impl StepOutcome {
    fn new(step: Step, status: StepStatus, detail: impl Into<String>) -> Self {
        Self {
            step,
            status,
            detail: detail.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status != StepStatus::Failed
    }
}

/// Everything a run produced, in memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub steps: Vec<StepOutcome>,
    pub results: Vec<ComparisonResult>,
    pub average_match: Option<f64>,
    pub diff_location: String,
}

impl RunReport {
    pub fn step(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }

    /// Process exit code: non-zero when nothing could be compared, an external step
    /// failed, or (for modes without a compare step) any step failed.
    pub fn exit_code(&self) -> i32 {
        let compared = self.step(Step::Compare).is_some();

        if compared && self.results.is_empty() {
            return 1;
        }
        if self
            .steps
            .iter()
            .any(|s| !s.succeeded() && (s.step.is_external() || !compared))
        {
            return 1;
        }
        0
    }
}

fn average(results: &[ComparisonResult]) -> Option<f64> {
    if results.is_empty() {
        return None;
    }
    Some(results.iter().map(|r| r.match_percentage).sum::<f64>() / results.len() as f64)
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    pub force_refresh: bool,
}

/// The baseline, screenshot and diff stores, joined by frame name.
#[derive(Clone)]
pub struct Stores {
    pub baseline: Arc<dyn ImageStore>,
    pub screenshot: Arc<dyn ImageStore>,
    pub diff: Arc<dyn ImageStore>,
}

impl Stores {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            baseline: Arc::new(FsStore::new(&config.baseline_dir)),
            screenshot: Arc::new(FsStore::new(&config.screenshot_dir)),
            diff: Arc::new(FsStore::new(&config.diff_dir)),
        }
    }
}

/// Builds the page capturer on first use, so runs without a capture step never start a browser.
pub type CapturerLauncher =
    Box<dyn Fn(&CaptureSettings) -> Result<Box<dyn PageCapturer>> + Send>;

pub fn chrome_launcher() -> CapturerLauncher {
    Box::new(|settings: &CaptureSettings| {
        ChromeCapturer::launch(*settings).map(|c| Box::new(c) as Box<dyn PageCapturer>)
    })
}

pub struct Pipeline {
    config: AppConfig,
    options: RunOptions,
    stores: Stores,
    client: Option<FigmaClient>,
    launcher: CapturerLauncher,
    phase: Phase,
    visited: Vec<Phase>,
}

impl Pipeline {
    pub fn new(
        config: AppConfig,
        options: RunOptions,
        stores: Stores,
        client: Option<FigmaClient>,
        launcher: CapturerLauncher,
    ) -> Self {
        Self {
            config,
            options,
            stores,
            client,
            launcher,
            phase: Phase::Idle,
            visited: vec![Phase::Idle],
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, starting with `Idle`.
    pub fn visited(&self) -> &[Phase] {
        &self.visited
    }

    pub fn steps(&self) -> Vec<Step> {
        self.options.mode.steps(self.config.vrt.is_some())
    }

    fn advance(&mut self, next: Phase) -> Result<(), PipelineError> {
        if next <= self.phase {
            return Err(PipelineError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!(from = %self.phase, to = %next, "Pipeline phase");
        self.phase = next;
        self.visited.push(next);
        Ok(())
    }

    /// Whether every frame already has a baseline that the fetch step would reuse.
    fn fully_cached(&self) -> bool {
        !self.options.force_refresh
            && self
                .config
                .frames
                .iter()
                .all(|f| self.stores.baseline.has(&f.name))
    }

    /// Fail before any step runs when fetching is required but impossible.
    fn preflight(&self, steps: &[Step]) -> Result<(), PipelineError> {
        if self.options.mode == RunMode::Vrt && self.config.vrt.is_none() {
            return Err(PipelineError::InvalidConfig(
                "the vrt mode needs a `vrt` section in the config".to_string(),
            ));
        }

        if steps.contains(&Step::Fetch) && self.client.is_none() {
            let baseline = &self.stores.baseline;
            let frames = &self.config.frames;
            let missing = frames
                .iter()
                .filter(|f| self.options.force_refresh || !baseline.has(&f.name))
                .count();
            let any_cached = frames.iter().any(|f| baseline.has(&f.name));

            if missing > 0 && (self.options.force_refresh || !any_cached) {
                return Err(PipelineError::MissingCredential(
                    FetchError::MissingCredential { missing },
                ));
            }
        }

        Ok(())
    }

    /// Run the selected steps once. A pipeline cannot be re-run.
    pub fn run(&mut self) -> Result<RunReport, PipelineError> {
        let steps = self.steps();
        self.preflight(&steps)?;

        info!(
            mode = %self.options.mode,
            file_key = %self.config.file_key,
            frames = self.config.frames.len(),
            steps = ?steps,
            "Starting visual comparison"
        );

        let mut outcomes = Vec::with_capacity(steps.len());
        let mut results = Vec::new();

        for step in steps {
            if step == Step::Fetch && self.fully_cached() {
                let outcome = StepOutcome::new(
                    step,
                    StepStatus::Skipped,
                    format!("all {} baselines cached", self.config.frames.len()),
                );
                info!(step = %step, detail = %outcome.detail, "Step skipped");
                outcomes.push(outcome);
                continue;
            }

            self.advance(step.phase())?;
            let outcome = match step {
                Step::Fetch => self.fetch(),
                Step::Capture => self.capture(),
                Step::Compare => {
                    results = self.compare_all();
                    let status = if results.is_empty() {
                        StepStatus::Failed
                    } else {
                        StepStatus::Ok
                    };
                    StepOutcome::new(
                        step,
                        status,
                        format!(
                            "{} of {} frames compared",
                            results.len(),
                            self.config.frames.len()
                        ),
                    )
                }
                Step::BaselineCopy => self.copy_baselines(),
                Step::ExternalTest => self.external_test(),
                Step::Upload => self.upload(),
            };

            match outcome.status {
                StepStatus::Failed => warn!(step = %step, detail = %outcome.detail, "Step failed"),
                _ => info!(step = %step, status = %outcome.status, detail = %outcome.detail, "Step finished"),
            }
            outcomes.push(outcome);
        }

        self.advance(Phase::Reporting)?;
        let report = RunReport {
            mode: self.options.mode.clone(),
            steps: outcomes,
            average_match: average(&results),
            results,
            diff_location: self.stores.diff.root_location(),
        };

        if let Some(path) = &self.config.report_path
            && let Err(e) = super::report::write_json(&report, Path::new(path))
        {
            warn!(error = %format!("{e:#}"), path = %path, "Failed to write JSON report");
        }

        self.advance(Phase::Done)?;
        Ok(report)
    }

    fn fetch(&self) -> StepOutcome {
        let options = FetchOptions {
            force_refresh: self.options.force_refresh,
            download_retries: self.config.download_retries,
        };

        match fetch_references(
            self.client.as_ref(),
            &self.config.file_key,
            &self.config.frames,
            self.stores.baseline.as_ref(),
            options,
        ) {
            Ok(outcome) => {
                let mut detail = format!(
                    "{} fetched, {} cached, {} failed",
                    outcome.fetched.len(),
                    outcome.cached.len(),
                    outcome.failed.len()
                );
                if outcome.used_cache_fallback {
                    detail.push_str(" (using cache)");
                }
                StepOutcome::new(Step::Fetch, StepStatus::Ok, detail)
            }
            Err(e) => {
                error!("{}", e);
                StepOutcome::new(Step::Fetch, StepStatus::Failed, e.to_string())
            }
        }
    }

    fn capture(&self) -> StepOutcome {
        info!(url = %self.config.base_url, "Capturing implementation screenshots");

        let capturer = match (self.launcher)(&self.config.capture) {
            Ok(capturer) => capturer,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to start browser");
                return StepOutcome::new(Step::Capture, StepStatus::Failed, format!("{e:#}"));
            }
        };

        let outcome = capture_all(
            capturer.as_ref(),
            &self.config.base_url,
            &self.config.frames,
            self.stores.screenshot.as_ref(),
        );

        let status = if outcome.failed.is_empty() {
            StepStatus::Ok
        } else {
            StepStatus::Failed
        };
        let mut detail = format!("{} captured", outcome.captured.len());
        if !outcome.failed.is_empty() {
            detail.push_str(&format!(", failed: {}", outcome.failed.join(", ")));
        }
        StepOutcome::new(Step::Capture, status, detail)
    }

    /// Compare every frame that has both a baseline and a screenshot.
    pub fn compare_all(&self) -> Vec<ComparisonResult> {
        let Stores {
            baseline,
            screenshot,
            ..
        } = &self.stores;
        let mut results = Vec::new();

        for frame in &self.config.frames {
            if !baseline.has(&frame.name) {
                warn!(frame = %frame.name, expected = %baseline.location(&frame.name), "Figma baseline not found");
                continue;
            }
            if !screenshot.has(&frame.name) {
                warn!(frame = %frame.name, expected = %screenshot.location(&frame.name), "Implementation screenshot not found");
                continue;
            }

            match self.compare_frame(frame) {
                Ok(result) => {
                    info!(
                        frame = %frame.name,
                        match_percentage = %format!("{:.2}", result.match_percentage),
                        diff_pixels = result.diff_pixels,
                        "Compared"
                    );
                    results.push(result);
                }
                Err(e) => {
                    error!(frame = %frame.name, error = %format!("{e:#}"), "Error comparing frame");
                }
            }
        }

        results
    }

    fn compare_frame(&self, frame: &Frame) -> Result<ComparisonResult> {
        let reference = self.stores.baseline.get(&frame.name)?;
        let implementation = self.stores.screenshot.get(&frame.name)?;

        let (comparison, diff_png) =
            compare_bytes(&reference, &implementation, self.config.threshold)?;

        let diff_name = frame.diff_name();
        self.stores.diff.put(&diff_name, &diff_png)?;

        Ok(ComparisonResult::new(
            frame.name.clone(),
            comparison,
            self.stores.diff.location(&diff_name),
        ))
    }

    fn vrt_settings(&self) -> Result<&VrtSettings> {
        self.config
            .vrt
            .as_ref()
            .ok_or_else(|| anyhow!("no `vrt` section configured"))
    }

    fn copy_baselines(&self) -> StepOutcome {
        let copied = self.vrt_settings().and_then(|vrt| {
            let mut copied = 0;
            for frame in &self.config.frames {
                if !self.stores.baseline.has(&frame.name) {
                    warn!(frame = %frame.name, "No baseline to copy");
                    continue;
                }
                let bytes = self.stores.baseline.get(&frame.name)?;
                let target = Path::new(&vrt.snapshot_dir)
                    .join(format!("{}{}.png", frame.name, vrt.snapshot_suffix));
                crate::utils::fs::write_creating_dirs(&target, &bytes)?;
                info!(frame = %frame.name, target = %target.display(), "Copied baseline");
                copied += 1;
            }
            Ok(copied)
        });

        match copied {
            Ok(0) => StepOutcome::new(
                Step::BaselineCopy,
                StepStatus::Failed,
                "no baselines available to copy",
            ),
            Ok(n) => StepOutcome::new(
                Step::BaselineCopy,
                StepStatus::Ok,
                format!("{n} baselines copied"),
            ),
            Err(e) => StepOutcome::new(Step::BaselineCopy, StepStatus::Failed, format!("{e:#}")),
        }
    }

    fn external_test(&self) -> StepOutcome {
        let result = self
            .vrt_settings()
            .and_then(|vrt| run_command(&vrt.test_command));
        command_outcome(Step::ExternalTest, result)
    }

    fn upload(&self) -> StepOutcome {
        match self.vrt_settings().map(|vrt| vrt.upload_command.as_ref()) {
            Ok(Some(command)) => command_outcome(Step::Upload, run_command(command)),
            Ok(None) => StepOutcome::new(
                Step::Upload,
                StepStatus::Skipped,
                "no upload command configured",
            ),
            Err(e) => StepOutcome::new(Step::Upload, StepStatus::Failed, format!("{e:#}")),
        }
    }
}

/// Run an external tool to completion. `Ok(false)` means it exited unsuccessfully.
fn run_command(command: &[String]) -> Result<bool> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;

    info!(command = %command.join(" "), "Running external command");
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {program}"))?;

    debug!(?status, "External command exited");
    Ok(status.success())
}

fn command_outcome(step: Step, result: Result<bool>) -> StepOutcome {
    match result {
        Ok(true) => StepOutcome::new(step, StepStatus::Ok, "exited successfully"),
        Ok(false) => StepOutcome::new(step, StepStatus::Failed, "exited with a failure status"),
        Err(e) => StepOutcome::new(step, StepStatus::Failed, format!("{e:#}")),
    }
}
