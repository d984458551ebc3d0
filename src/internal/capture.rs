use anyhow::{Context, Result, anyhow};
use headless_chrome::protocol::cdp::Page::{CaptureScreenshotFormatOption, Viewport as Clip};
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use std::ffi::OsStr;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::models::{Frame, Viewport};
use super::store::ImageStore;
use crate::config::CaptureSettings;

/// Loads a URL at a given viewport and returns a full-page PNG.
pub trait PageCapturer {
    fn capture(&self, url: &str, viewport: &Viewport) -> Result<Vec<u8>>;
}

/// Result of capturing every configured frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureOutcome {
    pub captured: Vec<String>,
    pub failed: Vec<String>,
}

/// Capture `url` once per frame into `store`.
///
/// A failure is recorded against its frame only; remaining frames are still captured.
pub fn capture_all(
    capturer: &dyn PageCapturer,
    url: &str,
    frames: &[Frame],
    store: &dyn ImageStore,
) -> CaptureOutcome {
    let mut outcome = CaptureOutcome::default();

    for frame in frames {
        let (width, height) = frame.viewport.pixel_size();
        let result = capturer
            .capture(url, &frame.viewport)
            .and_then(|png| store.put(&frame.name, &png));

        match result {
            Ok(()) => {
                info!(frame = %frame.name, width, height, location = %store.location(&frame.name), "Captured screenshot");
                outcome.captured.push(frame.name.clone());
            }
            Err(e) => {
                error!(frame = %frame.name, error = %format!("{e:#}"), "Failed to capture screenshot");
                outcome.failed.push(frame.name.clone());
            }
        }
    }

    outcome
}

/// Headless Chrome capturer. Each capture runs in its own browser context.
pub struct ChromeCapturer {
    browser: Browser,
    settings: CaptureSettings,
}

impl ChromeCapturer {
    pub fn launch(settings: CaptureSettings) -> Result<Self> {
        let launch_opts = LaunchOptionsBuilder::default()
            .headless(true)
            .window_size(Some((1280, 800)))
            .idle_browser_timeout(Duration::from_secs(settings.timeout_secs.max(60) * 5))
            .args(vec![
                OsStr::new("--force-device-scale-factor=1"),
                OsStr::new("--hide-scrollbars"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-extensions"),
            ])
            .build()
            .map_err(|e| anyhow!("invalid browser launch options: {e}"))?;
        let browser = Browser::new(launch_opts).context("failed to launch headless Chrome")?;
        info!("Launched headless Chrome");
        Ok(Self { browser, settings })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    /// Wait until no new resources have been requested for `idle_quiet_ms`.
    fn wait_for_network_idle(&self, tab: &Tab) -> Result<()> {
        let quiet = Duration::from_millis(self.settings.idle_quiet_ms);
        let deadline = Instant::now() + self.timeout();
        let mut last_count = -1.0;
        let mut stable_since = Instant::now();

        loop {
            let count = tab
                .evaluate(
                    "document.readyState === 'complete' ? performance.getEntriesByType('resource').length : -1",
                    false,
                )?
                .value
                .and_then(|v| v.as_f64())
                .unwrap_or(-1.0);

            if count != last_count || count < 0.0 {
                last_count = count;
                stable_since = Instant::now();
            } else if stable_since.elapsed() >= quiet {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "network did not become idle within {}s",
                    self.settings.timeout_secs
                ));
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn document_height(&self, tab: &Tab) -> Result<f64> {
        tab.evaluate(
            "Math.max(document.body ? document.body.scrollHeight : 0, document.documentElement.scrollHeight)",
            false,
        )?
        .value
        .and_then(|v| v.as_f64())
        .ok_or_else(|| anyhow!("could not measure document height"))
    }
}

impl PageCapturer for ChromeCapturer {
    fn capture(&self, url: &str, viewport: &Viewport) -> Result<Vec<u8>> {
        let (width, height) = viewport.pixel_size();

        let context = self
            .browser
            .new_context()
            .context("failed to create browser context")?;
        let tab = context.new_tab().context("failed to open tab")?;
        tab.set_default_timeout(self.timeout());

        let result = (|| {
            tab.set_bounds(Bounds::Normal {
                left: Some(0),
                top: Some(0),
                width: Some(width as f64),
                height: Some(height as f64),
            })?;
            tab.navigate_to(url)
                .with_context(|| format!("failed to navigate to {url}"))?;
            tab.wait_until_navigated()?;
            self.wait_for_network_idle(&tab)?;

            // full page: grow the window to the document before capturing
            let full_height = self.document_height(&tab)?.max(height as f64).ceil();
            tab.set_bounds(Bounds::Normal {
                left: Some(0),
                top: Some(0),
                width: Some(width as f64),
                height: Some(full_height),
            })?;

            let clip = Clip {
                x: 0.0,
                y: 0.0,
                width: width as f64,
                height: full_height,
                scale: 1.0,
            };
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, Some(clip), true)
                .context("failed to capture screenshot")
        })();

        if let Err(e) = tab.close(true) {
            tracing::debug!(error = %e, "Failed to close tab");
        }

        result
    }
}
