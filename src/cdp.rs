//! Chrome DevTools Protocol renderer implementation

use crate::codec::{decode_png, RasterImage};
use crate::{Error, Launcher, RenderConfig, Renderer, Result, ViewportConfig};
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reports readiness and how many subresources the page has fetched so far.
const LOAD_STATE_SCRIPT: &str = r#"
    (function() {
        return JSON.stringify({
            ready: document.readyState,
            resources: performance.getEntriesByType('resource').length
        });
    })()
"#;

/// Reports the rendered document size in CSS pixels.
const CONTENT_SIZE_SCRIPT: &str = r#"
    (function() {
        const d = document.documentElement;
        const b = document.body;
        return JSON.stringify({
            width: Math.max(d ? d.scrollWidth : 0, b ? b.scrollWidth : 0),
            height: Math.max(d ? d.scrollHeight : 0, b ? b.scrollHeight : 0)
        });
    })()
"#;

/// Launches one headless Chrome per comparison run
pub struct CdpLauncher {
    config: RenderConfig,
}

impl CdpLauncher {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }
}

impl Launcher for CdpLauncher {
    fn launch(&self) -> Result<Arc<dyn Renderer>> {
        Ok(Arc::new(CdpRenderer::new(self.config.clone())?))
    }
}

/// CDP-based renderer (uses the `headless_chrome` crate)
///
/// Owns a single browser process. Every capture opens its own incognito
/// browser context and tab, so cookies and storage never leak between the
/// reference and test pages or between viewports.
pub struct CdpRenderer {
    browser: Browser,
    config: RenderConfig,
}

impl CdpRenderer {
    pub fn new(config: RenderConfig) -> Result<Self> {
        config.validate()?;

        let (width, height) = (crate::VIEWPORTS[0].width, crate::VIEWPORTS[0].height);
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(config.sandbox)
            .path(config.chrome_path.clone())
            .window_size(Some((width, height)))
            .args(vec![
                OsStr::new("--force-device-scale-factor=1"),
                OsStr::new("--hide-scrollbars"),
            ])
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::CdpError(format!("Failed to launch browser: {}", e)))?;

        debug!("Launched headless Chrome");
        Ok(Self { browser, config })
    }

    fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.navigation_timeout_ms)
    }

    fn open_tab(&self, viewport: &ViewportConfig) -> Result<Arc<Tab>> {
        let context = self
            .browser
            .new_context()
            .map_err(|e| Error::CdpError(format!("Failed to create browser context: {}", e)))?;
        let tab = context
            .new_tab()
            .map_err(|e| Error::CdpError(format!("Failed to create tab: {}", e)))?;

        tab.set_default_timeout(self.navigation_timeout());

        if let Some(ua) = &self.config.user_agent {
            tab.set_user_agent(ua, None, None)
                .map_err(|e| Error::CdpError(format!("Failed to set user agent: {}", e)))?;
        }

        resize(&tab, viewport.width, viewport.height)?;
        Ok(tab)
    }

    fn load(&self, tab: &Tab, url: &str) -> Result<()> {
        tab.navigate_to(url)
            .map_err(|e| Error::NavigationError(format!("Navigation to {} failed: {}", url, e)))?;
        tab.wait_until_navigated()
            .map_err(|e| Error::NavigationError(format!("Waiting for {} failed: {}", url, e)))?;
        self.wait_for_network_idle(tab, url)
    }

    /// Poll until the document is complete and no new resource has been
    /// fetched for `settle_ms`. Bounded by the navigation timeout.
    fn wait_for_network_idle(&self, tab: &Tab, url: &str) -> Result<()> {
        let deadline = Instant::now() + self.navigation_timeout();
        let settle = Duration::from_millis(self.config.settle_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        let mut last_count: Option<u64> = None;
        let mut quiet_since = Instant::now();

        loop {
            let state = evaluate_json(tab, LOAD_STATE_SCRIPT)
                .map_err(|e| Error::NavigationError(format!("Probing {} failed: {}", url, e)))?;
            let ready = state.get("ready").and_then(|v| v.as_str()) == Some("complete");
            let count = state.get("resources").and_then(|v| v.as_u64()).unwrap_or(0);

            if last_count != Some(count) || !ready {
                last_count = Some(count);
                quiet_since = Instant::now();
            } else if quiet_since.elapsed() >= settle {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::NavigationError(format!(
                    "{} did not reach network idle within {}ms",
                    url, self.config.navigation_timeout_ms
                )));
            }
            std::thread::sleep(poll);
        }
    }

    fn capture_full_page(&self, tab: &Tab, viewport: &ViewportConfig) -> Result<Vec<u8>> {
        let size = evaluate_json(tab, CONTENT_SIZE_SCRIPT)
            .map_err(|e| Error::CaptureError(format!("Measuring document failed: {}", e)))?;
        let content_height = size
            .get("height")
            .and_then(|v| v.as_u64())
            .unwrap_or(viewport.height as u64);

        let height = capture_height(content_height, viewport.height, self.config.max_capture_height);
        if content_height > self.config.max_capture_height as u64 {
            warn!(
                "Document height {}px exceeds the {}px capture limit; truncating",
                content_height, self.config.max_capture_height
            );
        }

        if height != viewport.height {
            resize(tab, viewport.width, height)?;
        }

        let clip = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: viewport.width as f64,
            height: height as f64,
            scale: 1.0,
        };
        tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, Some(clip), true)
            .map_err(|e| Error::CaptureError(format!("Screenshot failed: {}", e)))
    }
}

impl Renderer for CdpRenderer {
    fn capture(&self, url: &str, viewport: &ViewportConfig) -> Result<RasterImage> {
        let tab = self.open_tab(viewport)?;

        let result = self
            .load(&tab, url)
            .and_then(|_| self.capture_full_page(&tab, viewport));

        if let Err(e) = tab.close(true) {
            warn!("Failed to close tab for {}: {}", viewport.name, e);
        }

        let png = result?;
        decode_png(&png).map_err(|e| Error::CaptureError(format!("Screenshot was not a PNG: {}", e)))
    }

    fn close(&self) -> Result<()> {
        // The child process is killed when the last `Browser` handle drops;
        // closing every remaining tab here makes that prompt.
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map(|tabs| tabs.clone())
            .unwrap_or_default();
        for tab in tabs {
            if let Err(e) = tab.close(false) {
                debug!("Failed to close leftover tab: {}", e);
            }
        }
        Ok(())
    }
}

/// Document height clamped to `[viewport_height, max_height]`, computed in
/// u64 so oversized measurements saturate instead of wrapping.
fn capture_height(content_height: u64, viewport_height: u32, max_height: u32) -> u32 {
    content_height
        .max(viewport_height as u64)
        .min(max_height as u64) as u32
}

fn resize(tab: &Tab, width: u32, height: u32) -> Result<()> {
    tab.set_bounds(Bounds::Normal {
        left: Some(0),
        top: Some(0),
        width: Some(width as f64),
        height: Some(height as f64),
    })
    .map_err(|e| Error::CdpError(format!("Failed to set viewport {}x{}: {}", width, height, e)))?;
    Ok(())
}

fn evaluate_json(tab: &Tab, script: &str) -> Result<serde_json::Value> {
    let remote = tab.evaluate(script, false)?;
    let raw = remote
        .value
        .ok_or_else(|| Error::CdpError("No value returned from evaluation".into()))?;
    match raw.as_str() {
        Some(s) => serde_json::from_str(s)
            .map_err(|e| Error::CdpError(format!("Malformed evaluation result: {}", e))),
        None => Ok(raw),
    }
}
