//! pagediff
//!
//! A visual-regression pipeline: render a reference URL and a test URL at
//! several viewport sizes, capture full-page screenshots, compute a per-pixel
//! difference image and percentage for each viewport, and persist the three
//! images under a unique comparison id.
//!
//! # Features
//!
//! - **CDP Backend** (default): captures via headless Chrome
//! - **Pluggable renderers**: the pipeline only sees the [`Renderer`] trait, so
//!   tests can substitute fixed-bitmap stubs
//! - **Portable storage**: artifacts go through the [`store::ResultStore`] trait
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pagediff::orchestrator::{CompareOptions, Orchestrator};
//! use pagediff::store::FsResultStore;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FsResultStore::new("public/screenshots"));
//! let launcher = pagediff::default_launcher(pagediff::RenderConfig::default())?;
//! let orchestrator = Orchestrator::new(launcher, store, CompareOptions::default());
//!
//! let report = orchestrator
//!     .run("https://example.com", "https://staging.example.com")
//!     .await?;
//! for result in &report.results {
//!     println!("{}: {}%", result.viewport, result.diff_percentage);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

pub mod error;
pub use error::{Error, Result};

pub mod codec;
pub use codec::RasterImage;

pub mod diff;
pub mod orchestrator;
pub mod server;
pub mod store;

#[cfg(feature = "cdp")]
pub mod cdp;

/// A named screen size used to render a page for comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
    pub name: &'static str,
}

impl ViewportConfig {
    pub const fn new(name: &'static str, width: u32, height: u32) -> Self {
        Self { width, height, name }
    }
}

/// The viewports every comparison runs through, in result order.
pub const VIEWPORTS: [ViewportConfig; 3] = [
    ViewportConfig::new("desktop", 1920, 1080),
    ViewportConfig::new("tablet", 768, 1024),
    ViewportConfig::new("mobile", 390, 844),
];

/// Configuration for the rendering backend
///
/// The defaults favour determinism over speed: pages get a generous
/// navigation budget and must stay quiet for half a second before capture.
///
/// # Examples
///
/// ```
/// let cfg = pagediff::RenderConfig::default();
/// assert_eq!(cfg.settle_ms, 500);
/// ```
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Optional path to the Chrome/Chromium executable (autodetected if unset)
    pub chrome_path: Option<std::path::PathBuf>,
    /// User agent override; the browser default is kept when `None`
    pub user_agent: Option<String>,
    /// Budget for navigation plus network-idle wait, in milliseconds
    pub navigation_timeout_ms: u64,
    /// How long the network must stay quiet before a capture, in milliseconds
    pub settle_ms: u64,
    /// How often the page is polled while waiting for idle, in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound on the captured document height, in pixels
    pub max_capture_height: u32,
    /// Run Chrome with its sandbox enabled
    pub sandbox: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            user_agent: None,
            navigation_timeout_ms: 30000,
            settle_ms: 500,
            poll_interval_ms: 100,
            max_capture_height: 16384,
            sandbox: true,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.navigation_timeout_ms == 0 {
            return Err(Error::ConfigError("navigation_timeout_ms must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::ConfigError("poll_interval_ms must be positive".into()));
        }
        if self.max_capture_height == 0 {
            return Err(Error::ConfigError("max_capture_height must be positive".into()));
        }
        Ok(())
    }
}

/// Capability interface over a page rendering engine
///
/// Implementations must be usable from several worker threads at once; each
/// `capture` call is expected to use its own isolated browsing context.
pub trait Renderer: Send + Sync {
    /// Load `url` at the given viewport, wait for it to settle, and return a
    /// full-page screenshot.
    fn capture(&self, url: &str, viewport: &ViewportConfig) -> Result<RasterImage>;

    /// Release the underlying engine. Called once per launched renderer.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Creates a fresh renderer for each comparison run
pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<Arc<dyn Renderer>>;
}

impl<F> Launcher for F
where
    F: Fn() -> Result<Arc<dyn Renderer>> + Send + Sync,
{
    fn launch(&self) -> Result<Arc<dyn Renderer>> {
        self()
    }
}

/// Scoped ownership of a launched renderer
///
/// `close` is called exactly once: explicitly through [`RendererSession::close`]
/// or, on early return and unwinding paths, when the session is dropped.
pub struct RendererSession {
    renderer: Arc<dyn Renderer>,
    closed: bool,
}

impl RendererSession {
    pub fn launch(launcher: &dyn Launcher) -> Result<Self> {
        Ok(Self {
            renderer: launcher.launch()?,
            closed: false,
        })
    }

    /// Shared handle for worker jobs. Jobs must finish before the session closes.
    pub fn renderer(&self) -> Arc<dyn Renderer> {
        Arc::clone(&self.renderer)
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.renderer.close()
    }
}

impl Drop for RendererSession {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.renderer.close() {
                log::warn!("Failed to release renderer: {}", e);
            }
        }
    }
}

/// Launcher for the default backend
///
/// This is the CDP backend when the `cdp` feature is enabled (default).
#[cfg(feature = "cdp")]
pub fn default_launcher(config: RenderConfig) -> Result<Arc<dyn Launcher>> {
    config.validate()?;
    Ok(Arc::new(cdp::CdpLauncher::new(config)))
}

#[cfg(not(feature = "cdp"))]
pub fn default_launcher(_config: RenderConfig) -> Result<Arc<dyn Launcher>> {
    Err(Error::ConfigError(
        "no rendering backend compiled in; enable the `cdp` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRenderer {
        closes: Arc<AtomicUsize>,
    }

    impl Renderer for CountingRenderer {
        fn capture(&self, _url: &str, viewport: &ViewportConfig) -> Result<RasterImage> {
            RasterImage::filled(viewport.width, viewport.height, [255, 255, 255, 255])
        }

        fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_launcher(closes: Arc<AtomicUsize>) -> impl Launcher {
        move || -> Result<Arc<dyn Renderer>> {
            Ok(Arc::new(CountingRenderer {
                closes: Arc::clone(&closes),
            }))
        }
    }

    #[test]
    fn test_default_config() {
        let config = RenderConfig::default();
        assert_eq!(config.navigation_timeout_ms, 30000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = RenderConfig {
            navigation_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_viewports_are_ordered_and_unique() {
        let names: Vec<_> = VIEWPORTS.iter().map(|v| v.name).collect();
        assert_eq!(names, ["desktop", "tablet", "mobile"]);
        assert_eq!(VIEWPORTS[2], ViewportConfig::new("mobile", 390, 844));
    }

    #[test]
    fn session_closes_once_when_closed_explicitly() {
        let closes = Arc::new(AtomicUsize::new(0));
        let launcher = counting_launcher(Arc::clone(&closes));
        let session = RendererSession::launch(&launcher).unwrap();
        session.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn session_closes_on_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let launcher = counting_launcher(Arc::clone(&closes));
        {
            let session = RendererSession::launch(&launcher).unwrap();
            let img = session.renderer().capture("about:blank", &VIEWPORTS[2]).unwrap();
            assert_eq!(img.dimensions(), (390, 844));
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
