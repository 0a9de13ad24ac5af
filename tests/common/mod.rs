//! Fixed-bitmap renderers shared by the integration tests

#![allow(dead_code)]

use pagediff::{Error, Launcher, RasterImage, Renderer, Result, ViewportConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the stub paints one URL
#[derive(Clone)]
pub enum Page {
    /// Viewport-sized solid fill
    Solid([u8; 4]),
    /// Solid fill with a content-driven height
    Tall([u8; 4], u32),
    /// Navigation fails
    Unreachable,
}

/// Renders each URL from a fixed table, never touching the network
#[derive(Clone, Default)]
pub struct StubRenderer {
    pages: HashMap<String, Page>,
    delays: HashMap<&'static str, Duration>,
    pub captures: Arc<Mutex<Vec<(String, &'static str)>>>,
    pub closes: Arc<AtomicUsize>,
    pub launches: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    /// Set when `close` arrives while a capture is still running
    pub closed_while_capturing: Arc<AtomicBool>,
}

impl StubRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, page: Page) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    /// Make captures at `viewport` slow, to shuffle completion order.
    pub fn delay(mut self, viewport: &'static str, millis: u64) -> Self {
        self.delays.insert(viewport, Duration::from_millis(millis));
        self
    }

    pub fn launcher(&self) -> Arc<dyn Launcher> {
        let stub = self.clone();
        Arc::new(move || -> Result<Arc<dyn Renderer>> {
            stub.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(stub.clone()))
        })
    }

    pub fn capture_count(&self) -> usize {
        self.captures.lock().unwrap().len()
    }
}

impl Renderer for StubRenderer {
    fn capture(&self, url: &str, viewport: &ViewportConfig) -> Result<RasterImage> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(viewport.name) {
            std::thread::sleep(*delay);
        }
        self.captures
            .lock()
            .unwrap()
            .push((url.to_string(), viewport.name));
        let image = match self.pages.get(url) {
            Some(Page::Solid(rgba)) => RasterImage::filled(viewport.width, viewport.height, *rgba),
            Some(Page::Tall(rgba, height)) => RasterImage::filled(viewport.width, *height, *rgba),
            Some(Page::Unreachable) | None => Err(Error::NavigationError(format!("{} is unreachable", url))),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        image
    }

    fn close(&self) -> Result<()> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.closed_while_capturing.store(true, Ordering::SeqCst);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub const WHITE: [u8; 4] = [255, 255, 255, 255];
pub const BLACK: [u8; 4] = [0, 0, 0, 255];

/// Same names and order as the production viewports, at a size that keeps
/// encoding cheap.
pub const SMALL_VIEWPORTS: [ViewportConfig; 3] = [
    ViewportConfig::new("desktop", 64, 36),
    ViewportConfig::new("tablet", 32, 42),
    ViewportConfig::new("mobile", 16, 34),
];
