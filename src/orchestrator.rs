//! Comparison orchestrator
//!
//! Drives one comparison run end to end: validate the request, allocate a
//! comparison id and its storage namespace, launch a renderer, then for every
//! viewport capture both pages, diff them and persist the three images.
//!
//! Viewport jobs run on the blocking pool through an order-preserving
//! buffered stream, so `concurrency > 1` overlaps captures while the returned
//! results still follow the viewport list order. A failed run is rolled back:
//! its namespace is removed before the error is returned.

use crate::codec::{encode_png, RasterImage};
use crate::diff::{diff_with_options, format_percentage, DiffOptions};
use crate::store::{ArtifactKey, ArtifactKind, ResultStore};
use crate::{Error, Launcher, Renderer, RendererSession, Result, ViewportConfig, VIEWPORTS};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Canvas fill for the area one capture has and the other lacks.
const PAD_COLOR: [u8; 4] = [255, 0, 255, 255];

/// What to do when the reference and test captures differ in size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Place both captures top-left on a common canvas (max width x max
    /// height) filled with magenta, diff that, and report the mismatch.
    #[default]
    Pad,
    /// Fail the viewport with [`Error::DimensionMismatch`].
    Fail,
}

/// Options for a comparison run
#[derive(Debug, Clone)]
pub struct CompareOptions {
    /// Viewports to render, in result order
    pub viewports: Vec<ViewportConfig>,
    /// Pixel matching and diff painting options
    pub diff: DiffOptions,
    /// Viewport jobs allowed in flight at once (1 = strictly sequential)
    pub concurrency: usize,
    pub mismatch_policy: MismatchPolicy,
    /// Cancel the run after this many milliseconds
    pub run_timeout_ms: Option<u64>,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            viewports: VIEWPORTS.to_vec(),
            diff: DiffOptions::default(),
            concurrency: 1,
            mismatch_policy: MismatchPolicy::default(),
            run_timeout_ms: None,
        }
    }
}

impl CompareOptions {
    pub fn validate(&self) -> Result<()> {
        if self.viewports.is_empty() {
            return Err(Error::ConfigError("at least one viewport is required".into()));
        }
        let mut names = HashSet::new();
        for v in &self.viewports {
            if v.width == 0 || v.height == 0 {
                return Err(Error::ConfigError(format!("viewport '{}' has a zero dimension", v.name)));
            }
            if !names.insert(v.name) {
                return Err(Error::ConfigError(format!("duplicate viewport name '{}'", v.name)));
            }
        }
        if !(0.0..=1.0).contains(&self.diff.tolerance) {
            return Err(Error::InvalidTolerance(self.diff.tolerance));
        }
        if self.concurrency == 0 {
            return Err(Error::ConfigError("concurrency must be at least 1".into()));
        }
        if self.run_timeout_ms == Some(0) {
            return Err(Error::ConfigError("run_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// One comparison request, identified by a fresh random id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonRun {
    pub comparison_id: String,
    pub reference_url: String,
    pub test_url: String,
}

impl ComparisonRun {
    /// Validate the inputs and allocate a new comparison id.
    ///
    /// Only presence is checked here; malformed URLs surface later as
    /// navigation errors.
    pub fn new(reference_url: &str, test_url: &str) -> Result<Self> {
        let reference_url = reference_url.trim();
        let test_url = test_url.trim();
        if reference_url.is_empty() || test_url.is_empty() {
            return Err(Error::InvalidRequest(
                "Both referenceUrl and testUrl are required".into(),
            ));
        }
        Ok(Self {
            comparison_id: Uuid::new_v4().to_string(),
            reference_url: reference_url.to_string(),
            test_url: test_url.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePaths {
    pub reference: String,
    pub test: String,
    pub diff: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl From<&RasterImage> for Dimensions {
    fn from(img: &RasterImage) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
        }
    }
}

/// Sizes of the two captures when they disagreed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionMismatch {
    pub reference: Dimensions,
    pub test: Dimensions,
}

/// Outcome for one viewport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportResult {
    pub viewport: String,
    /// Share of differing pixels, two decimals
    pub diff_percentage: String,
    pub images: ImagePaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_mismatch: Option<DimensionMismatch>,
}

/// Everything a successful run produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonReport {
    pub comparison_id: String,
    pub results: Vec<ViewportResult>,
}

/// Runs comparisons against a renderer launcher and a result store
pub struct Orchestrator {
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn ResultStore>,
    options: CompareOptions,
}

impl Orchestrator {
    pub fn new(launcher: Arc<dyn Launcher>, store: Arc<dyn ResultStore>, options: CompareOptions) -> Self {
        Self {
            launcher,
            store,
            options,
        }
    }

    pub fn options(&self) -> &CompareOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Compare `reference_url` against `test_url` at every configured viewport.
    pub async fn run(&self, reference_url: &str, test_url: &str) -> Result<ComparisonReport> {
        self.run_with_cancel(reference_url, test_url, CancellationToken::new())
            .await
    }

    /// Like [`Orchestrator::run`], stopping early once `cancel` fires.
    ///
    /// Cancellation is observed between steps: an in-flight page load runs
    /// to completion (bounded by the navigation timeout) before the run
    /// unwinds, so nothing is written after the namespace is rolled back.
    ///
    /// The run executes on its own task. Dropping the returned future cancels
    /// it; the task still waits for in-flight captures, releases the renderer
    /// and removes the namespace.
    pub async fn run_with_cancel(
        &self,
        reference_url: &str,
        test_url: &str,
        cancel: CancellationToken,
    ) -> Result<ComparisonReport> {
        let run = ComparisonRun::new(reference_url, test_url)?;
        self.options.validate()?;

        let run_token = cancel.child_token();
        let guard = run_token.clone().drop_guard();
        let pipeline = Pipeline {
            launcher: Arc::clone(&self.launcher),
            store: Arc::clone(&self.store),
            options: self.options.clone(),
        };
        let outcome = tokio::spawn(pipeline.drive(run, run_token))
            .await
            .map_err(|e| Error::Other(format!("Comparison task failed: {}", e)));
        let _ = guard.disarm();
        outcome?
    }
}

/// Owned copy of an orchestrator's parts, moved onto the run's task
struct Pipeline {
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn ResultStore>,
    options: CompareOptions,
}

impl Pipeline {
    async fn drive(self, run: ComparisonRun, run_token: CancellationToken) -> Result<ComparisonReport> {
        let started = Instant::now();
        info!(
            "Comparison {} started: {} vs {}",
            run.comparison_id, run.reference_url, run.test_url
        );

        let store = Arc::clone(&self.store);
        let id = run.comparison_id.clone();
        blocking(move || store.create_namespace(&id)).await?;

        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = self.options.run_timeout_ms.map(|ms| {
            let token = run_token.clone();
            let flag = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        let outcome = self.execute(&run, &run_token).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        match outcome {
            Ok(results) => {
                info!(
                    "Comparison {} finished in {:?}: {}",
                    run.comparison_id,
                    started.elapsed(),
                    results
                        .iter()
                        .map(|r| format!("{}={}%", r.viewport, r.diff_percentage))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                Ok(ComparisonReport {
                    comparison_id: run.comparison_id,
                    results,
                })
            }
            Err(err) => {
                let err = match (err, self.options.run_timeout_ms) {
                    (Error::Cancelled, Some(ms)) if timed_out.load(Ordering::SeqCst) => Error::Timeout(ms),
                    (err, _) => err,
                };
                error!(
                    "Comparison {} failed ({} vs {}): {}",
                    run.comparison_id,
                    run.reference_url,
                    run.test_url,
                    err.describe()
                );
                let store = Arc::clone(&self.store);
                let id = run.comparison_id.clone();
                if let Err(e) = blocking(move || store.remove_namespace(&id)).await {
                    warn!("Failed to roll back comparison {}: {}", run.comparison_id, e);
                }
                Err(err)
            }
        }
    }

    async fn execute(&self, run: &ComparisonRun, token: &CancellationToken) -> Result<Vec<ViewportResult>> {
        checkpoint(token)?;
        let launcher = Arc::clone(&self.launcher);
        let session = blocking(move || RendererSession::launch(launcher.as_ref())).await?;
        let renderer = session.renderer();

        let concurrency = self.options.concurrency.clamp(1, self.options.viewports.len());
        let jobs = self.options.viewports.iter().copied().map(|viewport| {
            let job = ViewportJob {
                renderer: Arc::clone(&renderer),
                store: Arc::clone(&self.store),
                run: run.clone(),
                viewport,
                diff: self.options.diff.clone(),
                mismatch_policy: self.options.mismatch_policy,
                token: token.clone(),
            };
            async move {
                let name = viewport.name;
                let token = job.token.clone();
                let result = blocking(move || job.process()).await;
                if result.is_err() {
                    // Stop jobs that have not started yet.
                    token.cancel();
                }
                result.map_err(|e| e.in_viewport(name))
            }
        });

        // `buffered` yields in submission order, whatever order jobs finish in.
        let outcomes: Vec<Result<ViewportResult>> = stream::iter(jobs).buffered(concurrency).collect().await;

        drop(renderer);
        if let Err(e) = blocking(move || session.close()).await {
            warn!("Failed to release renderer for {}: {}", run.comparison_id, e);
        }

        first_error(outcomes)
    }
}

/// Collect results, preferring the first real failure over the
/// cancellations it caused in later jobs.
fn first_error(outcomes: Vec<Result<ViewportResult>>) -> Result<Vec<ViewportResult>> {
    let mut results = Vec::with_capacity(outcomes.len());
    let mut cancelled = None;
    for outcome in outcomes {
        match outcome {
            Ok(r) => results.push(r),
            Err(Error::Cancelled) => cancelled = Some(Error::Cancelled),
            Err(e) => return Err(e),
        }
    }
    match cancelled {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

fn checkpoint(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("Worker task failed: {}", e)))?
}

/// Bring both captures to one size according to `policy`.
fn reconcile(
    reference: RasterImage,
    test: RasterImage,
    policy: MismatchPolicy,
) -> Result<(RasterImage, RasterImage, Option<DimensionMismatch>)> {
    if reference.dimensions() == test.dimensions() {
        return Ok((reference, test, None));
    }
    let mismatch = DimensionMismatch {
        reference: Dimensions::from(&reference),
        test: Dimensions::from(&test),
    };
    match policy {
        MismatchPolicy::Fail => Err(Error::DimensionMismatch {
            reference_width: reference.width(),
            reference_height: reference.height(),
            test_width: test.width(),
            test_height: test.height(),
        }),
        MismatchPolicy::Pad => {
            let width = reference.width().max(test.width());
            let height = reference.height().max(test.height());
            Ok((
                reference.padded_to(width, height, PAD_COLOR)?,
                test.padded_to(width, height, PAD_COLOR)?,
                Some(mismatch),
            ))
        }
    }
}

/// Everything one viewport job needs, owned so it can move to a worker thread
struct ViewportJob {
    renderer: Arc<dyn Renderer>,
    store: Arc<dyn ResultStore>,
    run: ComparisonRun,
    viewport: ViewportConfig,
    diff: DiffOptions,
    mismatch_policy: MismatchPolicy,
    token: CancellationToken,
}

impl ViewportJob {
    fn process(self) -> Result<ViewportResult> {
        let name = self.viewport.name;
        let started = Instant::now();

        checkpoint(&self.token)?;
        let reference = self.renderer.capture(&self.run.reference_url, &self.viewport)?;
        checkpoint(&self.token)?;
        let test = self.renderer.capture(&self.run.test_url, &self.viewport)?;
        checkpoint(&self.token)?;

        let (reference, test, mismatch) = reconcile(reference, test, self.mismatch_policy)?;
        if let Some(m) = &mismatch {
            warn!(
                "Comparison {} [{}]: reference is {}x{}, test is {}x{}; padded to a common canvas",
                self.run.comparison_id, name, m.reference.width, m.reference.height, m.test.width, m.test.height
            );
        }

        let outcome = diff_with_options(&reference, &test, &self.diff)?;
        let diff_percentage = format_percentage(outcome.percentage());

        let reference_path = self.persist(ArtifactKind::Reference, &reference)?;
        let test_path = self.persist(ArtifactKind::Test, &test)?;
        let diff_path = self.persist(ArtifactKind::Diff, &outcome.diff_image)?;

        debug!(
            "Comparison {} [{}]: {} of {} pixels differ ({}%) in {:?}",
            self.run.comparison_id,
            name,
            outcome.diff_pixel_count,
            reference.width() as u64 * reference.height() as u64,
            diff_percentage,
            started.elapsed()
        );

        Ok(ViewportResult {
            viewport: name.to_string(),
            diff_percentage,
            images: ImagePaths {
                reference: reference_path,
                test: test_path,
                diff: diff_path,
            },
            dimension_mismatch: mismatch,
        })
    }

    fn persist(&self, kind: ArtifactKind, image: &RasterImage) -> Result<String> {
        let bytes = encode_png(image)?;
        checkpoint(&self.token)?;
        let key = ArtifactKey::new(&self.run.comparison_id, self.viewport.name, kind);
        self.store.write(&key, &bytes)
    }
}
