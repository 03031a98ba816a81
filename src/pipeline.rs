// THEORY:
// The `StitchPipeline` runs one request from start to finish on the calling thread.
// It is the synchronous body that the coordinator hands to a background thread, and
// it owns the fixed stage order: resolve -> decode -> sharpen -> stitch -> cleanup.
//
// Key architectural principles:
// 1.  **Guaranteed Release**: The workspace is acquired first and released last, on
//     every exit path. A classified error, a cancellation and a panic all end with the
//     request's temporary directory gone before this function returns.
// 2.  **Cooperative Cancellation**: A superseded request cannot interrupt an engine
//     call that is already running, but it checks its `CancelFlag` at every stage
//     boundary so that it stops as early as it safely can.
// 3.  **Bounded Parallelism**: Decoding and sharpening fan out over a dedicated rayon
//     pool of fixed size. Results are collected in input order.

use crate::config::StitchConfig;
use crate::core_modules::engine::{StitchEngine, StitchMode, StitchingEngineAdapter};
use crate::core_modules::frame::{self, Frame};
use crate::core_modules::sharpen::Sharpener;
use crate::core_modules::workspace::{ImageRef, Workspace, WorkspaceManager};
use crate::error::StitchError;
use image::RgbImage;
use log::{debug, error, warn};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Identifies a request for its whole lifetime. Assigned in increasing order.
pub type RequestId = u64;

/// One stitch job: an ordered list of image references plus a mode.
#[derive(Debug, Clone)]
pub struct StitchRequest {
    pub id: RequestId,
    pub images: Vec<ImageRef>,
    pub mode: StitchMode,
}

/// Shared flag telling a running request it has been superseded.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, request_id: RequestId, stage: &str) -> Result<(), StitchError> {
        if self.is_cancelled() {
            debug!("Request {request_id} cancelled before {stage}");
            return Err(StitchError::Superseded);
        }
        Ok(())
    }
}

pub struct StitchPipeline {
    workspaces: WorkspaceManager,
    sharpener: Sharpener,
    pool: rayon::ThreadPool,
    adapter: StitchingEngineAdapter,
}

impl StitchPipeline {
    pub fn new(config: &StitchConfig, engine: Arc<dyn StitchEngine>) -> Result<Self, StitchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.preprocess_threads)
            .thread_name(|index| format!("panostitch-preprocess-{index}"))
            .build()
            .map_err(|e| {
                StitchError::unexpected(format!("failed to start preprocessing pool: {e}"))
            })?;

        Ok(Self {
            workspaces: WorkspaceManager::new(config),
            sharpener: Sharpener::new(config.sharpen.clone()),
            pool,
            adapter: StitchingEngineAdapter::new(engine),
        })
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Runs every stage of `request`. Never panics: a panic in any stage comes back as
    /// `StitchError::Unexpected` after the workspace has been released.
    pub fn run(
        &self,
        request: &StitchRequest,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, StitchError> {
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(request, cancel)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!("Request {} panicked: {message}", request.id);
                Err(StitchError::unexpected(message))
            });

        debug!(
            duration = &*format!("{:?}", start.elapsed());
            "Request {} finished ({})",
            request.id,
            if outcome.is_ok() { "success" } else { "failure" }
        );
        outcome
    }

    fn execute(
        &self,
        request: &StitchRequest,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, StitchError> {
        let mut workspace = self.workspaces.create(request.id)?;
        let outcome = match self.process(&mut workspace, request, cancel) {
            Ok(location) if cancel.is_cancelled() => {
                debug!("Request {} superseded during stitching", request.id);
                let _ = std::fs::remove_file(&location);
                Err(StitchError::Superseded)
            }
            outcome => outcome,
        };

        match (outcome, workspace.cleanup()) {
            (outcome, Ok(())) => outcome,
            (Err(error), Err(cleanup_error)) => {
                warn!("Request {}: {}", request.id, cleanup_error.message());
                Err(error)
            }
            (Ok(location), Err(cleanup_error)) => {
                warn!("Request {} succeeded but left temporary files behind", request.id);
                let _ = std::fs::remove_file(&location);
                Err(cleanup_error)
            }
        }
    }

    fn process(
        &self,
        workspace: &mut Workspace,
        request: &StitchRequest,
        cancel: &CancelFlag,
    ) -> Result<PathBuf, StitchError> {
        let id = request.id;

        let start = Instant::now();
        let inputs = workspace.resolve(&request.images)?;
        debug!(
            duration = &*format!("{:?}", start.elapsed());
            "Request {id}: resolved {} inputs", inputs.len()
        );

        cancel.check(id, "decode")?;
        let start = Instant::now();
        let frames: Vec<Frame> = self.pool.install(|| {
            inputs
                .par_iter()
                .map(|input| frame::decode(&input.path, &input.reference))
                .collect::<Result<Vec<Frame>, StitchError>>()
        })?;
        debug!(
            duration = &*format!("{:?}", start.elapsed());
            "Request {id}: decoded {} frames", frames.len()
        );

        cancel.check(id, "sharpen")?;
        let start = Instant::now();
        let images: Vec<RgbImage> = self.pool.install(|| {
            frames
                .into_par_iter()
                .map(|frame| self.sharpener.sharpen(frame))
                .collect()
        });
        debug!(
            duration = &*format!("{:?}", start.elapsed());
            "Request {id}: sharpened {} images", images.len()
        );

        cancel.check(id, "stitch")?;
        self.adapter.stitch(&images, request.mode, workspace)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stitching panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::engine::EngineStatus;
    use crate::error::{EngineErrorCode, ErrorKind};
    use image::{GrayImage, Luma, Rgb};
    use std::path::Path;
    use std::sync::Mutex;

    /// Records what it was given and returns a fixed outcome.
    #[derive(Default)]
    struct RecordingEngine {
        seen: Mutex<Vec<RgbImage>>,
        status: Option<EngineStatus>,
    }

    impl StitchEngine for RecordingEngine {
        fn stitch(&self, images: &[RgbImage], _: StitchMode) -> Result<RgbImage, EngineStatus> {
            self.seen.lock().unwrap().extend_from_slice(images);
            match self.status {
                Some(status) => Err(status),
                None => Ok(RgbImage::from_pixel(20, 10, Rgb([1, 2, 3]))),
            }
        }
    }

    struct PanickingEngine;

    impl StitchEngine for PanickingEngine {
        fn stitch(&self, _: &[RgbImage], _: StitchMode) -> Result<RgbImage, EngineStatus> {
            panic!("engine blew up");
        }
    }

    fn pipeline(root: &Path, engine: Arc<dyn StitchEngine>) -> StitchPipeline {
        let mut config = StitchConfig::with_workspace_root(root);
        config.preprocess_threads = 2;
        StitchPipeline::new(&config, engine).expect("pipeline")
    }

    fn write_gray(dir: &Path, name: &str, width: u32, value: u8) -> ImageRef {
        let path = dir.join(name);
        GrayImage::from_pixel(width, 6, Luma([value]))
            .save_with_format(&path, image::ImageFormat::Png)
            .expect("write input");
        ImageRef::from(path)
    }

    fn request(images: Vec<ImageRef>) -> StitchRequest {
        StitchRequest {
            id: 1,
            images,
            mode: StitchMode::Scans,
        }
    }

    #[test]
    fn engine_sees_sharpened_rgb_images_in_input_order() {
        let root = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(RecordingEngine::default());
        let pipeline = pipeline(root.path(), engine.clone());
        let images = vec![
            write_gray(root.path(), "a.png", 5, 50),
            write_gray(root.path(), "b.png", 7, 100),
            write_gray(root.path(), "c.png", 9, 10),
        ];

        let location = pipeline
            .run(&request(images), &CancelFlag::new())
            .expect("success");
        assert!(location.exists());

        let seen = engine.seen.lock().unwrap();
        let widths: Vec<u32> = seen.iter().map(|i| i.width()).collect();
        assert_eq!(widths, vec![5, 7, 9]);
        assert_eq!(seen[0].get_pixel(2, 2), &Rgb([90, 90, 90]));
        assert_eq!(seen[1].get_pixel(2, 2), &Rgb([180, 180, 180]));
        assert!(pipeline.workspaces().leftover_entries().is_empty());
    }

    #[test]
    fn engine_failures_still_release_the_workspace() {
        let root = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(RecordingEngine {
            status: Some(EngineStatus::ERR_HOMOGRAPHY_EST_FAIL),
            ..RecordingEngine::default()
        });
        let pipeline = pipeline(root.path(), engine);

        let error = pipeline
            .run(
                &request(vec![write_gray(root.path(), "a.png", 5, 50)]),
                &CancelFlag::new(),
            )
            .expect_err("must fail");
        assert_eq!(
            error.kind(),
            ErrorKind::Engine(EngineErrorCode::HomographyEstimationFailed)
        );
        assert!(pipeline.workspaces().leftover_entries().is_empty());
    }

    #[test]
    fn undecodable_input_is_reported_by_name() {
        let root = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(RecordingEngine::default());
        let pipeline = pipeline(root.path(), engine.clone());
        let images = vec![
            write_gray(root.path(), "a.png", 5, 50),
            ImageRef::memory("broken-upload", b"not an image".to_vec()),
        ];

        let error = pipeline
            .run(&request(images), &CancelFlag::new())
            .expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Decode);
        assert!(error.message().contains("broken-upload"));
        assert!(engine.seen.lock().unwrap().is_empty());
        assert!(pipeline.workspaces().leftover_entries().is_empty());
    }

    #[test]
    fn cancelled_requests_never_reach_the_engine() {
        let root = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(RecordingEngine::default());
        let pipeline = pipeline(root.path(), engine.clone());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let error = pipeline
            .run(
                &request(vec![write_gray(root.path(), "a.png", 5, 50)]),
                &cancel,
            )
            .expect_err("must stop");
        assert!(matches!(error, StitchError::Superseded));
        assert!(engine.seen.lock().unwrap().is_empty());
        assert!(pipeline.workspaces().leftover_entries().is_empty());
    }

    #[test]
    fn panics_become_unexpected_failures() {
        let root = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(root.path(), Arc::new(PanickingEngine));

        let error = pipeline
            .run(
                &request(vec![write_gray(root.path(), "a.png", 5, 50)]),
                &CancelFlag::new(),
            )
            .expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Unexpected);
        assert_eq!(error.message(), "engine blew up");
        assert!(pipeline.workspaces().leftover_entries().is_empty());
    }

    #[test]
    fn zero_images_are_left_to_the_engine() {
        let root = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(RecordingEngine {
            status: Some(EngineStatus::ERR_NEED_MORE_IMGS),
            ..RecordingEngine::default()
        });
        let pipeline = pipeline(root.path(), engine);

        let error = pipeline
            .run(&request(Vec::new()), &CancelFlag::new())
            .expect_err("must fail");
        assert_eq!(error.to_string(), "Can't stitch images: ERR_NEED_MORE_IMGS");
    }
}
