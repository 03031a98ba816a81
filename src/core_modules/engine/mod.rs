// THEORY:
// The `engine` module is the seam between the orchestration layer and whatever
// actually assembles the panorama. The assembling algorithm is a capability behind the
// `StitchEngine` trait: it receives normalized three-channel images and a mode, and it
// answers with a composite or with one of its own native integer status codes.
//
// The `StitchingEngineAdapter` is thin. It calls the engine exactly once,
// translates the native status into the closed `EngineErrorCode` set, and on success
// writes the composite into the workspace's result slot. It never retries: a stitch
// that failed for lack of overlap fails the same way every time.

pub mod translation;

use crate::core_modules::frame;
use crate::core_modules::workspace::Workspace;
use crate::error::{EngineErrorCode, StitchError};
use image::RgbImage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

pub use translation::TranslationEngine;

/// How the engine should model the relationship between the photographs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StitchMode {
    /// Rotating camera over a 3D scene; tolerates viewpoint change.
    #[default]
    Panorama,
    /// Near-planar subject such as paper documents; simpler planar alignment.
    Scans,
}

impl fmt::Display for StitchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StitchMode::Panorama => f.write_str("panorama"),
            StitchMode::Scans => f.write_str("scans"),
        }
    }
}

impl FromStr for StitchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "panorama" | "pano" => Ok(StitchMode::Panorama),
            "scans" | "scan" => Ok(StitchMode::Scans),
            other => Err(format!("unknown stitch mode '{other}', expected panorama or scans")),
        }
    }
}

/// An engine's native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineStatus(pub i32);

impl EngineStatus {
    pub const OK: EngineStatus = EngineStatus(0);
    pub const ERR_NEED_MORE_IMGS: EngineStatus = EngineStatus(1);
    pub const ERR_HOMOGRAPHY_EST_FAIL: EngineStatus = EngineStatus(2);
    pub const ERR_CAMERA_PARAMS_ADJUST_FAIL: EngineStatus = EngineStatus(3);

    /// Translates a failure status into the closed error set.
    pub fn error_code(&self) -> EngineErrorCode {
        match *self {
            EngineStatus::ERR_NEED_MORE_IMGS => EngineErrorCode::NeedMoreImages,
            EngineStatus::ERR_HOMOGRAPHY_EST_FAIL => EngineErrorCode::HomographyEstimationFailed,
            EngineStatus::ERR_CAMERA_PARAMS_ADJUST_FAIL => {
                EngineErrorCode::CameraParamsAdjustFailed
            }
            _ => EngineErrorCode::Unknown,
        }
    }
}

/// The stitching capability.
///
/// Implementations may be a bundled algorithm such as [`TranslationEngine`] or a
/// binding to a native library. Calls are synchronous and may take a long time;
/// they are only ever made from background threads.
pub trait StitchEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str {
        "engine"
    }

    fn stitch(&self, images: &[RgbImage], mode: StitchMode) -> Result<RgbImage, EngineStatus>;
}

/// Invokes a `StitchEngine` and classifies its outcome.
#[derive(Clone)]
pub struct StitchingEngineAdapter {
    engine: Arc<dyn StitchEngine>,
}

impl StitchingEngineAdapter {
    pub fn new(engine: Arc<dyn StitchEngine>) -> Self {
        Self { engine }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Runs the engine once and, on success, writes the composite into the
    /// workspace's result slot and returns its location.
    pub fn stitch(
        &self,
        images: &[RgbImage],
        mode: StitchMode,
        workspace: &Workspace,
    ) -> Result<PathBuf, StitchError> {
        let start = Instant::now();
        let outcome = self.engine.stitch(images, mode);
        debug!(
            duration = &*format!("{:?}", start.elapsed());
            "Engine '{}' finished {} images in {} mode",
            self.engine.name(),
            images.len(),
            mode
        );

        let composite = match outcome {
            Ok(composite) if composite.width() > 0 && composite.height() > 0 => composite,
            Ok(_) => {
                warn!("Engine '{}' reported success with an empty composite", self.engine.name());
                return Err(StitchError::Engine {
                    code: EngineErrorCode::Unknown,
                    native_status: EngineStatus::OK.0,
                });
            }
            Err(status) => {
                return Err(StitchError::Engine {
                    code: status.error_code(),
                    native_status: status.0,
                });
            }
        };

        let location = workspace.create_result_slot()?;
        let format = workspace.result_format().image_format();
        if let Err(error) = frame::encode(&composite, &location, format) {
            // A half-written result is worse than none.
            let _ = std::fs::remove_file(&location);
            return Err(error);
        }
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StitchConfig;
    use crate::core_modules::workspace::WorkspaceManager;
    use crate::error::ErrorKind;
    use image::Rgb;

    struct FixedEngine(Result<RgbImage, EngineStatus>);

    impl StitchEngine for FixedEngine {
        fn stitch(&self, _: &[RgbImage], _: StitchMode) -> Result<RgbImage, EngineStatus> {
            self.0.clone()
        }
    }

    fn run(
        outcome: Result<RgbImage, EngineStatus>,
    ) -> (Result<PathBuf, StitchError>, WorkspaceManager, tempfile::TempDir) {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(&StitchConfig::with_workspace_root(root.path()));
        let workspace = manager.create(1).expect("workspace");
        let adapter = StitchingEngineAdapter::new(Arc::new(FixedEngine(outcome)));
        let images = vec![RgbImage::new(4, 4), RgbImage::new(4, 4)];
        let result = adapter.stitch(&images, StitchMode::Panorama, &workspace);
        workspace.cleanup().expect("cleanup");
        (result, manager, root)
    }

    #[test]
    fn known_statuses_translate_one_to_one() {
        assert_eq!(EngineStatus(1).error_code(), EngineErrorCode::NeedMoreImages);
        assert_eq!(EngineStatus(2).error_code(), EngineErrorCode::HomographyEstimationFailed);
        assert_eq!(EngineStatus(3).error_code(), EngineErrorCode::CameraParamsAdjustFailed);
    }

    #[test]
    fn unrecognised_statuses_become_unknown() {
        assert_eq!(EngineStatus(-42).error_code(), EngineErrorCode::Unknown);
        assert_eq!(EngineStatus(17).error_code(), EngineErrorCode::Unknown);

        let (result, _, _root) = run(Err(EngineStatus(99)));
        match result.expect_err("must fail") {
            StitchError::Engine { code, native_status } => {
                assert_eq!(code, EngineErrorCode::Unknown);
                assert_eq!(native_status, 99);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn success_is_encoded_into_the_result_slot() {
        let composite = RgbImage::from_pixel(12, 5, Rgb([10, 200, 30]));
        let (result, manager, _root) = run(Ok(composite));

        let location = result.expect("success");
        assert!(location.starts_with(manager.result_dir()));
        let decoded = image::open(&location).expect("decodable result");
        assert_eq!((decoded.width(), decoded.height()), (12, 5));
        assert!(manager.leftover_entries().is_empty());
    }

    #[test]
    fn empty_composite_is_an_unknown_engine_failure() {
        let (result, _, _root) = run(Ok(RgbImage::new(0, 0)));
        assert_eq!(
            result.expect_err("must fail").kind(),
            ErrorKind::Engine(EngineErrorCode::Unknown)
        );
    }

    #[test]
    fn modes_parse_from_user_input() {
        assert_eq!("Panorama".parse::<StitchMode>(), Ok(StitchMode::Panorama));
        assert_eq!("scan".parse::<StitchMode>(), Ok(StitchMode::Scans));
        assert_eq!("SCANS".parse::<StitchMode>(), Ok(StitchMode::Scans));
        assert!("cylindrical".parse::<StitchMode>().is_err());
        assert_eq!(StitchMode::default(), StitchMode::Panorama);
    }
}
