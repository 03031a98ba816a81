// THEORY:
// This file is the main entry point for the `panostitch` library crate. It exposes
// the `RequestCoordinator` and its data structures (`StitchConfig`, `Delivery`,
// `StitchResult`, etc.) as the high-level interface for turning a set of overlapping
// photographs into one panorama or one flattened scan.
//
// The building blocks live in `core_modules`: decoding (`frame`), the unsharp-mask
// preprocessor (`sharpen`), request-scoped temporary storage (`workspace`) and the
// stitching capability with its bundled implementation (`engine`). `pipeline` chains
// them for one request; `coordinator` schedules requests and delivers their outcomes.

pub mod config;
pub mod coordinator;
pub mod core_modules;
pub mod error;
pub mod logging;
pub mod pipeline;

pub use config::{ConfigError, EngineConfig, ResultFormat, SharpenConfig, StitchConfig};
pub use coordinator::{
    CoordinatorDisposed, CoordinatorState, Delivery, RequestCoordinator, ResultStream,
};
pub use core_modules::engine::{
    EngineStatus, StitchEngine, StitchMode, StitchingEngineAdapter, TranslationEngine,
};
pub use core_modules::frame::Frame;
pub use core_modules::sharpen::Sharpener;
pub use core_modules::workspace::{ImageRef, Workspace, WorkspaceManager};
pub use error::{EngineErrorCode, ErrorKind, StitchError, StitchResult};
pub use pipeline::{CancelFlag, RequestId, StitchPipeline, StitchRequest};
