#![forbid(unsafe_code)]

pub mod batch;
pub mod error;
pub mod fetch;
pub mod model;
pub mod raster;
pub mod region;
pub mod resolve;
pub mod scheduler;
pub mod session;
pub mod text;

pub use batch::{
    BatchOptions, BatchRecord, BatchReport, BatchSummary, FieldMap, RecordOutcome, RecordResult,
    RecordStage, read_records, run_batch, sanitize_label,
};
pub use error::{LabelkitError, LabelkitResult};
pub use fetch::{FetchedResource, ImageFetcher, LocalBoxFuture, SystemFetcher};
pub use model::{BoxPx, RegionDef, RegionKind, TemplateDef, TemplateSet};
pub use raster::{PNG_SIGNATURE, RenderOptions, RenderedArtifact, rasterize};
pub use region::{Composite, Region, RegionPayload, ResolvedImage};
pub use scheduler::{ChangeScheduler, ReadySignal};
pub use session::{Session, SessionConfig, Update};
