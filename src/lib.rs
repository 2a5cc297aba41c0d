#![forbid(unsafe_code)]

pub mod assemble;
pub mod atomic;
pub mod camera;
pub mod cleanup;
pub mod engine;
pub mod error;
pub mod frame;
pub mod hash;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod range;
pub mod scene;
pub mod settings;
pub mod supervisor;

pub use engine::{BlenderConfig, BlenderEngine, EngineRegistry, RenderEngine};
pub use error::{KilnError, KilnResult};
pub use manifest::Manifest;
pub use paths::JobPaths;
pub use pipeline::{
    Phase, PipelineConfig, ProductionRenderPipeline, RenderMetadata, RenderResult,
    render_video_production,
};
pub use settings::{RenderSettings, Resolution};
pub use supervisor::{CancelFlag, CommandSpec, ProcessSupervisor};
