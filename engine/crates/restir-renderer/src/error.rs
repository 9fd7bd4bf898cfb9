use std::path::PathBuf;

use restir_gfx::error::GfxError;
use restir_scene::light::extractor::LightExtractionError;

/// 帧管线和渲染器的错误
///
/// 同步错误不在这里：它们由 `ResourceStateTracker` 直接 panic。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("frame pipeline is used before it is configured")]
    NotConfigured,

    #[error("stage `{stage}` is missing input `{input}`")]
    MissingStageInput { stage: String, input: String },

    #[error("stage `{stage}` lists output `{output}` but does not provide an image for it")]
    MissingStageOutput { stage: String, output: String },

    #[error("stage `{stage}` does not report the state of output `{output}`")]
    MissingOutputState { stage: String, output: String },

    #[error("unknown output `{0}`")]
    UnknownOutput(String),

    #[error("no output is available for display")]
    NoActiveOutput,

    #[error("stage `{stage}` failed to {action}")]
    Stage {
        stage: String,
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Gfx(#[from] GfxError),

    #[error(transparent)]
    LightExtraction(#[from] LightExtractionError),

    #[error("failed to parse renderer config")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to read renderer config `{path}`")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub(crate) fn stage(stage: &str, action: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        let stage = stage.to_string();
        move |source| Self::Stage { stage, action, source }
    }
}
