use std::{fmt, io, path::PathBuf, time::Duration};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io issue encountered: {0}")]
    Io(#[from] io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url parse failed: {0}")]
    Url(#[from] url::ParseError),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config parse failed: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("xz stream setup failed: {0}")]
    Xz(#[from] xz2::stream::Error),
    #[error("failed to join async task: {0}")]
    AsyncJoinError(#[from] tokio::task::JoinError),
    #[error("malformed spec file {path}, missing props {missing:?}")]
    MalformedSpec { path: PathBuf, missing: Vec<String> },
    #[error("spec file {path} sets '{key}', which is recorded by the build")]
    ReservedProperty { path: PathBuf, key: String },
    #[error("spec file {0} has no usable file name")]
    SpecNameMissing(PathBuf),
    #[error("spec {0} has no base property")]
    BaseMissing(String),
    #[error(
        "base '{0}' should be in the form of <image_type>:<base_image>, where <image_type> is one of libguestfs,layer,simple"
    )]
    InvalidBaseReference(String),
    #[error("unsupported image type '{0}', select one of libguestfs,layer,simple")]
    UnsupportedImageType(String),
    #[error("property '{0}' was already recorded for this build")]
    PropertyAlreadySet(&'static str),
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),
    #[error("circular dependencies found:\n{}", format_edges(.0))]
    CircularDependency(Vec<(String, String)>),
    #[error("unresolved external dependencies found:\n{}", format_edges(.0))]
    UnresolvedDependency(Vec<(String, String)>),
    #[error("image {0} must be built first")]
    ImageNotBuilt(String),
    #[error("image {0} must be compressed first")]
    ImageNotCompressed(String),
    #[error("image {0} was already finalized")]
    ImageFinalized(String),
    #[error("build produced no artifact at {0}")]
    ArtifactMissing(PathBuf),
    #[error("{tool} failed with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },
    #[error("{tool} timed out after {timeout:?}")]
    ToolTimeout { tool: String, timeout: Duration },
    #[error("download of {url} failed: status {status}")]
    DownloadFailed { url: String, status: u16 },
    #[error("dependency {0} failed to build")]
    DependencyFailed(String),
    #[error("failed to build {image} during {stage}: {source}")]
    Build {
        image: String,
        stage: BuildStage,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Acquire,
    Transform,
    Verify,
    Hash,
    Compress,
    Metadata,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStage::Acquire => "acquire",
            BuildStage::Transform => "transform",
            BuildStage::Verify => "verify",
            BuildStage::Hash => "hash",
            BuildStage::Compress => "compress",
            BuildStage::Metadata => "metadata",
        })
    }
}

impl Error {
    pub fn at(self, image: &str, stage: BuildStage) -> Error {
        match self {
            Error::Build { .. } => self,
            other => Error::Build {
                image: image.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            Error::Build { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub fn format_edges(edges: &[(String, String)]) -> String {
    edges
        .iter()
        .map(|(name, dependency)| format!("{} -> {}", name, dependency))
        .collect::<Vec<_>>()
        .join("\n")
}
