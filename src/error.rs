use crate::aeg::EdgeKind;
use thiserror::Error;

/// Fatal analysis errors. Anything that should abort processing of the
/// current module surfaces as one of these.
#[derive(Debug, Error)]
pub enum SpecterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Skip(#[from] Skip),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed module: {0}")]
    Module(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("worker for transmitter {0} failed twice: {1}")]
    WorkerFailed(u32, String),
}

/// Recoverable per-function conditions. The driver logs these and moves on
/// to the next function; none of them is swallowed silently.
#[derive(Debug, Error)]
pub enum Skip {
    #[error("function has no candidate {0} edges")]
    NoCandidateEdges(EdgeKind),
    #[error("base event-graph constraints are unsatisfiable")]
    BaseUnsat,
    #[error("function '{0}' was already analyzed")]
    AlreadyAnalyzed(String),
}

/// Problems with the configuration surface. Checked before any analysis
/// starts; a failure here aborts the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing leakage class option (--spectre-v1 or --spectre-v4)")]
    MissingLeakageClass,
    #[error("spectre-v4 requires stb-size >= 1, got {0}")]
    BadStbSize(u32),
    #[error("invalid value for {option}: {message}")]
    BadValue {
        option: &'static str,
        message: String,
    },
}

pub type Result<T, E = SpecterError> = std::result::Result<T, E>;
