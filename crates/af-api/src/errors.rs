use af_core::BuildError;
use af_dispatch::DispatchError;
use af_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("tracing failed: {0}")]
    Trace(#[from] BuildError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("guards still fail after recompiling: {0}")]
    StaleAfterRecompile(RuntimeError),
}

impl ApiError {
    #[must_use]
    pub fn is_guard_violation(&self) -> bool {
        match self {
            Self::Runtime(err) | Self::StaleAfterRecompile(err) => err.is_guard_violation(),
            _ => false,
        }
    }
}
