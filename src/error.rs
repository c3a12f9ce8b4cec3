use thiserror::Error;

/// Closed taxonomy of result codes returned by every fallible cache-manager
/// and data-dist operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    Failed,
    ParamInvalid,
    WaitProcessTimeout,
    KvCacheNotExist,
    RepeatRequest,
    RequestAlreadyCompleted,
    EngineFinalized,
    NotYetLink,
    AlreadyLink,
    LinkFailed,
    UnlinkFailed,
    NotifyPromptUnlinkFailed,
    ClusterNumExceedLimit,
    ProcessingLink,
    DeviceOutOfMemory,
    PrefixAlreadyExist,
    PrefixNotExist,
    SeqLenOverLimit,
    NoFreeBlock,
    BlocksOutOfMemory,
    ExistLink,
    FeatureNotEnabled,
    Timeout,
    LinkBusy,
    OutOfMemory,
    DeviceMemError,
    SuspectRemoteError,
    SyncLayerFailed,
    UnknownError,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

#[derive(Error, Debug, Clone)]
#[error("{status:?}: {message}")]
pub struct EngineError {
    pub status: StatusCode,
    pub message: String,
}

impl EngineError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn param_invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ParamInvalid, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Logs and raises a `ParamInvalid` (or given status) error if `pred` is false,
/// mirroring the validate-then-raise pattern used throughout the façade layer.
pub fn raise_if_false(pred: bool, status: StatusCode, message: impl Into<String>) -> Result<()> {
    if !pred {
        let message = message.into();
        tracing::error!("{message}");
        return Err(EngineError::new(status, message));
    }
    Ok(())
}

pub fn raise_if_true(pred: bool, status: StatusCode, message: impl Into<String>) -> Result<()> {
    raise_if_false(!pred, status, message)
}
