/// Failures the streaming pipeline distinguishes.
///
/// Only `UpstreamStream` ends a request with `end{ok:false}` after an `error`
/// frame. `PayloadParse` and `Extraction` are recovered where they happen and
/// never cross the relay channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// The generation call failed, was rejected, or was interrupted.
    #[error("upstream stream error: {0}")]
    UpstreamStream(String),
    /// The accumulated tool payload did not parse at block end.
    #[error("payload parse error: {0}")]
    PayloadParse(String),
    /// One extraction pass hit a structural problem in the partial buffer.
    #[error("extraction error: {0}")]
    Extraction(String),
    /// The relay channel closed without a terminal sentinel.
    #[error("relay channel closed before a terminal event")]
    ChannelClosedPrematurely,
    /// The inbound request was rejected before streaming started.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session store error: {0}")]
    SessionStore(String),
    #[error("config error: {0}")]
    Config(String),
}

impl PipelineError {
    pub(crate) fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamStream(message.into())
    }

    pub(crate) fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction(message.into())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
