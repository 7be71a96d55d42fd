/// Failures of the inference backend, per the two-kind taxonomy the relay
/// surfaces to clients. Both arrive as a terminal chunk inside the stream,
/// never as a hard error from the call that opened it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    /// Connection could not be established, the backend answered with a
    /// non-success status, or the stream died mid-flight.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// A stream line could not be parsed as the expected event shape.
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "backend_unreachable",
            Self::Protocol(_) => "backend_protocol_error",
        }
    }
}
