use thiserror::Error;

/// Result alias used across payler.
pub type Result<T> = std::result::Result<T, PaylerError>;

#[derive(Error, Debug)]
pub enum PaylerError {
    /// The backend rejected one-time preparation (index, stream, table).
    ///
    /// Fatal: the owning workflow aborts before it starts consuming.
    #[error("setup failed: {0:#}")]
    Setup(#[source] anyhow::Error),

    /// Malformed payload, message or document, or a route nobody listens on.
    ///
    /// Recoverable. The broker loop acknowledges and drops the message, the
    /// store loop keeps the document for the next pass.
    #[error("could not process payload: {0}")]
    Processing(String),

    /// `listen` was called on a driver that was never configured.
    #[error("driver {0} must be configured before listening")]
    NotConfigured(String),

    /// `configure` was called twice on the same driver.
    #[error("driver {0} is already configured")]
    AlreadyConfigured(String),

    /// A workflow names a callable the registry does not know.
    #[error("could not resolve workflow callable {0:?}")]
    Resolution(String),

    /// Connectivity or transient backend failure.
    ///
    /// Terminates the workflow that hit it; other workflows keep running.
    #[error("backend failure: {0:#}")]
    Backend(#[source] anyhow::Error),
}

impl PaylerError {
    pub fn processing(reason: impl Into<String>) -> Self {
        PaylerError::Processing(reason.into())
    }

    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        PaylerError::Backend(err.into())
    }

    pub fn setup(err: impl Into<anyhow::Error>) -> Self {
        PaylerError::Setup(err.into())
    }

    /// Whether a listen loop may swallow this error and carry on.
    ///
    /// Only malformed input is recoverable; everything else ends the loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PaylerError::Processing(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PaylerError {
    fn from(err: sqlx::Error) -> Self {
        PaylerError::Backend(err.into())
    }
}

impl From<prometheus::Error> for PaylerError {
    fn from(err: prometheus::Error) -> Self {
        PaylerError::Setup(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_processing_errors_are_recoverable() {
        assert!(PaylerError::processing("bad header").is_recoverable());
        assert!(!PaylerError::NotConfigured("broker".into()).is_recoverable());
        assert!(!PaylerError::Resolution("client.nope".into()).is_recoverable());
        assert!(
            !PaylerError::backend(anyhow::anyhow!("connection reset"))
                .is_recoverable()
        );
        assert!(
            !PaylerError::setup(anyhow::anyhow!("index rejected"))
                .is_recoverable()
        );
    }

    #[test]
    fn backend_display_includes_context_chain() {
        let err = PaylerError::backend(
            anyhow::anyhow!("connection reset").context("deleting document"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("deleting document"));
        assert!(rendered.contains("connection reset"));
    }
}
