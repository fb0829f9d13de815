//! Engine errors.

use armada_jit::{JitError, MarshalError};

/// Error type trace subscribers may return.
pub type TraceError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`Translator::execute`](crate::Translator::execute).
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Decoding, building or compiling a subroutine failed.
    #[error("translation of {address:#x} failed: {source}")]
    Translate {
        /// Guest address being translated.
        address: u64,
        /// Underlying failure.
        #[source]
        source: JitError,
    },

    /// A trace subscriber failed; the dispatch loop stops.
    #[error("trace subscriber failed at {address:#x}: {source}")]
    Trace {
        /// Guest address about to be dispatched.
        address: u64,
        /// Subscriber failure.
        #[source]
        source: TraceError,
    },

    /// A typed guest call could not be laid out.
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

impl ExecError {
    pub(crate) fn translate(address: u64) -> impl FnOnce(JitError) -> Self {
        move |source| Self::Translate { address, source }
    }
}
