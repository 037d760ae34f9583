//! Error taxonomy shared across the mining core.
//!
//! Each variant corresponds to one row of the error-handling table: kinds
//! that are retried internally are represented too, so that call sites which
//! *do* need to see them (e.g. the device-code loop reacting to
//! `RequestInvalid`) can match on a concrete variant instead of string
//! sniffing an `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MinerError {
    /// The scheduler has entered EXIT; long-running loops should unwind
    /// silently rather than logging this as a failure.
    #[error("exit requested")]
    ExitRequested,

    /// Raised by the HTTP layer when a caller-supplied `invalidate_after`
    /// deadline would be crossed by the next retry attempt.
    #[error("request invalid: deadline {0} would be exceeded")]
    RequestInvalid(String),

    /// Connect/read/timeout/5xx — retried with backoff until capped.
    #[error("transient transport error: {0}")]
    TransportTransient(String),

    /// TLS certificate verification failure. Never retried.
    #[error("TLS failure: {0}")]
    TlsFailure(String),

    /// `service error`, `PersistedQueryNotFound`, `service timeout`,
    /// `service unavailable`, `context deadline exceeded`.
    #[error("GQL transient error: {0}")]
    GqlTransient(String),

    /// Any other `errors[]` entry, or a top-level `error`+`message` pair.
    #[error("GQL error: {0}")]
    GqlFatal(String),

    /// The websocket connection was closed by the server.
    #[error("websocket closed by server")]
    WebsocketClosed,

    /// No PONG arrived within the deadline after a PING.
    #[error("websocket pong missing")]
    WebsocketPongMissing,

    /// Legacy-login captcha challenge. Fatal, exit code 1.
    #[error("captcha required")]
    CaptchaRequired,

    /// The websocket pool cannot hold any more topics even after opening a
    /// new connection (programmer error — channel/topic bookkeeping is
    /// supposed to prevent this).
    #[error("maximum websocket topics exceeded")]
    MaxTopicsExceeded,

    /// A critical task (watch loop, websocket handler, maintenance) died
    /// unexpectedly; wraps the error that killed it.
    #[error("critical task exited: {0}")]
    CriticalTaskExited(Box<MinerError>),

    #[error("settings error: {0}")]
    Settings(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MinerError {
    /// Exit code this error should produce if it escapes `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            MinerError::ExitRequested => 0,
            MinerError::Settings(_) => 4,
            _ => 1,
        }
    }
}
