use std::path::PathBuf;

use thiserror::Error;

/// Error type for portal, probe and credential-store operations.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connectivity ────────────────────────────────────────────────
    /// Transport failure or timeout talking to an HTTP endpoint.
    #[error("{endpoint} unreachable: {source}")]
    Connectivity {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// A system tool could not be started or did not finish.
    #[error("failed to run {program}: {source}")]
    Subprocess {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// An OS network API returned an error code.
    #[error("{call} failed with code {code}")]
    Os { call: &'static str, code: u32 },

    // ── Portal ──────────────────────────────────────────────────────
    /// Non-200 reply from the portal.
    #[error("{endpoint} returned HTTP {status}")]
    PortalStatus { endpoint: String, status: u16 },

    /// The portal answered but refused the request.
    #[error("portal rejected request (code {code:?}): {message}")]
    PortalRejected { code: Option<i64>, message: String },

    // ── Parse ───────────────────────────────────────────────────────
    /// Unexpected shape of a portal body or tool output.
    #[error("unexpected {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    // ── Store ───────────────────────────────────────────────────────
    #[error("credential store {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential store {} is malformed: {source}", path.display())]
    StoreFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no credential saved for account '{0}'")]
    UnknownAccount(String),

    #[error("no account given and no auto-login account saved")]
    NoDefaultAccount,
}

/// Coarse classification used by callers deciding how to degrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Portal,
    Parse,
    Store,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connectivity { .. } | Error::Subprocess { .. } | Error::Os { .. } => {
                ErrorKind::Connectivity
            }
            Error::PortalStatus { .. } | Error::PortalRejected { .. } => ErrorKind::Portal,
            Error::Parse { .. } => ErrorKind::Parse,
            Error::Store { .. }
            | Error::StoreFormat { .. }
            | Error::UnknownAccount(_)
            | Error::NoDefaultAccount => ErrorKind::Store,
        }
    }

    pub(crate) fn parse(what: &'static str, reason: impl Into<String>) -> Self {
        Error::Parse {
            what,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
