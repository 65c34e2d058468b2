/// Core error type.
///
/// Adapter crates map their transport errors into this type so the pipeline and
/// the synchronizer can decide between key failover, degrade-and-retry and a
/// user-facing fallback.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("no model API key configured")]
    NoApiKey,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("upstream request timed out")]
    Timeout,

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// HTTP status reported by the upstream, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Auth, quota and server-side failures: another API key may succeed.
    pub fn is_failover_class(&self) -> bool {
        matches!(self.status(), Some(401 | 403 | 429 | 500..=599))
    }

    /// Client / not-found failures, which is how a broken retrieval tool binding surfaces.
    pub fn is_tool_unavailable_class(&self) -> bool {
        matches!(self.status(), Some(400 | 404))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(status: u16) -> Error {
        Error::Upstream {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn failover_class_covers_auth_quota_and_server_errors() {
        for s in [401, 403, 429, 500, 503, 599] {
            assert!(upstream(s).is_failover_class(), "{s} should fail over");
        }
        for s in [400, 404, 409] {
            assert!(!upstream(s).is_failover_class(), "{s} should not fail over");
        }
        assert!(!Error::Timeout.is_failover_class());
    }

    #[test]
    fn tool_unavailable_class_is_bad_request_or_not_found() {
        assert!(upstream(400).is_tool_unavailable_class());
        assert!(upstream(404).is_tool_unavailable_class());
        assert!(!upstream(403).is_tool_unavailable_class());
        assert!(!Error::NoApiKey.is_tool_unavailable_class());
    }
}
