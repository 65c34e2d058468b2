use std::sync::Arc;

use tracing::warn;

use crate::{
    domain::KeySource,
    errors::Error,
    ports::{ModelEndpoint, ModelRequest, ModelResponse},
    utils::key_fingerprint,
    Result,
};

/// A value plus the key tier that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Served<T> {
    pub value: T,
    pub key_source: KeySource,
}

#[derive(Clone)]
struct ApiKey {
    source: KeySource,
    secret: String,
}

/// Two-key failover in front of a [`ModelEndpoint`].
///
/// The free-tier key is primary when configured. A failover-class failure
/// (401/403/429/5xx) on the primary is retried exactly once with the secondary
/// key; every other outcome is returned as is. At most two attempts per call.
pub struct FailoverTransport {
    endpoint: Arc<dyn ModelEndpoint>,
    primary: Option<ApiKey>,
    secondary: Option<ApiKey>,
}

impl FailoverTransport {
    pub fn new(
        endpoint: Arc<dyn ModelEndpoint>,
        free_key: Option<String>,
        paid_key: Option<String>,
    ) -> Self {
        let free = free_key.map(|secret| ApiKey {
            source: KeySource::Free,
            secret,
        });
        let paid = paid_key.map(|secret| ApiKey {
            source: KeySource::Paid,
            secret,
        });

        let (primary, secondary) = match (free, paid) {
            (Some(f), p) => (Some(f), p),
            (None, p) => (p, None),
        };

        Self {
            endpoint,
            primary,
            secondary,
        }
    }

    pub fn has_key(&self) -> bool {
        self.primary.is_some()
    }

    pub async fn send(&self, req: &ModelRequest) -> Result<Served<ModelResponse>> {
        let Some(primary) = &self.primary else {
            return Err(Error::NoApiKey);
        };

        let err = match self.endpoint.generate(&primary.secret, req).await {
            Ok(value) => {
                return Ok(Served {
                    value,
                    key_source: primary.source,
                })
            }
            Err(e) => e,
        };

        if !err.is_failover_class() {
            return Err(err);
        }
        let Some(secondary) = &self.secondary else {
            return Err(err);
        };

        warn!(
            model = %req.model,
            from = primary.source.as_str(),
            key = %key_fingerprint(&primary.secret),
            to = secondary.source.as_str(),
            error = %err,
            "model key failover"
        );

        let value = self.endpoint.generate(&secondary.secret, req).await?;
        Ok(Served {
            value,
            key_source: secondary.source,
        })
    }
}
