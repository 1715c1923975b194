//! Low-cost HTTP probes against subscriber endpoints.

use crate::subscription::ProbeMethod;
use crate::token::TokenProvider;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// One probe to perform, with the identity of the subscription that asked
/// for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub url: String,
    pub method: ProbeMethod,
    pub environment: String,
    pub publisher_id: String,
    pub subscriber_id: String,
}

/// What a probe observed. A transport failure carries no status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status_code: Option<u16>,
    pub reason: String,
}

impl ProbeOutcome {
    pub fn successful(&self, accepted: &BTreeSet<u16>) -> bool {
        self.status_code.is_some_and(|code| accepted.contains(&code))
    }
}

/// Seam over the HTTP client so probes can be scripted in tests.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> ProbeOutcome;
}

/// Identity headers sent with every probe so the subscriber can attribute
/// the traffic.
const PUBLISHER_HEADER: &str = "x-pubsub-publisher-id";
const SUBSCRIBER_HEADER: &str = "x-pubsub-subscriber-id";

/// Production prober over reqwest with bearer tokens from a
/// [`TokenProvider`].
pub struct HttpProber {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for HttpProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProber").finish()
    }
}

impl HttpProber {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        request_timeout: Duration,
        max_connections: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .pool_max_idle_per_host(max_connections)
            .build()?;
        Ok(Self { client, tokens })
    }

    pub fn with_client(client: reqwest::Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { client, tokens }
    }
}

#[async_trait]
impl EndpointProber for HttpProber {
    async fn probe(&self, request: &ProbeRequest) -> ProbeOutcome {
        let token = match self.tokens.token(&request.environment).await {
            Ok(token) => token,
            Err(error) => {
                return ProbeOutcome {
                    status_code: None,
                    reason: format!("token acquisition failed: {error}"),
                }
            }
        };

        let builder = match request.method {
            ProbeMethod::Head => self.client.head(&request.url),
            ProbeMethod::Get => self.client.get(&request.url),
        };
        let response = builder
            .header(PUBLISHER_HEADER, &request.publisher_id)
            .header(SUBSCRIBER_HEADER, &request.subscriber_id)
            .bearer_auth(token)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                ProbeOutcome {
                    status_code: Some(status.as_u16()),
                    reason: status.canonical_reason().unwrap_or("unknown").to_string(),
                }
            }
            Err(error) => ProbeOutcome { status_code: None, reason: error.to_string() },
        }
    }
}
