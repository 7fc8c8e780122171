//! Message bus client speaking the RabbitMQ management HTTP API.
//!
//! Publishes go through `POST /api/exchanges/{vhost}/{exchange}/publish`,
//! which reports whether the message was routed to at least one queue. An
//! unrouted message counts as a failed publish so it stays in the outbox.

use std::{collections::BTreeMap, time::Duration};

use courier_core::BoxFuture;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::PublishError,
    publisher::{MessagePublisher, OutboundMessage},
};

/// AMQP delivery mode asking the broker to write the message to disk.
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Connection settings for the broker management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Base URL of the management API, e.g. `http://localhost:15672`.
    pub url: String,
    /// Virtual host.
    pub vhost: String,
    /// Exchange outbox events are published to.
    pub exchange: String,
    /// Basic auth user.
    pub username: String,
    /// Basic auth password.
    pub password: String,
    /// Timeout for each HTTP request.
    pub timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:15672".to_string(),
            vhost: "/".to_string(),
            exchange: "domain.events".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Exchange types supported by [`HttpBroker::declare_exchange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Pattern routing on dotted keys.
    Topic,
    /// Exact routing key match.
    Direct,
    /// Broadcast to every bound queue.
    Fanout,
}

impl ExchangeKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    properties: PublishProperties<'a>,
    routing_key: &'a str,
    payload: &'a str,
    payload_encoding: &'static str,
}

#[derive(Serialize)]
struct PublishProperties<'a> {
    delivery_mode: u8,
    message_id: &'a str,
    content_type: &'a str,
    headers: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct PublishResponse {
    routed: bool,
}

#[derive(Serialize)]
struct ExchangeDeclaration<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    durable: bool,
    auto_delete: bool,
    internal: bool,
    arguments: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct QueueDeclaration {
    durable: bool,
    auto_delete: bool,
    arguments: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct BindingDeclaration<'a> {
    routing_key: &'a str,
    arguments: BTreeMap<String, String>,
}

/// HTTP client for the broker management API.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: Url,
    config: BrokerConfig,
}

impl HttpBroker {
    /// Creates a broker client.
    ///
    /// # Errors
    ///
    /// Returns `PublishError::Configuration` if the URL is not an absolute
    /// http(s) URL or the HTTP client cannot be built.
    pub fn new(config: BrokerConfig) -> Result<Self, PublishError> {
        let base_url = Url::parse(&config.url).map_err(|e| {
            PublishError::Configuration(format!("invalid broker url {:?}: {e}", config.url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(PublishError::Configuration(format!(
                "broker url {:?} cannot carry a path",
                config.url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                PublishError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, base_url, config })
    }

    /// Client configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Declares an exchange. Idempotent for identical arguments.
    ///
    /// # Errors
    ///
    /// Returns a `PublishError` if the broker refuses the declaration.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), PublishError> {
        let url = self.api_url(&["exchanges", &self.config.vhost, name]);
        let body = ExchangeDeclaration {
            kind: kind.as_str(),
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: BTreeMap::new(),
        };

        let response = self.send(self.client.put(url).json(&body)).await?;
        expect_success(response).await?;
        info!(exchange = name, kind = kind.as_str(), "exchange declared");
        Ok(())
    }

    /// Declares a durable queue.
    ///
    /// # Errors
    ///
    /// Returns a `PublishError` if the broker refuses the declaration.
    pub async fn declare_queue(&self, name: &str) -> Result<(), PublishError> {
        let url = self.api_url(&["queues", &self.config.vhost, name]);
        let body =
            QueueDeclaration { durable: true, auto_delete: false, arguments: BTreeMap::new() };

        let response = self.send(self.client.put(url).json(&body)).await?;
        expect_success(response).await?;
        info!(queue = name, "queue declared");
        Ok(())
    }

    /// Binds `queue` to `exchange` for routing keys matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a `PublishError` if the broker refuses the binding.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), PublishError> {
        let url = self.api_url(&["bindings", &self.config.vhost, "e", exchange, "q", queue]);
        let body = BindingDeclaration { routing_key: pattern, arguments: BTreeMap::new() };

        let response = self.send(self.client.post(url).json(&body)).await?;
        expect_success(response).await?;
        info!(queue, exchange, pattern, "queue bound");
        Ok(())
    }

    async fn publish_message(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        let url =
            self.api_url(&["exchanges", &self.config.vhost, &self.config.exchange, "publish"]);
        let payload = std::str::from_utf8(&message.body)
            .map_err(|e| PublishError::Serialization(format!("payload is not UTF-8: {e}")))?;
        let body = PublishRequest {
            properties: PublishProperties {
                delivery_mode: if message.persistent {
                    PERSISTENT_DELIVERY_MODE
                } else {
                    TRANSIENT_DELIVERY_MODE
                },
                message_id: &message.message_id,
                content_type: &message.content_type,
                headers: &message.headers,
            },
            routing_key: &message.routing_key,
            payload,
            payload_encoding: "string",
        };

        let response = self.send(self.client.post(url).json(&body)).await?;
        let response = expect_success(response).await?;
        let result: PublishResponse = response
            .json()
            .await
            .map_err(|e| PublishError::network(format!("invalid publish response: {e}")))?;

        if !result.routed {
            warn!("broker accepted message but routed it nowhere");
            return Err(PublishError::Unroutable { routing_key: message.routing_key.clone() });
        }

        debug!("message routed");
        Ok(())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, PublishError> {
        request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::timeout(self.config.timeout.as_millis() as u64)
                } else {
                    PublishError::network(e.to_string())
                }
            })
    }

    /// Appends percent-encoded segments under `/api`, so the default vhost
    /// `/` becomes `%2F`.
    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects cannot-be-a-base URLs, so the path is always mutable.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }
}

impl MessagePublisher for HttpBroker {
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), PublishError>> {
        let span = info_span!(
            "broker_publish",
            message_id = %message.message_id,
            routing_key = %message.routing_key,
            exchange = %self.config.exchange,
        );
        Box::pin(async move { self.publish_message(&message).await }.instrument(span))
    }
}

async fn expect_success(response: Response) -> Result<Response, PublishError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        warn!("broker rejected credentials");
    }
    Err(PublishError::from_status(status.as_u16(), body))
}
