//! Minimal Pub/Sub client used to receive bucket change notifications.
//!
//! Only the handful of REST calls needed by the watcher are implemented.
use crate::auth::{AuthError, HeaderSource};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com/";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topic {
    pub project: String,
    pub id: String,
}

impl Topic {
    pub fn new<P, I>(project: P, id: I) -> Self
    where
        P: Into<String>,
        I: Into<String>,
    {
        Topic {
            project: project.into(),
            id: id.into(),
        }
    }

    /// Parses `projects/<p>/topics/<t>`, optionally prefixed with the
    /// `//pubsub.googleapis.com/` service name used by storage notifications.
    pub fn parse(s: &str) -> Option<Topic> {
        let s = s.strip_prefix("//pubsub.googleapis.com/").unwrap_or(s);
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("projects"), Some(project), Some("topics"), Some(id), None)
                if !project.is_empty() && !id.is_empty() =>
            {
                Some(Topic::new(project, id))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/topics/{}", self.project, self.id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub ack_id: String,
    pub attributes: HashMap<String, String>,
    pub publish_time: Option<String>,
}

impl Message {
    pub fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Canonical status of a failed API call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiCode {
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    Unauthenticated,
    PermissionDenied,
    ResourceExhausted,
    Internal,
    Unavailable,
    Other(String),
}

impl ApiCode {
    fn parse(s: &str) -> Self {
        match s {
            "UNKNOWN" => ApiCode::Unknown,
            "INVALID_ARGUMENT" => ApiCode::InvalidArgument,
            "DEADLINE_EXCEEDED" => ApiCode::DeadlineExceeded,
            "NOT_FOUND" => ApiCode::NotFound,
            "ALREADY_EXISTS" => ApiCode::AlreadyExists,
            "UNAUTHENTICATED" => ApiCode::Unauthenticated,
            "PERMISSION_DENIED" => ApiCode::PermissionDenied,
            "RESOURCE_EXHAUSTED" => ApiCode::ResourceExhausted,
            "INTERNAL" => ApiCode::Internal,
            "UNAVAILABLE" => ApiCode::Unavailable,
            other => ApiCode::Other(other.to_string()),
        }
    }

    fn from_http(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_REQUEST => ApiCode::InvalidArgument,
            StatusCode::UNAUTHORIZED => ApiCode::Unauthenticated,
            StatusCode::FORBIDDEN => ApiCode::PermissionDenied,
            StatusCode::NOT_FOUND => ApiCode::NotFound,
            StatusCode::CONFLICT => ApiCode::AlreadyExists,
            StatusCode::TOO_MANY_REQUESTS => ApiCode::ResourceExhausted,
            StatusCode::SERVICE_UNAVAILABLE => ApiCode::Unavailable,
            StatusCode::GATEWAY_TIMEOUT => ApiCode::DeadlineExceeded,
            _ => ApiCode::Unknown,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PubsubError {
    #[error("pubsub request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("pubsub returned {status} ({code:?}): {message}")]
    Status {
        status: StatusCode,
        code: ApiCode,
        message: String,
    },

    #[error("invalid pubsub endpoint: {0}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl PubsubError {
    /// Whether the receive loop should back off and try again.
    ///
    /// `UNKNOWN` is returned by the service for transient stream failures and
    /// is retried along with the usual transient codes. `UNAUTHENTICATED` is
    /// retried because every request fetches fresh auth headers.
    pub fn is_retriable(&self) -> bool {
        match self {
            PubsubError::Request(err) => !err.is_builder() && !err.is_decode(),
            PubsubError::Status { code, .. } => matches!(
                code,
                ApiCode::Unknown
                    | ApiCode::Unauthenticated
                    | ApiCode::Unavailable
                    | ApiCode::ResourceExhausted
                    | ApiCode::DeadlineExceeded
                    | ApiCode::Internal
            ),
            PubsubError::InvalidEndpoint(_) => false,
            PubsubError::Auth(err) => err.is_transient(),
        }
    }

    fn is_not_found(&self) -> bool {
        matches!(
            self,
            PubsubError::Status {
                code: ApiCode::NotFound,
                ..
            }
        )
    }
}

#[async_trait]
pub trait PubsubClient: Send + Sync {
    async fn topic_exists(&self, topic: &Topic) -> Result<bool, PubsubError>;

    /// Topic the subscription is attached to, or `None` if the subscription
    /// does not exist.
    async fn subscription_topic(&self, id: &str) -> Result<Option<Topic>, PubsubError>;

    async fn create_subscription(
        &self,
        id: &str,
        topic: &Topic,
        expiration: Duration,
    ) -> Result<(), PubsubError>;

    fn subscription(&self, id: &str) -> Arc<dyn Subscription>;
}

#[async_trait]
pub trait Subscription: Send + Sync {
    fn name(&self) -> &str;

    /// Waits for the next batch of messages. May return an empty batch.
    async fn pull(&self, max_messages: u32) -> Result<Vec<Message>, PubsubError>;

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), PubsubError>;

    async fn delete(&self) -> Result<(), PubsubError>;
}

struct RestInner {
    client: reqwest::Client,
    endpoint: Url,
    project: String,
    auth: Arc<dyn HeaderSource>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl RestInner {
    fn url(&self, segments: &[&str]) -> Result<Url, PubsubError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| PubsubError::InvalidEndpoint(self.endpoint.to_string()))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<reqwest::Response, PubsubError> {
        let mut request = self
            .client
            .request(method, url)
            .headers(self.auth.headers().await?);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) if !body.error.status.is_empty() => {
                (ApiCode::parse(&body.error.status), body.error.message)
            }
            Ok(body) => (ApiCode::from_http(status), body.error.message),
            Err(_) => (ApiCode::from_http(status), text),
        };
        Err(PubsubError::Status {
            status,
            code,
            message,
        })
    }
}

/// Pub/Sub client over the v1 REST API.
#[derive(Clone)]
pub struct PubsubRestClient {
    inner: Arc<RestInner>,
}

impl PubsubRestClient {
    pub fn new(
        endpoint: &str,
        project: &str,
        auth: Arc<dyn HeaderSource>,
    ) -> Result<Self, PubsubError> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| PubsubError::InvalidEndpoint(e.to_string()))?;
        Ok(PubsubRestClient {
            inner: Arc::new(RestInner {
                client: reqwest::Client::new(),
                endpoint,
                project: project.to_string(),
                auth,
            }),
        })
    }
}

#[derive(Deserialize)]
struct SubscriptionResource {
    topic: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionRequest {
    topic: String,
    expiration_policy: ExpirationPolicy,
}

#[derive(Serialize)]
struct ExpirationPolicy {
    ttl: String,
}

#[async_trait]
impl PubsubClient for PubsubRestClient {
    async fn topic_exists(&self, topic: &Topic) -> Result<bool, PubsubError> {
        let url = self
            .inner
            .url(&["projects", &topic.project, "topics", &topic.id])?;
        match self.inner.call::<()>(Method::GET, url, None).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn subscription_topic(&self, id: &str) -> Result<Option<Topic>, PubsubError> {
        let url = self
            .inner
            .url(&["projects", &self.inner.project, "subscriptions", id])?;
        let response = match self.inner.call::<()>(Method::GET, url, None).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let resource: SubscriptionResource = response.json().await?;
        Topic::parse(&resource.topic).map(Some).ok_or(PubsubError::Status {
            status: StatusCode::OK,
            code: ApiCode::Unknown,
            message: format!("unexpected topic name {:?}", resource.topic),
        })
    }

    async fn create_subscription(
        &self,
        id: &str,
        topic: &Topic,
        expiration: Duration,
    ) -> Result<(), PubsubError> {
        let url = self
            .inner
            .url(&["projects", &self.inner.project, "subscriptions", id])?;
        let body = CreateSubscriptionRequest {
            topic: topic.to_string(),
            expiration_policy: ExpirationPolicy {
                ttl: format!("{}s", expiration.as_secs()),
            },
        };
        self.inner.call(Method::PUT, url, Some(&body)).await?;
        Ok(())
    }

    fn subscription(&self, id: &str) -> Arc<dyn Subscription> {
        Arc::new(RestSubscription {
            inner: self.inner.clone(),
            id: id.to_string(),
            name: format!("projects/{}/subscriptions/{}", self.inner.project, id),
        })
    }
}

struct RestSubscription {
    inner: Arc<RestInner>,
    id: String,
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    publish_time: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[async_trait]
impl Subscription for RestSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, max_messages: u32) -> Result<Vec<Message>, PubsubError> {
        let url = self.inner.url(&[
            "projects",
            &self.inner.project,
            "subscriptions",
            &format!("{}:pull", self.id),
        ])?;
        let response = self
            .inner
            .call(Method::POST, url, Some(&PullRequest { max_messages }))
            .await?;
        let pulled: PullResponse = response.json().await?;
        Ok(pulled
            .received_messages
            .into_iter()
            .map(|m| Message {
                id: m.message.message_id,
                ack_id: m.ack_id,
                attributes: m.message.attributes,
                publish_time: m.message.publish_time,
            })
            .collect())
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), PubsubError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let url = self.inner.url(&[
            "projects",
            &self.inner.project,
            "subscriptions",
            &format!("{}:acknowledge", self.id),
        ])?;
        self.inner
            .call(Method::POST, url, Some(&AcknowledgeRequest { ack_ids }))
            .await?;
        Ok(())
    }

    async fn delete(&self) -> Result<(), PubsubError> {
        let url = self
            .inner
            .url(&["projects", &self.inner.project, "subscriptions", &self.id])?;
        self.inner.call::<()>(Method::DELETE, url, None).await?;
        Ok(())
    }
}
