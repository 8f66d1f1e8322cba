use crate::auth::HeaderSource;
use crate::pubsub::Topic;
use crate::storage::{ObjectAttrs, StorageClient, StorageError};
use async_trait::async_trait;
use google_cloud_auth::credentials::Credentials;
use google_cloud_gax::error::Error as GaxError;
use google_cloud_gax::error::rpc::Code;
use google_cloud_storage::client::{Storage, StorageControl};
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com/";

/// Resource name of a bucket as used by the storage client.
fn bucket_name(bucket: &str) -> String {
    format!("projects/_/buckets/{bucket}")
}

fn is_not_found(err: &GaxError) -> bool {
    err.http_status_code() == Some(404) || err.status().is_some_and(|s| s.code == Code::NotFound)
}

fn update_time(seconds: i64, nanos: i32) -> Result<OffsetDateTime, StorageError> {
    let nanos = i128::from(seconds) * 1_000_000_000 + i128::from(nanos);
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|e| StorageError::InvalidResponse(format!("update time: {e}")))
}

#[derive(Deserialize)]
struct NotificationList {
    #[serde(default)]
    items: Vec<NotificationResource>,
}

#[derive(Deserialize)]
struct NotificationResource {
    topic: String,
}

/// Lists bucket notification configs over the JSON API.
pub struct NotificationConfigs {
    client: reqwest::Client,
    endpoint: Url,
    auth: Arc<dyn HeaderSource>,
}

impl NotificationConfigs {
    pub fn new(endpoint: &str, auth: Arc<dyn HeaderSource>) -> Result<Self, StorageError> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| StorageError::InvalidResponse(e.to_string()))?;
        Ok(NotificationConfigs {
            client: reqwest::Client::new(),
            endpoint,
            auth,
        })
    }

    pub async fn topics(&self, bucket: &str) -> Result<Vec<Topic>, StorageError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidUri(self.endpoint.to_string()))?
            .pop_if_empty()
            .extend(["storage", "v1", "b", bucket, "notificationConfigs"]);

        let response = self
            .client
            .get(url)
            .headers(self.auth.headers().await?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::Status {
                status: response.status(),
                url: response.url().to_string(),
            });
        }
        let list: NotificationList = response.json().await?;

        Ok(list
            .items
            .iter()
            .filter_map(|n| {
                let topic = Topic::parse(&n.topic);
                if topic.is_none() {
                    tracing::warn!(bucket, topic = %n.topic, "ignoring unparsable notification topic");
                }
                topic
            })
            .collect())
    }
}

/// Cloud Storage client. Objects are listed and read through the storage
/// client library.
pub struct GcsClient {
    storage: Storage,
    control: StorageControl,
    notifications: NotificationConfigs,
}

impl GcsClient {
    /// `endpoint` overrides the service endpoint, for emulators.
    pub async fn new(endpoint: Option<&str>, credentials: Credentials) -> Result<Self, StorageError> {
        let mut storage = Storage::builder().with_credentials(credentials.clone());
        let mut control = StorageControl::builder().with_credentials(credentials.clone());
        if let Some(endpoint) = endpoint {
            storage = storage.with_endpoint(endpoint);
            control = control.with_endpoint(endpoint);
        }
        let storage = storage
            .build()
            .await
            .map_err(|e| StorageError::Client(e.to_string()))?;
        let control = control
            .build()
            .await
            .map_err(|e| StorageError::Client(e.to_string()))?;
        let notifications =
            NotificationConfigs::new(endpoint.unwrap_or(DEFAULT_ENDPOINT), Arc::new(credentials))?;

        Ok(GcsClient {
            storage,
            control,
            notifications,
        })
    }
}

#[async_trait]
impl StorageClient for GcsClient {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectAttrs>, StorageError> {
        let mut objects = Vec::new();
        let mut page_token = String::new();
        let mut pages = 0;

        loop {
            let response = self
                .control
                .list_objects()
                .set_parent(bucket_name(bucket))
                .set_prefix(prefix)
                .set_page_token(page_token.clone())
                .send()
                .await?;

            for object in response.objects {
                let updated = match &object.update_time {
                    Some(ts) => update_time(ts.seconds(), ts.nanos())?,
                    None => OffsetDateTime::UNIX_EPOCH,
                };
                objects.push(ObjectAttrs {
                    name: object.name,
                    updated,
                });
            }
            pages += 1;

            if response.next_page_token.is_empty() {
                break;
            }
            page_token = response.next_page_token;
        }

        tracing::debug!(bucket, prefix, pages, objects = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn read_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        let not_found = || StorageError::NotFound {
            bucket: bucket.to_string(),
            name: name.to_string(),
        };

        let mut reader = match self
            .storage
            .read_object(bucket_name(bucket), name)
            .send()
            .await
        {
            Ok(reader) => reader,
            Err(err) if is_not_found(&err) => return Err(not_found()),
            Err(err) => return Err(err.into()),
        };

        let mut buf = Vec::new();
        while let Some(chunk) = reader.next().await {
            match chunk {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(err) if is_not_found(&err) => return Err(not_found()),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(buf)
    }

    async fn notification_topics(&self, bucket: &str) -> Result<Vec<Topic>, StorageError> {
        self.notifications.topics(bucket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::RotatingToken;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_bucket_name() {
        assert_eq!(bucket_name("toolchain-config"), "projects/_/buckets/toolchain-config");
    }

    #[test]
    fn test_update_time() {
        assert_eq!(update_time(1709287200, 0).unwrap().unix_timestamp(), 1709287200);
        assert_eq!(update_time(1709287200, 123_000_000).unwrap().millisecond(), 123);
        assert!(update_time(i64::MAX, 0).is_err());
    }

    #[tokio::test]
    async fn test_notification_topics() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b/toolchain-config/notificationConfigs"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"id": "1", "topic": "//pubsub.googleapis.com/projects/p/topics/toolchain-config"},
                    {"id": "2", "topic": "garbage"},
                ]
            })))
            .mount(&server)
            .await;

        let client = NotificationConfigs::new(&server.uri(), Arc::new(RotatingToken::new())).unwrap();
        let topics = client.topics("toolchain-config").await.unwrap();
        assert_eq!(topics, vec![Topic::new("p", "toolchain-config")]);
    }

    #[tokio::test]
    async fn test_notification_topics_refreshes_headers() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b/toolchain-config/notificationConfigs"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/storage/v1/b/toolchain-config/notificationConfigs"))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let auth = Arc::new(RotatingToken::new());
        let client = NotificationConfigs::new(&server.uri(), auth.clone()).unwrap();
        assert!(matches!(
            client.topics("toolchain-config").await,
            Err(StorageError::Status {
                status: reqwest::StatusCode::UNAUTHORIZED,
                ..
            })
        ));
        assert!(client.topics("toolchain-config").await.unwrap().is_empty());
        assert_eq!(auth.calls(), 2);
    }
}
