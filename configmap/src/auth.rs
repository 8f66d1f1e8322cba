//! Authentication for requests made to Google APIs.
//!
//! Headers are fetched from the credentials for every request. The
//! credentials cache the access token and refresh it before it expires.
use async_trait::async_trait;
use google_cloud_auth::credentials::{self, CacheableResource, Credentials};
use google_cloud_auth::errors::CredentialsError;
use http::{Extensions, HeaderMap};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("could not build credentials: {0}")]
    Build(String),

    #[error("could not get auth headers: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("credentials returned no headers")]
    NotModified,
}

impl AuthError {
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Credentials(err) => err.is_transient(),
            AuthError::Build(_) | AuthError::NotModified => false,
        }
    }
}

/// Supplies the headers that authenticate one request.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    async fn headers(&self) -> Result<HeaderMap, AuthError>;
}

#[async_trait]
impl HeaderSource for Credentials {
    async fn headers(&self) -> Result<HeaderMap, AuthError> {
        match Credentials::headers(self, Extensions::new()).await? {
            CacheableResource::New { data, .. } => Ok(data),
            CacheableResource::NotModified => Err(AuthError::NotModified),
        }
    }
}

/// Application default credentials, or anonymous ones for emulators.
pub fn credentials(anonymous: bool) -> Result<Credentials, AuthError> {
    if anonymous {
        return Ok(credentials::anonymous::Builder::new().build());
    }
    credentials::Builder::default()
        .with_scopes([CLOUD_PLATFORM_SCOPE])
        .build()
        .map_err(|e| AuthError::Build(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_anonymous_credentials() {
        let creds = credentials(true).unwrap();
        let headers = HeaderSource::headers(&creds).await.unwrap();
        assert!(headers.get(http::header::AUTHORIZATION).is_none());
    }
}
