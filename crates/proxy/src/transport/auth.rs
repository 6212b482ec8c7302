//! Auth-header injection for HTTP-shaped transports.
//!
//! The proxy consumes an [`AuthProvider`] interface only; token acquisition
//! (OAuth flows, device codes) belongs to external collaborators. The
//! provider is asked for headers before each connect, and for one refresh
//! after a 401. A second 401 after a refresh is a fatal auth error: it does
//! not invalidate the provider and it does not engage the reconnection
//! controller.

use crate::config::{AuthScheme, AuthSettings};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

/// Supplies auth headers for outgoing connects.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// Header name/value pairs to attach to the next connect or request.
    async fn headers(&self) -> Result<Vec<(String, String)>, AuthError>;

    /// Re-acquire credentials after a 401. Called at most once per failed
    /// connect.
    async fn refresh(&self) -> Result<(), AuthError>;
}

/// Errors from an auth provider.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials unavailable: {0}")]
    Unavailable(String),

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
}

/// A provider backed by static configuration: bearer tokens or basic
/// credentials, already interpolated by the config layer. `refresh()` is a
/// no-op; static credentials cannot be re-acquired.
pub struct StaticAuthProvider {
    header_name: String,
    header_value: String,
}

impl StaticAuthProvider {
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, AuthError> {
        let header_name = settings
            .header_name
            .clone()
            .unwrap_or_else(|| "Authorization".to_string());

        let header_value = match settings.scheme {
            AuthScheme::Bearer => {
                let token = settings
                    .token
                    .as_deref()
                    .ok_or_else(|| AuthError::Unavailable("bearer scheme requires 'token'".into()))?;
                format!("Bearer {token}")
            }
            AuthScheme::Basic => {
                // A lone token becomes "<token>:" as the user:pass pair.
                let pair = match (&settings.username, &settings.password, &settings.token) {
                    (Some(user), Some(pass), _) => format!("{user}:{pass}"),
                    (Some(user), None, _) => format!("{user}:"),
                    (None, _, Some(token)) => format!("{token}:"),
                    _ => {
                        return Err(AuthError::Unavailable(
                            "basic scheme requires 'username' or 'token'".into(),
                        ));
                    }
                };
                format!("Basic {}", BASE64.encode(pair))
            }
        };

        Ok(Self { header_name, header_value })
    }
}

#[async_trait::async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn headers(&self) -> Result<Vec<(String, String)>, AuthError> {
        Ok(vec![(self.header_name.clone(), self.header_value.clone())])
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        Err(AuthError::RefreshFailed(
            "static credentials cannot be refreshed".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(scheme: AuthScheme) -> AuthSettings {
        AuthSettings {
            scheme,
            token: None,
            username: None,
            password: None,
            header_name: None,
        }
    }

    #[tokio::test]
    async fn bearer_header() {
        let mut s = settings(AuthScheme::Bearer);
        s.token = Some("tok-123".into());
        let provider = StaticAuthProvider::from_settings(&s).unwrap();
        let headers = provider.headers().await.unwrap();
        assert_eq!(headers, vec![("Authorization".into(), "Bearer tok-123".into())]);
    }

    #[tokio::test]
    async fn basic_header_encodes_credentials() {
        let mut s = settings(AuthScheme::Basic);
        s.username = Some("user".into());
        s.password = Some("pass".into());
        let provider = StaticAuthProvider::from_settings(&s).unwrap();
        let headers = provider.headers().await.unwrap();
        assert_eq!(
            headers[0].1,
            format!("Basic {}", BASE64.encode("user:pass"))
        );
    }

    #[test]
    fn custom_header_name() {
        let mut s = settings(AuthScheme::Bearer);
        s.token = Some("t".into());
        s.header_name = Some("X-Api-Key".into());
        let provider = StaticAuthProvider::from_settings(&s).unwrap();
        assert_eq!(provider.header_name, "X-Api-Key");
    }

    #[test]
    fn bearer_without_token_is_rejected() {
        assert!(StaticAuthProvider::from_settings(&settings(AuthScheme::Bearer)).is_err());
    }

    #[tokio::test]
    async fn static_refresh_fails() {
        let mut s = settings(AuthScheme::Bearer);
        s.token = Some("t".into());
        let provider = StaticAuthProvider::from_settings(&s).unwrap();
        assert!(provider.refresh().await.is_err());
    }
}
