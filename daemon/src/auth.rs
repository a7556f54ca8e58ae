/// Authentication and authorization against an external identity provider
use crate::config::AuthConfig;
use crate::errors::{DaemonError, DaemonResult};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Principal used when no identity provider is configured
pub const ADMIN_PRINCIPAL: &str = "admin";

/// Known provider families and where they serve userinfo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    Keycloak,
    Auth0,
    Okta,
    Microsoft,
    Google,
    /// Base URL already is the userinfo endpoint
    Direct,
    Generic,
}

impl ProviderFamily {
    pub fn detect(base: &Url) -> Self {
        let host = base.host_str().unwrap_or_default();
        let path = base.path().trim_end_matches('/');

        if path.contains("/realms/") {
            ProviderFamily::Keycloak
        } else if path.ends_with("/userinfo") {
            ProviderFamily::Direct
        } else if host.ends_with("auth0.com") {
            ProviderFamily::Auth0
        } else if host.contains("okta") {
            ProviderFamily::Okta
        } else if host == "login.microsoftonline.com" {
            ProviderFamily::Microsoft
        } else if host == "accounts.google.com" {
            ProviderFamily::Google
        } else {
            ProviderFamily::Generic
        }
    }

    /// Userinfo endpoint for a provider base URL
    pub fn userinfo_endpoint(&self, base: &Url) -> String {
        let trimmed = base.as_str().trim_end_matches('/');
        match self {
            ProviderFamily::Keycloak => format!("{}/protocol/openid-connect/userinfo", trimmed),
            ProviderFamily::Auth0 => format!("{}/userinfo", base.origin().ascii_serialization()),
            ProviderFamily::Okta if base.path().contains("/oauth2/") => {
                format!("{}/v1/userinfo", trimmed)
            }
            ProviderFamily::Okta => format!("{}/oauth2/v1/userinfo", trimmed),
            ProviderFamily::Microsoft => "https://graph.microsoft.com/oidc/userinfo".to_string(),
            ProviderFamily::Google => "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
            ProviderFamily::Direct => trimmed.to_string(),
            ProviderFamily::Generic => format!("{}/userinfo", trimmed),
        }
    }
}

/// Userinfo document, with the fields we read
#[derive(Debug, Default, Deserialize)]
struct UserInfo {
    preferred_username: Option<String>,
    email: Option<String>,
    name: Option<String>,
    sub: Option<String>,
    subject: Option<String>,
    #[serde(default)]
    allow_list: Option<Vec<String>>,
}

impl UserInfo {
    fn principal(&self) -> Option<String> {
        [
            &self.preferred_username,
            &self.email,
            &self.name,
            &self.sub,
            &self.subject,
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
        .cloned()
    }
}

/// Request authorization info
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub principal: String,
    /// Definition ids the principal may use; empty means all
    pub allow_list: Vec<String>,
}

impl AuthContext {
    pub fn new(principal: impl Into<String>, allow_list: Vec<String>) -> Self {
        AuthContext {
            principal: principal.into(),
            allow_list,
        }
    }

    /// Context used when no identity provider is configured
    pub fn admin() -> Self {
        Self::new(ADMIN_PRINCIPAL, Vec::new())
    }

    /// Check if the principal may use a definition
    pub fn permits(&self, definition_id: &str) -> bool {
        self.allow_list.is_empty() || self.allow_list.iter().any(|d| d == definition_id)
    }

    /// Deny with 403 unless permitted
    pub fn require(&self, definition_id: &str) -> DaemonResult<()> {
        if self.permits(definition_id) {
            Ok(())
        } else {
            Err(DaemonError::Forbidden(format!(
                "Access denied to definition {}",
                definition_id
            )))
        }
    }
}

/// Validates bearer credentials with the identity provider
pub struct IdentityGate {
    userinfo: Option<String>,
    client: reqwest::Client,
}

impl IdentityGate {
    pub fn new(config: &AuthConfig) -> DaemonResult<Self> {
        let userinfo = match &config.provider_url {
            Some(raw) => {
                let base = Url::parse(raw).map_err(|e| {
                    DaemonError::ConfigError(format!("Invalid provider URL {}: {}", raw, e))
                })?;
                let family = ProviderFamily::detect(&base);
                let endpoint = family.userinfo_endpoint(&base);
                debug!("Identity provider {:?}, userinfo at {}", family, endpoint);
                Some(endpoint)
            }
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DaemonError::ConfigError(format!("HTTP client: {}", e)))?;

        Ok(IdentityGate { userinfo, client })
    }

    /// Whether a provider is configured
    pub fn is_enabled(&self) -> bool {
        self.userinfo.is_some()
    }

    pub fn userinfo_endpoint(&self) -> Option<&str> {
        self.userinfo.as_deref()
    }

    /// Resolve the `Authorization` header into a principal and allow-list
    pub async fn authenticate(&self, authorization: Option<&str>) -> DaemonResult<AuthContext> {
        let Some(endpoint) = &self.userinfo else {
            return Ok(AuthContext::admin());
        };

        let token = authorization
            .and_then(parse_bearer_token)
            .ok_or_else(|| DaemonError::Unauthorized("Missing bearer token".to_string()))?;

        let response = self
            .client
            .get(endpoint)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| {
                warn!("Identity provider unreachable: {}", e);
                DaemonError::Unavailable(format!("Identity provider unreachable: {}", e))
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DaemonError::Forbidden("Invalid or expired token".to_string()))
            }
            status => {
                warn!("Identity provider answered {}", status);
                return Err(DaemonError::Unavailable(format!(
                    "Identity provider answered {}",
                    status
                )));
            }
        }

        let info: UserInfo = response.json().await.map_err(|e| {
            DaemonError::Unavailable(format!("Unreadable userinfo response: {}", e))
        })?;
        let principal = info
            .principal()
            .ok_or_else(|| DaemonError::Forbidden("Token carries no identity".to_string()))?;

        Ok(AuthContext::new(principal, info.allow_list.unwrap_or_default()))
    }
}

pub fn parse_bearer_token(header: &str) -> Option<String> {
    let trimmed = header.trim();
    let mut parts = trimmed.splitn(2, ' ');
    let scheme = parts.next()?.to_ascii_lowercase();
    if scheme != "bearer" {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(base: &str) -> String {
        let url = Url::parse(base).unwrap();
        ProviderFamily::detect(&url).userinfo_endpoint(&url)
    }

    #[test]
    fn test_userinfo_rule_table() {
        assert_eq!(
            endpoint("https://sso.example.com/realms/care/"),
            "https://sso.example.com/realms/care/protocol/openid-connect/userinfo"
        );
        assert_eq!(
            endpoint("https://tenant.eu.auth0.com/some/path"),
            "https://tenant.eu.auth0.com/userinfo"
        );
        assert_eq!(
            endpoint("https://dev-1.okta.com"),
            "https://dev-1.okta.com/oauth2/v1/userinfo"
        );
        assert_eq!(
            endpoint("https://login.microsoftonline.com/tenant/v2.0"),
            "https://graph.microsoft.com/oidc/userinfo"
        );
        assert_eq!(
            endpoint("https://accounts.google.com"),
            "https://openidconnect.googleapis.com/v1/userinfo"
        );
        assert_eq!(
            endpoint("https://idp.local/oauth/userinfo"),
            "https://idp.local/oauth/userinfo"
        );
        assert_eq!(endpoint("https://idp.local/oidc"), "https://idp.local/oidc/userinfo");
    }

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(parse_bearer_token("Bearer abc"), Some("abc".to_string()));
        assert_eq!(parse_bearer_token("bearer   abc "), Some("abc".to_string()));
        assert_eq!(parse_bearer_token("Basic abc"), None);
        assert_eq!(parse_bearer_token("Bearer "), None);
    }

    #[test]
    fn test_principal_precedence() {
        let info = UserInfo {
            email: Some("nurse@example.com".into()),
            sub: Some("42".into()),
            ..Default::default()
        };
        assert_eq!(info.principal().as_deref(), Some("nurse@example.com"));

        let info = UserInfo {
            preferred_username: Some("".into()),
            subject: Some("svc".into()),
            ..Default::default()
        };
        assert_eq!(info.principal().as_deref(), Some("svc"));
    }

    #[test]
    fn test_allow_list() {
        let admin = AuthContext::admin();
        assert!(admin.permits("anything"));

        let scoped = AuthContext::new("nurse", vec!["tp01".into()]);
        assert!(scoped.permits("tp01"));
        assert!(!scoped.permits("tp02"));
        assert!(scoped.require("tp02").is_err());
    }

    #[tokio::test]
    async fn test_no_provider_accepts_everything() {
        let gate = IdentityGate::new(&AuthConfig::default()).unwrap();
        assert!(!gate.is_enabled());
        let ctx = gate.authenticate(None).await.unwrap();
        assert_eq!(ctx, AuthContext::admin());
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let gate = IdentityGate::new(&AuthConfig {
            provider_url: Some("http://127.0.0.1:9/oidc".into()),
            timeout_secs: 1,
        })
        .unwrap();
        let err = gate.authenticate(None).await.unwrap_err();
        assert!(matches!(err, DaemonError::Unauthorized(_)));
    }
}
