//! Git provider collaborator: short-lived installation tokens for clones,
//! commit metadata lookups, and webhook signature verification.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ring::hmac;
use runway_common::deployment::Commit;
use runway_common::secret::Key;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{Error, ErrorKind, Result};
use crate::persistence::Persistence;

const PROVIDER_TIMEOUT_SECS: u64 = 30;
/// App JWTs are valid for ten minutes, the provider maximum.
const APP_JWT_TTL_SECS: i64 = 600;
/// Refresh cached installation tokens this long before they expire.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    app_id: String,
    private_key: Option<EncodingKey>,
}

impl GithubClient {
    pub fn new(api_base: String, app_id: String, private_key_pem: Option<&[u8]>) -> Result<Self> {
        let private_key = private_key_pem
            .map(EncodingKey::from_rsa_pem)
            .transpose()
            .map_err(|err| Error::source(ErrorKind::Integrity, err))?;

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .user_agent("runway-deployer")
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            app_id,
            private_key,
        })
    }

    fn app_jwt(&self) -> Result<String> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::custom(ErrorKind::Integrity, "no app private key configured"))?;

        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now,
            exp: now + APP_JWT_TTL_SECS,
            iss: self.app_id.clone(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
            .map_err(|err| Error::source(ErrorKind::Integrity, err))
    }

    /// Mint a fresh short-lived token for an installation, usable in HTTPS
    /// clone urls.
    pub async fn get_installation_access_token(
        &self,
        installation_id: i64,
    ) -> Result<InstallationToken> {
        let response = self
            .http
            .post(format!(
                "{}/app/installations/{installation_id}/access_tokens",
                self.api_base
            ))
            .bearer_auth(self.app_jwt()?)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    /// Fetch commit metadata by repository id and sha.
    pub async fn get_repository_commit(
        &self,
        token: &str,
        repo_id: i64,
        sha: &str,
    ) -> Result<Commit> {
        let response = self
            .http
            .get(format!("{}/repositories/{repo_id}/commits/{sha}", self.api_base))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?;

        let payload: Value = response.json().await?;

        let date = payload["commit"]["author"]["date"]
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok_or_else(|| Error::custom(ErrorKind::Integrity, "commit payload missing date"))?;

        Ok(Commit {
            sha: payload["sha"].as_str().unwrap_or(sha).to_string(),
            message: payload["commit"]["message"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            author: payload["author"]["login"]
                .as_str()
                .or_else(|| payload["commit"]["author"]["name"].as_str())
                .unwrap_or_default()
                .to_string(),
            date,
        })
    }
}

/// Verify an `X-Hub-Signature-256` header against the raw request body.
/// Comparison is constant-time.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &expected).is_ok()
}

/// Return a valid installation token, refreshing and re-encrypting the
/// cached one when it is missing or about to expire.
pub async fn fresh_installation_token(
    persistence: &Persistence,
    github: &GithubClient,
    secrets: &Key,
    installation_id: i64,
) -> Result<String> {
    if let Some(installation) = persistence.installation(installation_id).await? {
        if let (Some(ciphertext), Some(expires_at)) =
            (&installation.token, installation.token_expires_at)
        {
            if expires_at > Utc::now() + Duration::seconds(TOKEN_EXPIRY_BUFFER_SECS) {
                return Ok(secrets.open_token(ciphertext)?);
            }
        }
    }

    let minted = github.get_installation_access_token(installation_id).await?;
    persistence
        .store_installation_token(
            installation_id,
            &secrets.seal_token(&minted.token)?,
            minted.expires_at,
        )
        .await?;
    info!(installation_id, "installation token refreshed");

    Ok(minted.token)
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn signatures_verify_against_the_shared_secret() {
        let secret = "It's a Secret to Everybody";
        let body = b"Hello, World!";
        // Published reference vector for sha256 webhook signatures.
        let header =
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";

        assert!(verify_webhook_signature(secret, body, header));
        assert!(!verify_webhook_signature(secret, b"Hello, World", header));
        assert!(!verify_webhook_signature("other", body, header));
        assert!(!verify_webhook_signature(secret, body, "sha1=abc"));
        assert!(!verify_webhook_signature(secret, body, "sha256=zz"));
    }

    #[tokio::test]
    async fn commit_lookup_parses_the_provider_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repositories/42/commits/abc123"))
            .and(header("authorization", "Bearer tok_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sha": "abc123def",
                "author": { "login": "octocat" },
                "commit": {
                    "message": "Fix login flow",
                    "author": { "name": "The Octocat", "date": "2024-05-01T10:20:30Z" }
                }
            })))
            .mount(&server)
            .await;

        let client = GithubClient::new(server.uri(), "1234".to_string(), None).unwrap();
        let commit = client
            .get_repository_commit("tok_1", 42, "abc123")
            .await
            .unwrap();

        assert_eq!(commit.sha, "abc123def");
        assert_eq!(commit.message, "Fix login flow");
        assert_eq!(commit.author, "octocat");
        assert_eq!(commit.date.to_rfc3339(), "2024-05-01T10:20:30+00:00");
    }

    #[tokio::test]
    async fn token_requests_without_a_key_fail_closed() {
        let client =
            GithubClient::new("https://api.github.com".to_string(), "1234".to_string(), None)
                .unwrap();
        let err = client.get_installation_access_token(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}
