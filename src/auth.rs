use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::warn;

use crate::{
    protocol::ErrorCode,
    settings::Settings,
    state::{AppError, AppResult},
};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity attached to a connection once the bearer token checks out.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub is_anonymous: bool,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    is_anonymous: bool,
}

#[derive(Debug, Deserialize)]
struct ProviderUser {
    id: String,
    #[serde(default)]
    is_anonymous: bool,
}

/// Local verification against the configured signing secret. The issuer
/// signs with HS256; expiry is enforced, audience is not pinned.
pub fn verify_local(secret: &str, token: &str) -> Result<AuthedUser, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(AuthedUser {
        user_id: data.claims.sub,
        is_anonymous: data.claims.is_anonymous,
    })
}

/// Verifies a bearer token: locally when a signing secret is configured
/// (cheap, no network), otherwise against the external auth provider. A
/// local failure still falls back to the provider, since key rotation can
/// leave valid tokens the local secret no longer matches.
pub async fn verify_bearer(
    settings: &Settings,
    http: &reqwest::Client,
    token: &str,
) -> AppResult<AuthedUser> {
    if token.is_empty() {
        return Err(AppError::code(ErrorCode::Unauthorized));
    }

    if let Some(secret) = &settings.auth_jwt_secret {
        match verify_local(secret, token) {
            Ok(user) => return Ok(user),
            Err(err) => {
                warn!("local token verification failed, trying provider: {err}");
            }
        }
    }

    let Some(provider_url) = &settings.auth_provider_url else {
        return Err(AppError::code(ErrorCode::Unauthorized));
    };

    let response = http
        .get(provider_url)
        .bearer_auth(token)
        .timeout(PROVIDER_TIMEOUT)
        .send()
        .await
        .map_err(|err| {
            warn!("auth provider unreachable: {err}");
            AppError::code(ErrorCode::Unauthorized)
        })?;

    if !response.status().is_success() {
        return Err(AppError::code(ErrorCode::Unauthorized));
    }

    let user: ProviderUser = response
        .json()
        .await
        .map_err(|_| AppError::code(ErrorCode::Unauthorized))?;
    Ok(AuthedUser {
        user_id: user.id,
        is_anonymous: user.is_anonymous,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        is_anonymous: bool,
        exp: u64,
        aud: String,
    }

    fn token(secret: &str, sub: &str, anonymous: bool, exp: u64) -> String {
        encode(
            &Header::default(),
            &TestClaims {
                sub: sub.to_owned(),
                is_anonymous: anonymous,
                exp,
                aud: "authenticated".to_owned(),
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> u64 {
        4_102_444_800 // 2100-01-01
    }

    #[test]
    fn accepts_a_valid_token_and_reads_the_identity() {
        let token = token("s3cret", "user-1", false, far_future());
        let user = verify_local("s3cret", &token).unwrap();
        assert_eq!(user.user_id, "user-1");
        assert!(!user.is_anonymous);
    }

    #[test]
    fn carries_the_anonymity_flag() {
        let token = token("s3cret", "anon-7", true, far_future());
        assert!(verify_local("s3cret", &token).unwrap().is_anonymous);
    }

    #[test]
    fn rejects_a_wrong_secret_and_an_expired_token() {
        let good = token("s3cret", "user-1", false, far_future());
        assert!(verify_local("other", &good).is_err());

        let expired = token("s3cret", "user-1", false, 1_000_000);
        assert!(verify_local("s3cret", &expired).is_err());
    }
}
