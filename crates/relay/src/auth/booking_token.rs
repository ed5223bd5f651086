use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a booking token. `sub` is the session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingClaims {
    pub sub: String,
    pub driver_id: i64,
    pub booking_id: String,
    pub partition_no: u32,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Decoded view of a booking token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSession {
    pub session_id: String,
    pub driver_id: i64,
    pub booking_id: String,
    pub partition: u32,
}

impl From<&BookingClaims> for BookingSession {
    fn from(claims: &BookingClaims) -> Self {
        Self {
            session_id: claims.sub.clone(),
            driver_id: claims.driver_id,
            booking_id: claims.booking_id.clone(),
            partition: claims.partition_no,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

impl IssuedToken {
    pub fn expires_in(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

#[derive(Clone)]
pub struct BookingTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl BookingTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("booking token secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "nbf", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Signs a token valid from `issued_at` for `lifetime_secs`.
    pub fn issue_at(
        &self,
        session: &BookingSession,
        issued_at: i64,
        lifetime_secs: i64,
    ) -> anyhow::Result<IssuedToken> {
        let claims = BookingClaims {
            sub: session.session_id.clone(),
            driver_id: session.driver_id,
            booking_id: session.booking_id.clone(),
            partition_no: session.partition,
            iat: issued_at,
            nbf: issued_at,
            exp: issued_at + lifetime_secs,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode booking token")?;
        Ok(IssuedToken { token, expires_at: claims.exp })
    }

    pub fn validate(&self, token: &str) -> anyhow::Result<BookingClaims> {
        let claims = decode::<BookingClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode booking token")?
            .claims;

        if claims.sub.trim().is_empty() || claims.booking_id.trim().is_empty() {
            bail!("booking token is missing its session or booking id");
        }

        Ok(claims)
    }
}

pub fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    use super::{current_unix_timestamp, BookingSession, BookingTokenService};

    const TEST_SECRET: &str = "trackcast_test_secret_that_is_definitely_long_enough";

    fn session() -> BookingSession {
        BookingSession {
            session_id: "session-1".to_string(),
            driver_id: 7,
            booking_id: "B1".to_string(),
            partition: 3,
        }
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(BookingTokenService::new("short").is_err());
    }

    #[test]
    fn issues_and_validates_booking_tokens() {
        let service = BookingTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("clock");

        let issued = service.issue_at(&session(), now, 600).expect("token should be issued");
        let claims = service.validate(&issued.token).expect("token should validate");

        assert_eq!(BookingSession::from(&claims), session());
        assert_eq!(claims.nbf, now);
        assert_eq!(claims.exp, now + 600);
        assert_eq!(issued.expires_in(now), 600);
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = BookingTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("clock");
        let issued = service.issue_at(&session(), now, 600).expect("token should be issued");

        assert!(service.validate(&format!("{}x", issued.token)).is_err());
        let other = BookingTokenService::new("another_secret_that_is_also_long_enough!")
            .expect("service should initialize");
        assert!(other.validate(&issued.token).is_err());
    }

    #[test]
    fn rejects_expired_and_not_yet_valid_tokens() {
        let service = BookingTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("clock");

        let expired = service.issue_at(&session(), now - 601, 600).expect("issued");
        assert!(service.validate(&expired.token).is_err());

        let future = service.issue_at(&session(), now + 600, 600).expect("issued");
        assert!(service.validate(&future.token).is_err());
    }

    #[test]
    fn rejects_tokens_without_session_id() {
        let service = BookingTokenService::new(TEST_SECRET).expect("service should initialize");
        let now = current_unix_timestamp().expect("clock");
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({
                "sub": "",
                "driver_id": 7,
                "booking_id": "B1",
                "partition_no": 0,
                "iat": now,
                "nbf": now,
                "exp": now + 60,
            }),
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(service.validate(&token).is_err());
    }
}
