// Driver and admin identity tokens.
//
// Identity is established upstream; the relay only verifies the HS256
// bearer token it is handed and reads the numeric subject and role.

use anyhow::{bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::booking_token::current_unix_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityClaims {
    sub: String,
    role: Role,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Driver(i64),
    Admin(i64),
}

impl Identity {
    pub fn role(self) -> Role {
        match self {
            Self::Driver(_) => Role::Driver,
            Self::Admin(_) => Role::Admin,
        }
    }

    pub fn id(self) -> i64 {
        match self {
            Self::Driver(id) | Self::Admin(id) => id,
        }
    }
}

#[derive(Clone)]
pub struct IdentityTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl IdentityTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("identity token secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue(&self, identity: Identity, lifetime_secs: i64) -> anyhow::Result<String> {
        let issued_at = current_unix_timestamp()?;
        let claims = IdentityClaims {
            sub: identity.id().to_string(),
            role: identity.role(),
            iat: issued_at,
            exp: issued_at + lifetime_secs,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode identity token")
    }

    pub fn validate(&self, token: &str) -> anyhow::Result<Identity> {
        let claims = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode identity token")?
            .claims;

        let id = claims
            .sub
            .parse::<i64>()
            .with_context(|| format!("identity token subject '{}' is not numeric", claims.sub))?;

        Ok(match claims.role {
            Role::Driver => Identity::Driver(id),
            Role::Admin => Identity::Admin(id),
        })
    }
}
