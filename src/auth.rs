use std::time::{Duration, SystemTime, SystemTimeError, UNIX_EPOCH};

use crate::conf::ConfJwt;

use super::jwt;

#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
pub struct Claims {
    /// Email of the authenticated user.
    pub sub: String,
    exp: u64,
    aud: String,
    iss: String,
}

impl Claims {
    pub fn new(
        sub: &str,
        ttl: Duration,
        jwt_conf: &ConfJwt,
    ) -> Result<Self, SystemTimeError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let exp = now.saturating_add(ttl).as_secs();
        Ok(Self {
            sub: sub.to_string(),
            exp,
            aud: jwt_conf.audience.clone(),
            iss: jwt_conf.issuer.clone(),
        })
    }

    pub fn to_str(&self, jwt_conf: &ConfJwt) -> jwt::Result<String> {
        jwt::encode(self, jwt_conf)
    }

    pub fn from_str(str: &str, jwt_conf: &ConfJwt) -> jwt::Result<Self> {
        jwt::decode::<Self>(str, jwt_conf)
    }
}

pub fn hash_password(plain: &str, cost: u32) -> anyhow::Result<String> {
    let hashed = bcrypt::hash(plain, cost)?;
    Ok(hashed)
}

/// Treats an unparseable stored hash as a mismatch.
pub fn verify_password(plain: &str, hashed: &str) -> bool {
    bcrypt::verify(plain, hashed).unwrap_or(false)
}
