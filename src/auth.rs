// src/auth.rs
use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::validate;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const DEFAULT_PASSWORD_ROUNDS: u32 = 600_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: i64,
    exp: usize,
}

/// Signs and checks session tokens. A token names the user id and expires
/// after the configured lifetime.
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey<'static>,
    ttl: Duration,
}

impl SessionKeys {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        SessionKeys {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret).into_static(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, user_id: i64) -> Result<String, AppError> {
        let claims = Claims {
            sub: user_id,
            exp: (Utc::now() + self.ttl).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("failed to sign session: {}", e)))
    }

    pub fn verify(&self, token: &str) -> Result<i64, AppError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims.sub)
            .map_err(|_| AppError::auth("login required"))
    }
}

/// PBKDF2-HMAC-SHA256, encoded as `pbkdf2:sha256:<rounds>$<salt>$<hash>`.
pub fn hash_password(password: &str, rounds: u32) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut out);
    format!(
        "pbkdf2:sha256:{}${}${}",
        rounds,
        hex::encode(salt),
        hex::encode(out)
    )
}

pub fn verify_password(encoded: &str, password: &str) -> bool {
    let Some(rest) = encoded.strip_prefix("pbkdf2:sha256:") else {
        return false;
    };
    let mut parts = rest.split('$');
    let (Some(rounds), Some(salt), Some(expected), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(rounds), Ok(salt), Ok(expected)) =
        (rounds.parse::<u32>(), hex::decode(salt), hex::decode(expected))
    else {
        return false;
    };
    if expected.len() != HASH_LEN {
        return false;
    }

    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut out);
    out.iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Creates an account and returns its id. Checks run in order: username,
/// password, confirmation match, username availability.
pub async fn register(
    pool: &DbPool,
    username: Option<&str>,
    password: Option<&str>,
    confirmation: Option<&str>,
    rounds: u32,
) -> Result<i64, AppError> {
    let username = validate::required(username.map(str::trim), "must provide username")?;
    let password = validate::required(password, "must provide password")?;
    if confirmation != Some(password) {
        return Err(AppError::validation("passwords do not match"));
    }
    if db::find_user_by_name(pool, username).await?.is_some() {
        return Err(AppError::validation("username already in use"));
    }

    let hash = hash_password(password, rounds);
    let user_id = db::create_user(pool, username, &hash).await?;
    info!("Registered user {} as id {}", username, user_id);
    Ok(user_id)
}

pub async fn login(
    pool: &DbPool,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<i64, AppError> {
    let username = username
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::auth("must provide username"))?;
    let password = password
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::auth("must provide password"))?;

    match db::find_user_by_name(pool, username).await? {
        Some(user) if verify_password(&user.hash, password) => {
            info!("User {} ({}) logged in", user.username, user.id);
            Ok(user.id)
        }
        _ => Err(AppError::auth("invalid username and/or password")),
    }
}
