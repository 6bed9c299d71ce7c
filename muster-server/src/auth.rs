// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Validation};
use muster_common::error::CoreError;
use muster_common::model::UserRole;
use muster_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub role: UserRole,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid authentication credentials")]
    InvalidCredentials,
    #[error("Token has expired")]
    TokenExpired,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Username already exists: {0}")]
    UserExists(String),
    #[error("Internal auth error: {0}")]
    Internal(String),
}

impl SafeDisplay for AuthError {
    fn to_safe_string(&self) -> String {
        match self {
            // never echo internals to a caller
            AuthError::Internal(_) => "Internal auth error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<AuthError> for CoreError {
    fn from(value: AuthError) -> Self {
        CoreError::Unauthorized(value.to_safe_string())
    }
}

#[derive(Debug, Deserialize)]
struct UsersFile {
    users: Vec<UserRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    name: String,
    /// Already an argon2 hash; plaintext never reaches the file.
    password: String,
    role: UserRole,
}

/// The local user table. Passwords are stored as salted argon2 hashes only.
pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
    simulation: bool,
}

impl UserStore {
    pub fn new(simulation: bool) -> Self {
        let store = Self {
            users: RwLock::new(HashMap::new()),
            simulation,
        };
        if simulation {
            warn!(
                "User store is in simulation mode. Unknown users will be authenticated and created on first contact."
            );
            store
                .register_user("server", "server", UserRole::Server)
                .expect("fresh store accepts the simulation server user");
        }
        store
    }

    pub fn from_file(path: &Path, simulation: bool) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            CoreError::ClientConfiguration(format!("Cannot read users file {path:?}: {err}"))
        })?;
        let parsed: UsersFile = toml::from_str(&raw).map_err(|err| {
            CoreError::ClientConfiguration(format!("Cannot parse users file {path:?}: {err}"))
        })?;

        let store = Self::new(simulation);
        for record in parsed.users {
            store
                .add_hashed_user(&record.name, &record.password, record.role)
                .map_err(|err| CoreError::ClientConfiguration(err.to_safe_string()))?;
        }
        Ok(store)
    }

    pub fn register_user(
        &self,
        username: &str,
        password: &str,
        role: UserRole,
    ) -> Result<User, AuthError> {
        let hash = hash_password(password)?;
        self.add_hashed_user(username, &hash, role)
    }

    fn add_hashed_user(
        &self,
        username: &str,
        password_hash: &str,
        role: UserRole,
    ) -> Result<User, AuthError> {
        let mut users = self.users.write().expect("user table poisoned");
        if users.contains_key(username) {
            return Err(AuthError::UserExists(username.to_string()));
        }
        let user = User {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            role,
        };
        users.insert(username.to_string(), user.clone());
        Ok(user)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let user = match self.get_user(username) {
            Some(user) => user,
            None if self.simulation => self
                .register_user(username, password, UserRole::Client)
                .or_else(|_| self.get_user(username).ok_or(AuthError::InvalidCredentials))?,
            None => return Err(AuthError::InvalidCredentials),
        };

        if self.simulation {
            return Ok(user);
        }

        if verify_password(password, &user.password_hash) {
            info!(username, role = %user.role, "Authentication successful");
            Ok(user)
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    pub fn get_user(&self, username: &str) -> Option<User> {
        self.users
            .read()
            .expect("user table poisoned")
            .get(username)
            .cloned()
    }

    pub fn role_of(&self, username: &str) -> Option<UserRole> {
        self.get_user(username).map(|user| user.role)
    }
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Internal(err.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Mints and verifies signed bearer tokens. The signing secret is generated
/// per process; tokens do not survive a server restart, matching the
/// in-memory operation state.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        let secret: [u8; 32] = rand::random();
        Self::with_secret(&secret, ttl)
    }

    pub fn with_secret(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn mint(&self, username: &str) -> Result<String, AuthError> {
        self.mint_at(username, Utc::now().timestamp())
    }

    pub fn mint_at(&self, username: &str, issued_at: i64) -> Result<String, AuthError> {
        let claims = Claims {
            sub: username.to_string(),
            iat: issued_at,
            exp: issued_at + self.ttl.as_secs() as i64,
        };
        jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &self.encoding)
            .map_err(|err| AuthError::Internal(err.to_string()))
    }

    /// Returns the subject username of a valid token.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        validation.validate_exp = true;

        match jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims.sub),
            Err(err) => match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthError::TokenExpired),
                _ => Err(AuthError::InvalidToken),
            },
        }
    }
}

/// The bearer token wire shape of the `/token` and `/storage-token`
/// endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenReply {
    pub access_token: String,
    pub token_type: String,
}

impl TokenReply {
    pub fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
        }
    }
}

/// Creates a users file record for tooling and tests.
pub fn hashed_record(name: &str, password: &str, role: UserRole) -> Result<String, AuthError> {
    let hash = hash_password(password)?;
    Ok(format!(
        "[[users]]\nname = \"{name}\"\npassword = \"{hash}\"\nrole = \"{role}\"\n"
    ))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert_ne!(hash, "hunter2");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn authenticate_checks_credentials() {
        let store = UserStore::new(false);
        store
            .register_user("site-1", "secret", UserRole::Client)
            .unwrap();

        assert!(store.authenticate("site-1", "secret").is_ok());
        assert!(matches!(
            store.authenticate("site-1", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            store.authenticate("unknown", "secret"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn duplicate_usernames_are_rejected() {
        let store = UserStore::new(false);
        store.register_user("site-1", "a", UserRole::Client).unwrap();
        assert!(matches!(
            store.register_user("site-1", "b", UserRole::Client),
            Err(AuthError::UserExists(_))
        ));
    }

    #[test]
    fn simulation_mode_creates_users_on_first_contact() {
        let store = UserStore::new(true);
        let user = store.authenticate("new-site", "anything").unwrap();
        assert_eq!(user.role, UserRole::Client);
        // the simulation server user exists as well
        assert_eq!(store.role_of("server"), Some(UserRole::Server));
    }

    #[test]
    fn token_verifies_within_ttl_and_fails_outside() {
        let issuer = TokenIssuer::with_secret(b"test-secret", Duration::from_secs(60));
        let now = Utc::now().timestamp();

        let valid = issuer.mint_at("site-1", now).unwrap();
        assert_eq!(issuer.verify(&valid).unwrap(), "site-1");

        let expired = issuer.mint_at("site-1", now - 120).unwrap();
        assert!(matches!(issuer.verify(&expired), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let issuer = TokenIssuer::with_secret(b"test-secret", Duration::from_secs(60));
        assert!(matches!(
            issuer.verify("not-a-token"),
            Err(AuthError::InvalidToken)
        ));

        let other = TokenIssuer::with_secret(b"other-secret", Duration::from_secs(60));
        let token = other.mint("site-1").unwrap();
        assert!(matches!(issuer.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn users_file_round_trip() {
        let record = hashed_record("site-1", "secret", UserRole::Client).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.toml");
        std::fs::write(&path, record).unwrap();

        let store = UserStore::from_file(&path, false).unwrap();
        assert!(store.authenticate("site-1", "secret").is_ok());
    }
}
