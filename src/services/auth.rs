use std::sync::Arc;

use bcrypt::{hash, verify};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::{AccessToken, NewUser, Role, User},
    storage::Store,
};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,          // user_id
    pub email: String,        // email at issue time
    pub name: Option<String>, // display name at issue time
    pub role: Role,           // informational only; checks read the store
    pub iss: String,          // issuer
    pub exp: i64,             // expiry
    pub iat: i64,             // issued at
}

/// Who the caller claims to be. Normalized against the store before use:
/// id first, then email, so a user row recreated under a new id still
/// resolves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
}

impl Identity {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            email: None,
        }
    }

    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            user_id: Uuid::parse_str(&claims.sub).ok(),
            email: Some(claims.email.clone()).filter(|e| !e.is_empty()),
        }
    }
}

pub async fn resolve_user(store: &dyn Store, identity: &Identity) -> AppResult<Option<User>> {
    if let Some(id) = identity.user_id {
        if let Some(user) = store.find_user_by_id(id).await? {
            return Ok(Some(user));
        }
    }
    match identity.email.as_deref() {
        Some(email) => store.find_user_by_email(email).await,
        None => Ok(None),
    }
}

/// Loads the caller and checks the role stored for them, not the one in the
/// token.
pub async fn require_admin(store: &dyn Store, identity: &Identity) -> AppResult<User> {
    match resolve_user(store, identity).await? {
        Some(user) if user.is_administrator() => Ok(user),
        _ => Err(AppError::Forbidden),
    }
}

pub fn hash_password(password: &str, cost: u32) -> AppResult<String> {
    hash(password, cost).map_err(|e| anyhow::anyhow!("Hash error: {}", e).into())
}

pub struct AuthService {
    store: Arc<dyn Store>,
    config: Arc<Config>,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    // User Registration
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> AppResult<(User, AccessToken)> {
        let email = email.trim().to_lowercase();

        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(AppError::UserAlreadyExists);
        }

        let password_hash = hash_password(password, self.config.security.bcrypt_cost)?;
        let user = self
            .store
            .create_user(NewUser {
                email,
                name: name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string),
                role: Role::User,
                password_hash,
            })
            .await?;

        tracing::info!("Registered user {}", user.id);

        let token = self.issue_token(&user)?;
        Ok((user, token))
    }

    // User Login
    pub async fn login(&self, email: &str, password: &str) -> AppResult<(User, AccessToken)> {
        let email = email.trim().to_lowercase();
        let user = self
            .store
            .find_user_by_email(&email)
            .await?
            .ok_or(AppError::InvalidCredentials)?;

        let password_hash = user
            .password_hash
            .as_deref()
            .ok_or(AppError::InvalidCredentials)?;
        let valid = verify(password, password_hash)
            .map_err(|e| anyhow::anyhow!("Verify error: {}", e))?;
        if !valid {
            return Err(AppError::InvalidCredentials);
        }

        let token = self.issue_token(&user)?;
        Ok((user, token))
    }

    // Token validation
    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let key = DecodingKey::from_secret(self.config.jwt.secret.as_bytes());
        let mut validation = Validation::default();
        validation.set_issuer(&[self.config.jwt.issuer.as_str()]);

        let token_data = decode::<Claims>(token, &key, &validation)?;
        Ok(token_data.claims)
    }

    pub fn issue_token(&self, user: &User) -> AppResult<AccessToken> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.jwt.token_ttl.as_secs() as i64);

        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            iss: self.config.jwt.issuer.clone(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };

        let key = EncodingKey::from_secret(self.config.jwt.secret.as_bytes());
        let access_token = encode(&Header::default(), &claims, &key)?;

        Ok(AccessToken {
            access_token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn service(store: Arc<MemoryStore>) -> AuthService {
        let mut config = Config::load();
        config.security.bcrypt_cost = 4;
        AuthService::new(store, Arc::new(config))
    }

    #[tokio::test]
    async fn register_then_login() {
        let store = Arc::new(MemoryStore::new());
        let auth = service(store.clone());

        let (user, token) = auth
            .register("Ada@Example.com", "correct horse", Some("Ada"))
            .await
            .unwrap();
        assert_eq!(user.email, "ada@example.com");

        let claims = auth.validate_token(&token.access_token).unwrap();
        assert_eq!(claims.sub, user.id.to_string());

        let (again, _) = auth.login("ada@example.com", "correct horse").await.unwrap();
        assert_eq!(again.id, user.id);
        assert!(matches!(
            auth.login("ada@example.com", "wrong").await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let auth = service(store);
        auth.register("a@example.com", "password1", None).await.unwrap();
        assert!(matches!(
            auth.register("a@example.com", "password2", None).await,
            Err(AppError::UserAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn identity_falls_back_to_email() {
        let store = MemoryStore::new();
        let user = store.insert_user("b@example.com", None, Role::User).await;
        let identity = Identity {
            user_id: Some(Uuid::new_v4()),
            email: Some("b@example.com".to_string()),
        };

        let resolved = resolve_user(&store, &identity).await.unwrap().unwrap();

        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn admin_check_reads_the_store() {
        let store = MemoryStore::new();
        let user = store.insert_user("c@example.com", None, Role::User).await;
        let admin = store
            .insert_user("root@example.com", None, Role::Administrator)
            .await;

        assert!(matches!(
            require_admin(&store, &Identity::user(user.id)).await,
            Err(AppError::Forbidden)
        ));
        assert!(require_admin(&store, &Identity::user(admin.id)).await.is_ok());
    }
}
