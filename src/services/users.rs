use std::sync::Arc;

use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{NewUser, Role, User, UserChanges},
    services::auth::{hash_password, require_admin, Identity},
    storage::Store,
};

/// Fields an administrator may set on a user. `None` leaves a field as is;
/// a blank name clears it.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub password: Option<String>,
}

pub struct UserAdminService {
    store: Arc<dyn Store>,
    bcrypt_cost: u32,
}

impl UserAdminService {
    pub fn new(store: Arc<dyn Store>, bcrypt_cost: u32) -> Self {
        Self { store, bcrypt_cost }
    }

    pub async fn list_users(&self, admin: &Identity) -> AppResult<Vec<User>> {
        require_admin(self.store.as_ref(), admin).await?;
        self.store.list_users().await
    }

    pub async fn get_user(&self, admin: &Identity, id: Uuid) -> AppResult<User> {
        require_admin(self.store.as_ref(), admin).await?;
        self.store
            .find_user_by_id(id)
            .await?
            .ok_or(AppError::UserNotFound)
    }

    pub async fn create_user(
        &self,
        admin: &Identity,
        email: &str,
        password: &str,
        name: Option<&str>,
        role: Role,
    ) -> AppResult<User> {
        require_admin(self.store.as_ref(), admin).await?;

        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(AppError::Validation("Email is required".to_string()));
        }

        let user = self
            .store
            .create_user(NewUser {
                email,
                name: name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string),
                role,
                password_hash: hash_password(password, self.bcrypt_cost)?,
            })
            .await?;
        tracing::info!("Administrator created user {}", user.id);
        Ok(user)
    }

    pub async fn update_user(
        &self,
        admin: &Identity,
        id: Uuid,
        update: UserUpdate,
    ) -> AppResult<User> {
        require_admin(self.store.as_ref(), admin).await?;

        let mut changes = UserChanges {
            name: update
                .name
                .map(|n| Some(n.trim().to_string()).filter(|n| !n.is_empty())),
            role: update.role,
            ..Default::default()
        };
        if let Some(email) = update.email {
            let email = email.trim().to_lowercase();
            if email.is_empty() {
                return Err(AppError::Validation("Email cannot be empty".to_string()));
            }
            changes.email = Some(email);
        }
        if let Some(password) = update.password.filter(|p| !p.is_empty()) {
            changes.password_hash = Some(hash_password(&password, self.bcrypt_cost)?);
        }
        if changes.is_empty() {
            return Err(AppError::Validation("No fields to update".to_string()));
        }

        if changes.role == Some(Role::User) {
            self.guard_last_administrator(id).await?;
        }

        self.store
            .update_user(id, changes)
            .await?
            .ok_or(AppError::UserNotFound)
    }

    pub async fn delete_user(&self, admin: &Identity, id: Uuid) -> AppResult<()> {
        let acting = require_admin(self.store.as_ref(), admin).await?;
        if acting.id == id {
            return Err(AppError::CannotDeleteSelf);
        }

        self.guard_last_administrator(id).await?;

        if !self.store.delete_user(id).await? {
            return Err(AppError::UserNotFound);
        }
        tracing::info!("Administrator {} deleted user {}", acting.id, id);
        Ok(())
    }

    /// Fails if `id` is the only remaining administrator.
    async fn guard_last_administrator(&self, id: Uuid) -> AppResult<()> {
        let target = self
            .store
            .find_user_by_id(id)
            .await?
            .ok_or(AppError::UserNotFound)?;
        if target.is_administrator() && self.store.count_administrators().await? <= 1 {
            return Err(AppError::LastAdministrator);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, UserAdminService, User) {
        let store = Arc::new(MemoryStore::new());
        let admin = store
            .insert_user("root@example.com", Some("Root"), Role::Administrator)
            .await;
        let service = UserAdminService::new(store.clone(), 4);
        (store, service, admin)
    }

    #[tokio::test]
    async fn administrators_cannot_delete_themselves() {
        let (_store, service, admin) = setup().await;
        let result = service.delete_user(&Identity::user(admin.id), admin.id).await;
        assert!(matches!(result, Err(AppError::CannotDeleteSelf)));
    }

    #[tokio::test]
    async fn last_administrator_cannot_be_demoted() {
        let (_store, service, admin) = setup().await;
        let result = service
            .update_user(
                &Identity::user(admin.id),
                admin.id,
                UserUpdate {
                    role: Some(Role::User),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::LastAdministrator)));
    }

    #[tokio::test]
    async fn last_administrator_cannot_be_deleted_by_a_demoted_peer() {
        let (store, service, admin) = setup().await;
        let other = store
            .insert_user("ops@example.com", None, Role::Administrator)
            .await;
        service
            .update_user(
                &Identity::user(other.id),
                other.id,
                UserUpdate {
                    role: Some(Role::User),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = service.delete_user(&Identity::user(other.id), admin.id).await;

        assert!(matches!(result, Err(AppError::Forbidden)));
    }

    #[tokio::test]
    async fn empty_updates_are_rejected() {
        let (store, service, admin) = setup().await;
        let user = store.insert_user("u@example.com", None, Role::User).await;
        let result = service
            .update_user(&Identity::user(admin.id), user.id, UserUpdate::default())
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn blank_name_clears_it() {
        let (store, service, admin) = setup().await;
        let user = store.insert_user("u@example.com", Some("U"), Role::User).await;
        let updated = service
            .update_user(
                &Identity::user(admin.id),
                user.id,
                UserUpdate {
                    name: Some("   ".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, None);
    }
}
