//! User management service.
//!
//! Owns credential storage and role membership for one realm. Cross-engine
//! cleanup on delete (tokens, sessions, MFA state, lockouts) is driven by the
//! realm orchestrator reacting to the returned user, not by this service.

use chrono::Utc;
use realmgate_core::clock::SharedClock;
use realmgate_core::error::{Error, Result};
use realmgate_core::id::UserId;
use realmgate_core::interfaces::Hasher;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::user::{Role, User, UserStatus, UserStore};

/// Input for user creation
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: String,
    pub roles: Vec<String>,
}

/// Partial update; `None` leaves the field untouched
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: Option<UserStatus>,
}

/// User management for one realm
pub struct UserService<S: UserStore + ?Sized> {
    realm: String,
    store: Arc<S>,
    hasher: Arc<dyn Hasher>,
    clock: SharedClock,
}

impl<S: UserStore + ?Sized> UserService<S> {
    pub fn new(realm: impl Into<String>, store: Arc<S>, hasher: Arc<dyn Hasher>, clock: SharedClock) -> Self {
        Self {
            realm: realm.into(),
            store,
            hasher,
            clock,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Create a user. Every requested role must already be defined in the realm.
    pub async fn create_user(&self, input: NewUser) -> Result<User> {
        let mut roles = BTreeSet::new();
        for role in &input.roles {
            if self.store.find_role(&self.realm, role).await?.is_none() {
                return Err(Error::RoleNotFound { name: role.clone() });
            }
            roles.insert(role.clone());
        }

        let now = self.clock.now();
        let user = User {
            id: UserId::new(),
            realm: self.realm.clone(),
            email: input.email,
            phone: input.phone,
            password_hash: self.hasher.hash(&input.password)?,
            status: UserStatus::Active,
            roles,
            created_at: now,
            updated_at: now,
        };

        self.store.insert(&user).await?;
        tracing::info!(realm = %self.realm, user_id = %user.id, "User created");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<User> {
        self.store
            .get(user_id)
            .await?
            .filter(|u| u.realm == self.realm)
            .ok_or(Error::UserNotFound)
    }

    /// Resolve a login identifier (email first, then phone)
    pub async fn find_by_identifier(&self, identifier: &str) -> Result<Option<User>> {
        if let Some(user) = self.store.find_by_email(&self.realm, identifier).await? {
            return Ok(Some(user));
        }
        self.store.find_by_phone(&self.realm, identifier).await
    }

    pub async fn update_user(&self, user_id: UserId, update: UserUpdate) -> Result<User> {
        let mut user = self.get_user(user_id).await?;

        if let Some(email) = update.email {
            user.email = Some(email);
        }
        if let Some(phone) = update.phone {
            user.phone = Some(phone);
        }
        if let Some(status) = update.status {
            user.status = status;
        }
        user.updated_at = self.clock.now();

        self.store.update(&user).await?;
        Ok(user)
    }

    pub async fn set_password(&self, user_id: UserId, new_password: &str) -> Result<User> {
        let mut user = self.get_user(user_id).await?;
        user.password_hash = self.hasher.hash(new_password)?;
        user.updated_at = self.clock.now();
        self.store.update(&user).await?;
        Ok(user)
    }

    /// Delete a user and return the removed row for cascade handling
    pub async fn delete_user(&self, user_id: UserId) -> Result<User> {
        let user = self.get_user(user_id).await?;
        self.store.delete(user_id).await?;
        tracing::info!(realm = %self.realm, user_id = %user_id, "User deleted");
        Ok(user)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.store.list(&self.realm).await
    }

    /// Verify a presented password. Unknown user and bad password are
    /// indistinguishable to the caller.
    pub async fn verify_credentials(&self, identifier: &str, password: &str) -> Result<User> {
        let user = self
            .find_by_identifier(identifier)
            .await?
            .ok_or(Error::InvalidCredentials)?;

        if !self.hasher.verify(password, &user.password_hash)? {
            return Err(Error::InvalidCredentials);
        }
        Ok(user)
    }

    // === Roles ===

    pub async fn define_role(&self, name: &str, description: Option<&str>) -> Result<Role> {
        let role = Role {
            realm: self.realm.clone(),
            name: name.to_string(),
            description: description.map(String::from),
            created_at: Utc::now(),
        };
        self.store.insert_role(&role).await?;
        Ok(role)
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        self.store.list_roles(&self.realm).await
    }

    /// Assign a role; assigning the same role twice leaves a single instance
    pub async fn assign_role(&self, user_id: UserId, role: &str) -> Result<User> {
        if self.store.find_role(&self.realm, role).await?.is_none() {
            return Err(Error::RoleNotFound {
                name: role.to_string(),
            });
        }

        let mut user = self.get_user(user_id).await?;
        if user.roles.insert(role.to_string()) {
            user.updated_at = self.clock.now();
            self.store.update(&user).await?;
        }
        Ok(user)
    }

    pub async fn remove_role(&self, user_id: UserId, role: &str) -> Result<User> {
        let mut user = self.get_user(user_id).await?;
        if user.roles.remove(role) {
            user.updated_at = self.clock.now();
            self.store.update(&user).await?;
        }
        Ok(user)
    }
}
