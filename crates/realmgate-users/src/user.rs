//! User and role entities plus their storage contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use realmgate_core::error::{Error, Result};
use realmgate_core::id::UserId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// User status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Active,
    Disabled,
}

/// User entity, scoped to exactly one realm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub realm: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password_hash: String,
    pub status: UserStatus,
    /// Role names held by this user; descriptive, deduplicated
    pub roles: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// The identifier shown in logs and used for lockout bookkeeping
    pub fn identifier(&self) -> String {
        self.email
            .clone()
            .or_else(|| self.phone.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Role entity; `(realm, name)` unique, descriptive only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub realm: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Storage contract for users and roles
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user, enforcing `(realm, email)` and `(realm, phone)` uniqueness
    async fn insert(&self, user: &User) -> Result<()>;

    /// Update a user, re-checking uniqueness against other rows
    async fn update(&self, user: &User) -> Result<()>;

    async fn delete(&self, user_id: UserId) -> Result<()>;

    async fn get(&self, user_id: UserId) -> Result<Option<User>>;

    async fn find_by_email(&self, realm: &str, email: &str) -> Result<Option<User>>;

    async fn find_by_phone(&self, realm: &str, phone: &str) -> Result<Option<User>>;

    async fn list(&self, realm: &str) -> Result<Vec<User>>;

    async fn insert_role(&self, role: &Role) -> Result<()>;

    async fn find_role(&self, realm: &str, name: &str) -> Result<Option<Role>>;

    async fn list_roles(&self, realm: &str) -> Result<Vec<Role>>;

    async fn delete_role(&self, realm: &str, name: &str) -> Result<()>;
}

/// In-memory user store
pub struct InMemoryUserStore {
    users: RwLock<HashMap<UserId, User>>,
    roles: RwLock<HashMap<(String, String), Role>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
        }
    }

    fn check_unique(
        users: &HashMap<UserId, User>,
        candidate: &User,
        skip_self: bool,
    ) -> Result<()> {
        for user in users.values() {
            if skip_self && user.id == candidate.id {
                continue;
            }
            if user.realm != candidate.realm {
                continue;
            }
            if candidate.email.is_some() && user.email == candidate.email {
                return Err(Error::EmailAlreadyExists);
            }
            if candidate.phone.is_some() && user.phone == candidate.phone {
                return Err(Error::PhoneAlreadyExists);
            }
        }
        Ok(())
    }
}

impl Default for InMemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn insert(&self, user: &User) -> Result<()> {
        let mut users = self.users.write();
        Self::check_unique(&users, user, false)?;
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<()> {
        let mut users = self.users.write();
        if !users.contains_key(&user.id) {
            return Err(Error::UserNotFound);
        }
        Self::check_unique(&users, user, true)?;
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete(&self, user_id: UserId) -> Result<()> {
        self.users.write().remove(&user_id);
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> Result<Option<User>> {
        Ok(self.users.read().get(&user_id).cloned())
    }

    async fn find_by_email(&self, realm: &str, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.realm == realm && u.email.as_deref() == Some(email))
            .cloned())
    }

    async fn find_by_phone(&self, realm: &str, phone: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.realm == realm && u.phone.as_deref() == Some(phone))
            .cloned())
    }

    async fn list(&self, realm: &str) -> Result<Vec<User>> {
        let mut users: Vec<User> = self
            .users
            .read()
            .values()
            .filter(|u| u.realm == realm)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn insert_role(&self, role: &Role) -> Result<()> {
        let mut roles = self.roles.write();
        let key = (role.realm.clone(), role.name.clone());
        if roles.contains_key(&key) {
            return Err(Error::integrity(format!(
                "role '{}' already exists",
                role.name
            )));
        }
        roles.insert(key, role.clone());
        Ok(())
    }

    async fn find_role(&self, realm: &str, name: &str) -> Result<Option<Role>> {
        Ok(self
            .roles
            .read()
            .get(&(realm.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_roles(&self, realm: &str) -> Result<Vec<Role>> {
        let mut roles: Vec<Role> = self
            .roles
            .read()
            .values()
            .filter(|r| r.realm == realm)
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn delete_role(&self, realm: &str, name: &str) -> Result<()> {
        self.roles
            .write()
            .remove(&(realm.to_string(), name.to_string()));
        Ok(())
    }
}
