// src/storage/users.rs

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::security::user::User;
use crate::storage::{Bucket, Store, StoreError};

/// User record persistence
///
/// Writes that depend on a prior read (unique usernames, first-user setup)
/// run under one write lock shared by every clone.
#[derive(Clone)]
pub struct UserStore {
    store: Store,
    write_lock: Arc<Mutex<()>>,
}

impl UserStore {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .store
            .list_json::<User>(Bucket::Users)?
            .into_iter()
            .find(|u| u.username == username))
    }

    /// Inserts a user; fails if the username is taken
    pub fn create(&self, user: &User) -> Result<(), StoreError> {
        let _guard = self.writer();
        if self.find_by_username(&user.username)?.is_some() {
            return Err(StoreError::UserAlreadyExists(user.username.clone()));
        }
        self.store.put_json(Bucket::Users, &user.id, user)
    }

    /// Inserts `user` only if no user exists yet; returns whether it did
    pub fn create_if_empty(&self, user: &User) -> Result<bool, StoreError> {
        let _guard = self.writer();
        if self.store.count(Bucket::Users)? > 0 {
            return Ok(false);
        }
        self.store.put_json(Bucket::Users, &user.id, user)?;
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Result<User, StoreError> {
        self.store
            .get_json(Bucket::Users, id)?
            .ok_or_else(|| StoreError::not_found(Bucket::Users, id))
    }

    pub fn get_by_username(&self, username: &str) -> Result<User, StoreError> {
        self.find_by_username(username)?
            .ok_or_else(|| StoreError::not_found(Bucket::Users, username))
    }

    /// Replaces an existing user and bumps `updated_at`
    pub fn update(&self, user: &mut User) -> Result<(), StoreError> {
        let _guard = self.writer();
        if !self.store.exists(Bucket::Users, &user.id)? {
            return Err(StoreError::not_found(Bucket::Users, &user.id));
        }
        if let Some(other) = self.find_by_username(&user.username)? {
            if other.id != user.id {
                return Err(StoreError::UserAlreadyExists(user.username.clone()));
            }
        }
        user.updated_at = Utc::now();
        self.store.put_json(Bucket::Users, &user.id, user)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.writer();
        if self.store.delete(Bucket::Users, id)? {
            Ok(())
        } else {
            Err(StoreError::not_found(Bucket::Users, id))
        }
    }

    pub fn list(&self) -> Result<Vec<User>, StoreError> {
        self.store.list_json(Bucket::Users)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.store.count(Bucket::Users)
    }

    /// Stamps the last login time
    pub fn update_last_login(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.writer();
        let mut user = self.get(id)?;
        user.last_login_at = Some(Utc::now());
        self.store.put_json(Bucket::Users, id, &user)
    }

    /// True while no user exists
    pub fn is_setup_required(&self) -> Result<bool, StoreError> {
        Ok(self.count()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::security::user::UserRole;

    fn user(name: &str) -> User {
        User::new(name, "hash".into(), UserRole::User)
    }

    #[test]
    fn usernames_are_unique() {
        let users = UserStore::new(Store::memory());
        users.create(&user("alice")).unwrap();

        let err = users.create(&user("alice")).unwrap_err();
        assert!(matches!(err, StoreError::UserAlreadyExists(_)));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(users.count().unwrap(), 1);
    }

    #[test]
    fn first_user_only_once() {
        let users = UserStore::new(Store::memory());
        assert!(users.is_setup_required().unwrap());
        assert!(users.create_if_empty(&user("root")).unwrap());
        assert!(!users.create_if_empty(&user("second")).unwrap());
        assert!(!users.is_setup_required().unwrap());
    }

    #[test]
    fn rename_into_existing_username_is_rejected() {
        let users = UserStore::new(Store::memory());
        users.create(&user("alice")).unwrap();
        let mut bob = user("bob");
        users.create(&bob).unwrap();

        bob.username = "alice".into();
        assert!(matches!(
            users.update(&mut bob),
            Err(StoreError::UserAlreadyExists(_))
        ));
    }

    #[test]
    fn last_login_is_recorded() {
        let users = UserStore::new(Store::memory());
        let alice = user("alice");
        users.create(&alice).unwrap();

        users.update_last_login(&alice.id).unwrap();
        assert!(users.get_by_username("alice").unwrap().last_login_at.is_some());
        assert_eq!(
            users.update_last_login("nobody").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        users.delete(&alice.id).unwrap();
        assert!(users.list().unwrap().is_empty());
    }
}
