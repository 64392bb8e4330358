use std::sync::{Arc, OnceLock};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use uuid::Uuid;
use validator::Validate;

use proxima_shared::errors::{AppError, ErrorCode};

use crate::models::{Gender, NewUser, ProfileChanges, User};
use crate::store::{run_blocking, UserStore};

pub const MAX_BIO_CHARS: usize = 500;
pub const MAX_PHOTO_BYTES: usize = 2 * 1024 * 1024;
pub const MIN_AGE: i32 = 13;
pub const MAX_AGE: i32 = 120;

const INVALID_CREDENTIALS: &str = "invalid email or password";

#[derive(Debug, Validate)]
struct Registration {
    #[validate(length(min = 1, max = 100, message = "name must be between 1 and 100 characters"))]
    name: String,
    #[validate(email(message = "invalid email format"))]
    email: String,
}

/// Raw profile update as received from a client. Absent fields are left
/// unchanged; an empty gender string counts as absent.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub gender: Option<String>,
    pub age: Option<i32>,
    pub bio: Option<String>,
    pub photo_url: Option<String>,
}

impl ProfileUpdate {
    pub fn into_changes(self) -> Result<ProfileChanges, AppError> {
        let gender = match self.gender.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<Gender>()
                    .map_err(|_| AppError::new(ErrorCode::ValidationError, "gender must be male, female or other"))?,
            ),
        };

        if let Some(age) = self.age {
            if !(MIN_AGE..=MAX_AGE).contains(&age) {
                return Err(AppError::new(
                    ErrorCode::InvalidAge,
                    format!("age must be between {MIN_AGE} and {MAX_AGE}"),
                ));
            }
        }

        if let Some(bio) = &self.bio {
            if bio.chars().count() > MAX_BIO_CHARS {
                return Err(AppError::new(
                    ErrorCode::ValidationError,
                    format!("bio must be at most {MAX_BIO_CHARS} characters"),
                ));
            }
        }

        if let Some(photo) = &self.photo_url {
            validate_photo_reference(photo)?;
        }

        Ok(ProfileChanges {
            gender,
            age: self.age,
            bio: self.bio,
            photo_url: self.photo_url,
        })
    }
}

fn validate_photo_reference(photo: &str) -> Result<(), AppError> {
    let accepted = photo.starts_with("https://") || photo.starts_with("http://") || photo.starts_with("data:image/");
    if !accepted {
        return Err(AppError::new(
            ErrorCode::InvalidPhotoReference,
            "photo must be an http(s) URL or a data:image URI",
        ));
    }
    if photo.len() > MAX_PHOTO_BYTES {
        return Err(AppError::new(ErrorCode::InvalidPhotoReference, "photo must be at most 2 MB"));
    }
    Ok(())
}

pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::internal(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::internal(format!("invalid password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Hash checked against when the email is unknown, so both failure paths
/// cost one argon2 verification.
fn dummy_hash() -> &'static str {
    static DUMMY: OnceLock<String> = OnceLock::new();
    DUMMY.get_or_init(|| hash_password("proxima-dummy-password").unwrap_or_default())
}

async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::internal(format!("worker task failed: {e}")))?
}

/// Accounts, credentials and profile attributes.
pub struct IdentityService {
    users: Arc<dyn UserStore>,
    password_min_len: usize,
}

impl IdentityService {
    pub fn new(users: Arc<dyn UserStore>, password_min_len: usize) -> Self {
        Self { users, password_min_len }
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<User, AppError> {
        let registration = Registration {
            name: name.trim().to_owned(),
            email: email.trim().to_lowercase(),
        };
        registration.validate()?;

        if password.chars().count() < self.password_min_len {
            return Err(AppError::new(
                ErrorCode::PasswordTooWeak,
                format!("password must be at least {} characters", self.password_min_len),
            ));
        }

        let password = password.to_owned();
        let password_hash = blocking(move || hash_password(&password)).await?;

        let users = self.users.clone();
        let new_user = NewUser {
            name: registration.name,
            email: registration.email,
            password_hash,
        };
        let user = run_blocking(move || users.insert(new_user)).await?;

        tracing::info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User, AppError> {
        let email = email.trim().to_lowercase();
        let users = self.users.clone();
        let found = run_blocking(move || users.find_by_email(&email)).await?;

        let hash = match &found {
            Some(user) => user.password_hash.clone(),
            None => dummy_hash().to_owned(),
        };
        let password = password.to_owned();
        let valid = match blocking(move || verify_password(&password, &hash)).await {
            Ok(valid) => valid,
            Err(e) => {
                // A stored hash that does not parse is corrupt data, still answered as a failed login.
                tracing::error!(error = %e, "password verification failed");
                false
            }
        };

        match found {
            Some(user) if valid => {
                tracing::info!(user_id = %user.id, "user authenticated");
                Ok(user)
            }
            _ => Err(AppError::new(ErrorCode::InvalidCredentials, INVALID_CREDENTIALS)),
        }
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<User, AppError> {
        let users = self.users.clone();
        run_blocking(move || users.find_by_id(user_id))
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::UserNotFound, "user not found"))
    }

    pub async fn update_profile(&self, user_id: Uuid, update: ProfileUpdate) -> Result<User, AppError> {
        let changes = update.into_changes()?;
        if changes.is_empty() {
            return self.get_profile(user_id).await;
        }

        let users = self.users.clone();
        let user = run_blocking(move || users.update_profile(user_id, &changes))
            .await?
            .ok_or_else(|| AppError::new(ErrorCode::UserNotFound, "user not found"))?;

        tracing::debug!(user_id = %user_id, "profile updated");
        Ok(user)
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        let users = self.users.clone();
        Ok(run_blocking(move || users.ping()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryUserStore;

    fn service() -> IdentityService {
        IdentityService::new(Arc::new(MemoryUserStore::default()), 8)
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let identity = service();
        let user = identity.register("  Ada ", "Ada@Example.com", "correct-horse").await.unwrap();
        assert_eq!(user.name, "Ada");
        assert_eq!(user.email, "ada@example.com");
        assert_ne!(user.password_hash, "correct-horse");

        let again = identity.authenticate("ADA@example.com", "correct-horse").await.unwrap();
        assert_eq!(again.id, user.id);
    }

    #[tokio::test]
    async fn duplicate_email_conflicts_case_insensitively() {
        let identity = service();
        identity.register("Ada", "ada@example.com", "password1").await.unwrap();
        let err = identity.register("Other", "ADA@example.com", "password2").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::EmailAlreadyExists);
    }

    #[tokio::test]
    async fn invalid_registration_inputs() {
        let identity = service();
        let err = identity.register("Ada", "not-an-email", "password1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = identity.register("   ", "ada@example.com", "password1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = identity.register("Ada", "ada@example.com", "short").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PasswordTooWeak);
    }

    #[tokio::test]
    async fn unknown_email_and_wrong_password_look_identical() {
        let identity = service();
        identity.register("Ada", "ada@example.com", "password1").await.unwrap();

        let wrong = identity.authenticate("ada@example.com", "password2").await.unwrap_err();
        let unknown = identity.authenticate("bob@example.com", "password1").await.unwrap_err();
        assert_eq!(wrong.code(), ErrorCode::InvalidCredentials);
        assert_eq!(unknown.code(), ErrorCode::InvalidCredentials);
        assert_eq!(wrong.public_message(), unknown.public_message());
    }

    #[tokio::test]
    async fn partial_profile_update() {
        let identity = service();
        let user = identity.register("Ada", "ada@example.com", "password1").await.unwrap();

        let updated = identity
            .update_profile(
                user.id,
                ProfileUpdate { gender: Some("female".into()), age: Some(30), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(updated.gender, Some(Gender::Female));

        let updated = identity
            .update_profile(user.id, ProfileUpdate { gender: Some(String::new()), bio: Some("hello".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(updated.gender, Some(Gender::Female));
        assert_eq!(updated.age, Some(30));
        assert_eq!(updated.bio.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn profile_update_rejects_bad_values() {
        let identity = service();
        let user = identity.register("Ada", "ada@example.com", "password1").await.unwrap();

        let err = identity
            .update_profile(user.id, ProfileUpdate { age: Some(12), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidAge);

        let err = identity
            .update_profile(user.id, ProfileUpdate { photo_url: Some("ftp://x".into()), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPhotoReference);

        let err = identity
            .update_profile(Uuid::now_v7(), ProfileUpdate { age: Some(20), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserNotFound);
    }

    #[test]
    fn data_uri_photos_are_accepted() {
        assert!(validate_photo_reference("data:image/jpeg;base64,AAAA").is_ok());
        assert!(validate_photo_reference("https://cdn.example.com/a.png").is_ok());
        let huge = format!("data:image/png;base64,{}", "A".repeat(MAX_PHOTO_BYTES));
        assert!(validate_photo_reference(&huge).is_err());
    }

    #[tokio::test]
    async fn corrupt_stored_hash_fails_login_without_panicking() {
        let users = Arc::new(MemoryUserStore::default());
        users
            .insert(NewUser {
                name: "Eve".into(),
                email: "eve@example.com".into(),
                password_hash: "not-an-argon2-hash".into(),
            })
            .unwrap();
        let identity = IdentityService::new(users, 8);

        let err = identity.authenticate("eve@example.com", "whatever1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCredentials);
    }
}
