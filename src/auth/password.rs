use hmac::{Hmac, Mac};
use mongodb::bson::{doc, Document};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::Sha512;
use subtle::ConstantTimeEq;

use super::AuthProvider;
use crate::error::AppError;

type HmacSha512 = Hmac<Sha512>;

const MIN_PASSWORD_LENGTH: usize = 8;
const SALT_BYTES: usize = 32;

/// Password authentication: HMAC-SHA-512 of the password keyed with a
/// per-record random salt, constant-time comparison on verify.
pub struct PasswordProvider;

impl PasswordProvider {
    pub fn new() -> Self {
        Self
    }

    fn digest(salt: &[u8], password: &str) -> Vec<u8> {
        let mut mac =
            HmacSha512::new_from_slice(salt).expect("HMAC can take key of any size");
        mac.update(password.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

impl Default for PasswordProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProvider for PasswordProvider {
    fn method(&self) -> &'static str {
        "password"
    }

    fn validate(&self, details: &Value) -> Result<Value, AppError> {
        let password = details
            .get("password")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::RequestError("auth.password must be a string".into()))?;

        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(AppError::RequestError(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }

        Ok(json!({ "password": password }))
    }

    fn commit(&self, clean: &Value) -> Result<Document, AppError> {
        let password = clean
            .get("password")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::RequestError("missing cleaned password".into()))?;

        let mut salt = [0u8; SALT_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let hash = Self::digest(&salt, password);

        Ok(doc! {
            "salt": hex::encode(salt),
            "hash": hex::encode(hash),
        })
    }

    fn authenticate(&self, stored: &Document, offered: &Value) -> Result<(), AppError> {
        let salt_hex = stored
            .get_str("salt")
            .map_err(|_| AppError::MissingAuthRecord("stored record has no salt".into()))?;
        let hash_hex = stored
            .get_str("hash")
            .map_err(|_| AppError::MissingAuthRecord("stored record has no hash".into()))?;

        let salt = hex::decode(salt_hex)
            .map_err(|_| AppError::MissingAuthRecord("stored salt is not hex".into()))?;
        let expected = hex::decode(hash_hex)
            .map_err(|_| AppError::MissingAuthRecord("stored hash is not hex".into()))?;

        let password = offered
            .get("password")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::RequestError("auth.password must be a string".into()))?;

        let computed = Self::digest(&salt, password);
        if computed.ct_eq(&expected).into() {
            Ok(())
        } else {
            Err(AppError::Failed("authentication failed".into()))
        }
    }
}
