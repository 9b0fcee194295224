//! Deterministic names for derived RBAC objects.
//!
//! Names are the hex SHA-256 of the inputs that define the object, so that
//! re-deriving the same grant always addresses the same object and any change
//! to a grant addresses a new one. The owner is identified by its UID, so a
//! folder that is deleted and recreated under the same name derives new names.

use crate::k8s::{PolicyRule, RoleRef, Subject};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to encode hash input: {0}")]
pub struct HashError(#[from] serde_json::Error);

/// Names the RoleBinding granting `role_ref` to `subject` in `namespace` on
/// behalf of the folder with `owner_uid`.
pub fn binding_name(
    owner_uid: &str,
    namespace: &str,
    subject: &Subject,
    role_ref: &RoleRef,
) -> Result<String, HashError> {
    let subject = serde_json::to_string(subject)?;
    let role_ref = serde_json::to_string(role_ref)?;
    Ok(digest(format!(
        "{owner_uid}-{namespace}-{subject}-{role_ref}"
    )))
}

/// Names the Role holding `rules` in `namespace` on behalf of the folder with
/// `owner_uid`.
pub fn role_name(
    owner_uid: &str,
    namespace: &str,
    rules: &[PolicyRule],
) -> Result<String, HashError> {
    let rules = serde_json::to_string(rules)?;
    Ok(digest(format!("{owner_uid}-{namespace}-{rules}")))
}

/// Hashes any serializable value, e.g. an index spec whose validation result
/// is recorded in status.
pub fn spec_hash<T: Serialize>(spec: &T) -> Result<String, HashError> {
    let json = serde_json::to_vec(spec)?;
    Ok(digest(json))
}

fn digest(input: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(input.as_ref()))
}
