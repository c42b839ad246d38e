//! Shared helpers.

use anyhow::Result;
use std::path::Path;

/// Create a directory (and parents) if it does not exist.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Mask a user id for logging: keep an 8-character prefix.
/// Security-relevant log lines must never carry raw identifiers.
pub fn mask_user_id(user_id: &str) -> String {
    if user_id.is_empty() {
        return "[invalid]".to_string();
    }
    let prefix_len = user_id.len().min(8);
    format!("{}***", &user_id[..prefix_len])
}

/// Mask an email for logging: first character of the local part survives.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first = &local[..local.chars().next().map_or(0, |c| c.len_utf8())];
            format!("{}***@{}", first, domain)
        }
        _ => "[invalid]".to_string(),
    }
}
