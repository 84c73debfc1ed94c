//! Input validation for create requests and path parameters

use crate::error::BackendError;
use regex::Regex;
use std::sync::LazyLock;

/// Owners are stored verbatim in file names, so only characters the file
/// name decoder accepts are allowed.
static OWNER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9@.\-]{30,}$").expect("Invalid regex pattern"));

static KEY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{3,25}$").expect("Invalid regex pattern"));

/// scheme://host[:port] with an optional path; no whitespace, `;` or quotes
/// so the URL survives verbatim in a `proxy_pass` directive.
static UPSTREAM_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://[A-Za-z0-9.\-]+(?::[0-9]{1,5})?(?:/[A-Za-z0-9._~/?#@!$&()*+,=:%\-]*)?$")
        .expect("Invalid regex pattern")
});

static USER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9@._\-]{1,128}$").expect("Invalid regex pattern"));

pub fn owner(owner: &str) -> Result<(), BackendError> {
    if OWNER.is_match(owner) {
        Ok(())
    } else {
        Err(BackendError::Validation(
            "The owner name can only contain lowercase alphabets, numerics, '@', '.' and '-' \
             with at least 30 characters."
                .to_string(),
        ))
    }
}

pub fn key_prefix(prefix: &str) -> Result<(), BackendError> {
    if KEY_PREFIX.is_match(prefix) {
        Ok(())
    } else {
        Err(BackendError::Validation(
            "The user key url prefix can only contain alphabetics and numerics \
             with at least 3 and a maximum of 25 chars."
                .to_string(),
        ))
    }
}

pub fn upstream_url(url: &str) -> Result<(), BackendError> {
    if UPSTREAM_URL.is_match(url) {
        Ok(())
    } else {
        Err(BackendError::Validation(format!(
            "'{}' is not a valid upstream url. Example: http://129.70.168.5:3000",
            url
        )))
    }
}

/// Template names and versions become parts of file names on both sides
pub fn template_field(field: &str, value: &str) -> Result<(), BackendError> {
    if value.is_empty() {
        return Err(BackendError::Validation(format!("{} cannot be empty", field)));
    }
    if value.contains(['%', '/', '\\']) || value.chars().any(char::is_whitespace) || value == ".." {
        return Err(BackendError::Validation(format!(
            "{} contains invalid characters: {}",
            field, value
        )));
    }
    Ok(())
}

pub fn user_id(user: &str) -> Result<(), BackendError> {
    if USER_ID.is_match(user) && !user.contains("..") {
        Ok(())
    } else {
        Err(BackendError::Validation(format!(
            "User id contains invalid characters: {}",
            user
        )))
    }
}

/// Backend ids in paths must be plain decimal numbers
pub fn backend_id(raw: &str) -> Result<u64, BackendError> {
    raw.parse()
        .map_err(|_| BackendError::Validation(format!("Invalid backend id: {}", raw)))
}
