//! Field checks shared by the client components and the store. They run
//! before any persistence call.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::CrmError;

// Compile once
static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// Trimmed, non-empty text or a validation error naming the field.
pub fn required(field: &str, value: &str) -> Result<String, CrmError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CrmError::Validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

/// A finite amount that is zero or more.
pub fn non_negative(field: &str, value: f64) -> Result<f64, CrmError> {
    if !value.is_finite() || value < 0.0 {
        return Err(CrmError::Validation(format!(
            "{} must be a non-negative number",
            field
        )));
    }
    Ok(value)
}

pub fn is_valid_email(value: &str) -> bool {
    EMAIL_REGEX.is_match(value.trim())
}

pub fn email(value: &str) -> Result<String, CrmError> {
    let trimmed = required("Email", value)?;
    if !is_valid_email(&trimmed) {
        return Err(CrmError::Validation(format!("{} is not a valid email", trimmed)));
    }
    Ok(trimmed)
}

/// Empty optional strings collapse to `None`.
pub fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
