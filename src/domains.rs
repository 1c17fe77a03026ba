//! Subdomain grammar and identifier validation
//!
//! Every deployed version is addressable under the `func.local` zone:
//! - `{version}.{name}.func.local` - always registered
//! - `{alias}.{name}.func.local` - registered when an alias is set or moved
//! - `{name}.func.local` - tracks the latest version of the function

use crate::error::{Error, Result};

/// DNS zone all function subdomains live under.
pub const ZONE: &str = "func.local";

/// Alias maintained by the system; rejected from user input.
pub const LATEST_ALIAS: &str = "latest";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Version-scoped subdomain, e.g. `v1.hello.func.local`.
pub fn version_subdomain(name: &str, version: &str) -> String {
    format!("{}.{}.{}", version, name, ZONE)
}

/// Alias-scoped subdomain, e.g. `test.hello.func.local`.
pub fn alias_subdomain(name: &str, alias: &str) -> String {
    format!("{}.{}.{}", alias, name, ZONE)
}

/// Bare function subdomain, e.g. `hello.func.local`.
pub fn function_subdomain(name: &str) -> String {
    format!("{}.{}", name, ZONE)
}

/// Normalize a raw Host header value: strip the port, reject overlong or
/// suspicious values. Case is preserved; subdomains match the case they were
/// registered with.
pub fn normalize_host(raw: &str) -> Option<String> {
    let host = raw.split(':').next()?;

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, underscore and dot only; anything else is either
    // malformed or a log injection attempt.
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return None;
    }

    Some(host.to_string())
}

/// Validate a function name: non-empty, `[a-zA-Z0-9_-]`, not the reserved
/// word `latest`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("function name must not be empty".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidInput(format!(
            "function name '{}' contains invalid characters (allowed: a-z A-Z 0-9 _ -)",
            name
        )));
    }
    if name == LATEST_ALIAS {
        return Err(Error::InvalidInput(
            "'latest' is reserved and cannot be used as a function name".into(),
        ));
    }
    Ok(())
}

/// Validate a version tag: non-empty, `[a-zA-Z0-9._-]`.
pub fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() {
        return Err(Error::InvalidInput("version must not be empty".into()));
    }
    if !version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidInput(format!(
            "version '{}' contains invalid characters (allowed: a-z A-Z 0-9 . _ -)",
            version
        )));
    }
    Ok(())
}

/// Validate a user-supplied alias. `latest` is maintained automatically and
/// rejected here.
pub fn validate_alias(alias: &str) -> Result<()> {
    if alias.is_empty() {
        return Err(Error::InvalidInput("alias must not be empty".into()));
    }
    if !alias
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidInput(format!(
            "alias '{}' contains invalid characters (allowed: a-z A-Z 0-9 _ -)",
            alias
        )));
    }
    if alias == LATEST_ALIAS {
        return Err(Error::InvalidInput(
            "'latest' is a system alias and cannot be assigned manually".into(),
        ));
    }
    Ok(())
}
