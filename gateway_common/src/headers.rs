//! Parsing of `Name: value` header arguments shared by both directions of the
//! gateway (extra headers on outbound connections and on HTTP responses).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderArgError {
    #[error("header argument must look like 'Name: value', got {0:?}")]
    MissingColon(String),
    #[error("header name is empty in {0:?}")]
    EmptyName(String),
}

/// Split `"Name: value"` into its trimmed parts.
///
/// Only the first colon separates, so values such as URLs keep theirs.
pub fn parse_header_arg(raw: &str) -> Result<(String, String), HeaderArgError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| HeaderArgError::MissingColon(raw.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(HeaderArgError::EmptyName(raw.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
