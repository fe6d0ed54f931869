// Connection URL parser
//
// Turns `infinispan://<host>[:<port>][/<cache>][;key=value]*` into a flat
// ConnectionProperties map. Parsing is pure: it never touches the engine or
// the network, so bad input fails before any bootstrap work happens.

use percent_encoding::percent_decode_str;

use crate::error::DriverError;
use crate::models::properties::{keys, ConnectionProperties, DEFAULT_PORT};

/// Scheme prefix every driver URL starts with
pub const URL_PREFIX: &str = "infinispan:";

/// Human readable form of the accepted grammar, used in error messages
const URL_GRAMMAR: &str = "infinispan://[host[:port]][/cache][;key=value]*";

/// The two optional groups of a matching URL
struct UrlParts<'a> {
    /// Text between `//` and the first `;`
    authority: Option<&'a str>,
    /// Everything from the first `;` on
    properties: Option<&'a str>,
}

const LINE_TERMINATORS: [char; 5] = ['\n', '\r', '\u{85}', '\u{2028}', '\u{2029}'];

/// Match `url` against `infinispan:(//[^;]*)?(;.*)?`
fn split_url(url: &str) -> Option<UrlParts<'_>> {
    let rest = url.strip_prefix(URL_PREFIX)?;

    let parts = if let Some(after) = rest.strip_prefix("//") {
        match after.find(';') {
            Some(idx) => UrlParts {
                authority: Some(&after[..idx]),
                properties: Some(&after[idx..]),
            },
            None => UrlParts {
                authority: Some(after),
                properties: None,
            },
        }
    } else if rest.is_empty() {
        UrlParts {
            authority: None,
            properties: None,
        }
    } else if rest.starts_with(';') {
        UrlParts {
            authority: None,
            properties: Some(rest),
        }
    } else {
        return None;
    };

    // the property group does not span lines
    if parts
        .properties
        .is_some_and(|p| p.contains(LINE_TERMINATORS))
    {
        return None;
    }

    Some(parts)
}

/// Returns true if the driver understands this URL
///
/// Used by driver registries to pick a driver; never fails.
pub fn accepts_url(url: &str) -> bool {
    split_url(url).is_some()
}

/// Parse a connection URL on top of `base`
///
/// Values found in the URL overlay the base properties; keys absent from the
/// URL are left untouched.
///
/// # Errors
/// `MalformedUrl` when the URL does not match the grammar, `InvalidProperty`
/// when a `;key=value` segment is malformed.
pub fn parse_url(url: &str, base: ConnectionProperties) -> Result<ConnectionProperties, DriverError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(DriverError::MalformedUrl("connection URL is empty".to_string()));
    }

    let parts = split_url(url).ok_or_else(|| {
        DriverError::MalformedUrl(format!(
            "'{}' does not match {}",
            mask_credentials(url),
            URL_GRAMMAR
        ))
    })?;

    let mut props = base;

    if let Some(authority) = parts.authority {
        let authority = decode_value(authority.trim());
        let host_port = match authority.split_once('/') {
            Some((host_port, cache)) => {
                if !cache.is_empty() {
                    props.set(keys::CACHE, cache);
                }
                host_port
            }
            None => authority.as_str(),
        };

        match host_port.split_once(':') {
            Some((host, port)) => {
                props.set(keys::PORT, port.trim());
                props.set(keys::HOST, host.trim());
            }
            None => {
                props.set(keys::PORT, DEFAULT_PORT);
                props.set(keys::HOST, host_port.trim());
            }
        }
    }

    if let Some(properties) = parts.properties {
        parse_connection_properties(properties, &mut props)?;
    }

    Ok(props)
}

fn parse_connection_properties(
    connection_info: &str,
    props: &mut ConnectionProperties,
) -> Result<(), DriverError> {
    for part in connection_info.split(';') {
        parse_connection_property(part, props)?;
    }
    Ok(())
}

fn parse_connection_property(part: &str, props: &mut ConnectionProperties) -> Result<(), DriverError> {
    // Double and dangling semicolons are tolerated
    if part.is_empty() {
        return Ok(());
    }
    if part.chars().count() < 3 {
        return Err(DriverError::InvalidProperty(format!(
            "'{}' is too short to be a key=value pair",
            part
        )));
    }

    let first_equals = match part.find('=') {
        Some(idx) if idx > 0 => idx,
        _ => {
            return Err(DriverError::InvalidProperty(
                "connection property segment is not of the form key=value".to_string(),
            ))
        }
    };

    let key = part[..first_equals].trim();
    let value = part[first_equals + 1..].trim();
    if value.contains('=') {
        return Err(DriverError::InvalidProperty(format!(
            "value of '{}' contains an unescaped '='",
            key
        )));
    }

    props.set(decode_value(key), decode_value(value));
    Ok(())
}

/// URL-decode a key or value (`+` is a space, `%XX` an escaped byte)
///
/// Anything that cannot be decoded is returned as written.
fn decode_value(value: &str) -> String {
    if !has_valid_escapes(value) {
        return value.to_string();
    }
    let spaced = value.replace('+', " ");
    match percent_decode_str(&spaced).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => value.to_string(),
    }
}

fn has_valid_escapes(value: &str) -> bool {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

/// Mask the password property in a connection URL for safe logging
pub fn mask_credentials(url: &str) -> String {
    url.split(';')
        .map(|part| match part.split_once('=') {
            Some((key, _)) if key.trim().eq_ignore_ascii_case(keys::PASSWORD) => {
                format!("{}=***", key)
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}
