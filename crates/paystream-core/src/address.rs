//! Destination address parsing.
//!
//! Server-issued addresses have the form `<server>.<token>[~<tag>]`. The
//! segment after the server's own address is the connection id; everything
//! before the first `~` in it is the token the shared secret derives from.

/// Separator between token and tag
pub const TAG_SEPARATOR: char = '~';

/// True if `id` is non-empty and uses only `A-Z a-z 0-9 ~ _ -`.
#[must_use]
pub fn is_valid_connection_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'~' | b'_' | b'-'))
}

/// Extract the connection id from a destination addressed to `server_address`.
///
/// Returns `None` if the destination is not below the server address or the
/// id segment is empty or outside the allowed character set.
#[must_use]
pub fn connection_id<'a>(server_address: &str, destination: &'a str) -> Option<&'a str> {
    let local = destination
        .strip_prefix(server_address)?
        .strip_prefix('.')?;
    let id = local.split('.').next()?;
    is_valid_connection_id(id).then_some(id)
}

/// Split a connection id into token and optional tag.
#[must_use]
pub fn split_tag(connection_id: &str) -> (&str, Option<&str>) {
    match connection_id.split_once(TAG_SEPARATOR) {
        Some((token, tag)) => (token, Some(tag)),
        None => (connection_id, None),
    }
}

/// Build the address a client should send to.
#[must_use]
pub fn build_address(server_address: &str, token: &str, tag: Option<&str>) -> String {
    match tag {
        Some(tag) => format!("{server_address}.{token}{TAG_SEPARATOR}{tag}"),
        None => format!("{server_address}.{token}"),
    }
}
