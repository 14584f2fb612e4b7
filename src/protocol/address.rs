//! Network addressing helpers.

/// Domain suffix for individual user addresses on the network
pub const USER_DOMAIN: &str = "s.whatsapp.net";

/// Turn a caller-supplied recipient into a network address.
///
/// Anything already carrying an `@` is passed through untouched, so group
/// and broadcast addresses keep working.
pub fn normalize_recipient(to: &str) -> String {
    let to = to.trim();
    if to.contains('@') {
        to.to_string()
    } else {
        format!("{}@{}", to, USER_DOMAIN)
    }
}

/// Extract the phone number from the address the handshake reports for the
/// linked account, e.g. `5511999999999:12@s.whatsapp.net` -> `5511999999999`.
pub fn identity_from_user(user: &str) -> Option<String> {
    let number = user
        .split(':')
        .next()
        .unwrap_or(user)
        .split('@')
        .next()
        .unwrap_or(user)
        .trim();

    if number.is_empty() {
        None
    } else {
        Some(number.to_string())
    }
}
