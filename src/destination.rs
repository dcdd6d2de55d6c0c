//! Destination template tokens.
//!
//! Templates carry angle-bracket tokens such as `<page>` and `<ext>`. The page
//! token is filled in when a member is created; the extension token is
//! deferred until the member runs, because it comes from the source URL.

use regex::Regex;
use std::sync::OnceLock;

/// Replaced with the member's zero-based index at construction
pub const PAGE_TOKEN: &str = "<page>";

/// Replaced with the source URL's extension (including the dot) at run time
pub const EXTENSION_TOKEN: &str = "<ext>";

// The pattern is a literal, so compilation cannot fail at run time
#[allow(clippy::expect_used)]
fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"<[A-Za-z_][A-Za-z0-9_]*>").expect("valid token regex"))
}

/// Fill in the page token for member `index`
pub fn resolve_page(template: &str, index: usize) -> String {
    template.replace(PAGE_TOKEN, &index.to_string())
}

/// Whether the destination still contains the deferred extension token
pub fn has_deferred_tokens(destination: &str) -> bool {
    destination.contains(EXTENSION_TOKEN)
}

/// Extension of the last path segment of `source`, with its leading dot
///
/// Query strings and fragments are ignored. Returns an empty string when the
/// source has no extension or isn't a parseable URL with a path.
pub fn extension_from_source(source: &str) -> String {
    let path = match url::Url::parse(source) {
        Ok(url) => url.path().to_string(),
        Err(_) => source
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let file_name = path.rsplit('/').next().unwrap_or_default();
    match file_name.rfind('.') {
        Some(dot) if dot + 1 < file_name.len() => file_name[dot..].to_string(),
        _ => String::new(),
    }
}

/// Replace the extension token with the extension of `source`
pub fn resolve_extension(destination: &str, source: &str) -> String {
    if !has_deferred_tokens(destination) {
        return destination.to_string();
    }
    destination.replace(EXTENSION_TOKEN, &extension_from_source(source))
}

/// Remove every remaining token
pub fn strip_tokens(destination: &str) -> String {
    token_regex().replace_all(destination, "").into_owned()
}

/// Resolve a member destination at run time: extension first, then strip leftovers
pub fn finalize(destination: &str, source: &str) -> String {
    strip_tokens(&resolve_extension(destination, source))
}
