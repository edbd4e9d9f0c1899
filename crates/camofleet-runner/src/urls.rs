//! Helpers for working with user-provided URLs.

/// Schemes that are navigable without a `://` authority part.
const SCHEME_ONLY_PROTOCOLS: [&str; 5] = ["about", "data", "file", "javascript", "mailto"];

/// Return a URL the browser can navigate to.
///
/// Operators often enter bare hostnames like `example.com`; browsers need an
/// explicit scheme, so `https://` is inferred when the value looks like a
/// host (it has a dot or a port) or an authority-form `//host/...`. Relative
/// paths are returned untouched for the browser to resolve itself.
pub fn navigable_start_url(raw: &str) -> String {
    if let Some(scheme) = leading_scheme(raw) {
        if raw.contains("://") || SCHEME_ONLY_PROTOCOLS.contains(&scheme.as_str()) {
            return raw.to_string();
        }
    }

    if let Some(rest) = raw.strip_prefix("//") {
        let netloc = authority_of(rest);
        if !netloc.is_empty() && netloc != "." && netloc != ".." {
            return format!("https:{raw}");
        }
        return raw.to_string();
    }

    let netloc = authority_of(raw);
    let looks_like_host =
        !netloc.is_empty() && netloc != "." && netloc != ".." && (netloc.contains('.') || netloc.contains(':'));
    if looks_like_host {
        return format!("https://{raw}");
    }

    raw.to_string()
}

/// The scheme at the front of `raw`, if one is present.
fn leading_scheme(raw: &str) -> Option<String> {
    let colon = raw.find(':')?;
    let candidate = &raw[..colon];
    let mut chars = candidate.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-')) {
        Some(candidate.to_ascii_lowercase())
    } else {
        None
    }
}

/// The authority component: everything before the first `/`, `?` or `#`.
fn authority_of(value: &str) -> &str {
    let end = value
        .find(['/', '?', '#'])
        .unwrap_or(value.len());
    &value[..end]
}
