//! Resolving the per-request `target_port`.

use std::collections::HashMap;

use url::Url;

/// Cookie used for sticky target-port selection.
pub const TARGET_PORT_COOKIE: &str = "vnc-target-port";

/// Where the `target_port` value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    Query,
    Referer,
    Cookie,
}

/// Choose the most appropriate source for `target_port`, in strict
/// priority order: query parameter, referer query, cookie.
pub fn select_target_port(
    query_value: Option<&str>,
    referer: Option<&str>,
    cookies: &HashMap<String, String>,
) -> Option<(String, PortSource)> {
    if let Some(value) = query_value.filter(|v| !v.is_empty()) {
        return Some((value.to_string(), PortSource::Query));
    }
    if let Some(value) = extract_port_from_referer(referer) {
        return Some((value, PortSource::Referer));
    }
    if let Some(value) = cookies.get(TARGET_PORT_COOKIE).filter(|v| !v.is_empty()) {
        return Some((value.clone(), PortSource::Cookie));
    }
    None
}

/// `target_port` parsed from the `Referer` URL's query, if present.
fn extract_port_from_referer(referer: Option<&str>) -> Option<String> {
    let referer = referer?;
    let parsed = Url::parse(referer).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "target_port")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Parse a raw `Cookie` header into a name/value map.
pub fn parse_cookie_header(header_value: Option<&str>) -> HashMap<String, String> {
    let Some(header_value) = header_value else {
        return HashMap::new();
    };
    header_value
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
