//! Request metadata block construction.
//!
//! The relay receives the original request as a text block: `G-Method`
//! and `G-Url` lines, one `G-<option>` line per non-empty option, then
//! the forwarded header lines. In abbreviated mode, headers whose value
//! matches a fixed well-known pattern collapse into short tokens listed
//! on a single trailing `G-Abbv` line.

use http::{HeaderMap, Method};

use crate::http::title_case;

/// Hop-by-hop fields and proxy fingerprints that never reach an origin,
/// whether tunneled or forwarded directly.
pub(crate) const HOP_HEADERS: &[&str] = &[
    "vary",
    "via",
    "x-forwarded-for",
    "proxy-authorization",
    "proxy-connection",
    "upgrade",
    "x-chrome-variations",
    "connection",
    "cache-control",
];

/// The tunnel also drops `Host`; the relay rebuilds it from the URL.
fn skipped(name: &str) -> bool {
    HOP_HEADERS.contains(&name) || name == "host"
}

/// Token for a header whose value matches the abbreviation pattern.
fn abbv_token(name: &str, value: &str) -> Option<&'static str> {
    match name {
        "accept" if value.contains("*/*") => Some("A"),
        "accept-charset" if value.starts_with("UTF-8,") => Some("AC"),
        "accept-language" if value.starts_with("zh-CN") => Some("AL"),
        "accept-encoding" if value.starts_with("gzip,") => Some("AE"),
        _ => None,
    }
}

/// Builds the uncompressed metadata text.
pub fn encode(
    method: &Method,
    url: &str,
    options: &[(&str, String)],
    headers: &HeaderMap,
    abbreviate: bool,
) -> String {
    let mut block = format!("G-Method:{method}\nG-Url:{url}\n");
    for (key, value) in options {
        if !value.is_empty() {
            block.push_str(&format!("G-{key}:{value}\n"));
        }
    }

    let mut tokens: Vec<&'static str> = Vec::new();
    for (name, value) in headers {
        if skipped(name.as_str()) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes());
        if abbreviate {
            if let Some(token) = abbv_token(name.as_str(), &value) {
                tokens.push(token);
                continue;
            }
        }
        block.push_str(&format!("{}:{value}\n", title_case(name.as_str())));
    }
    if !tokens.is_empty() {
        block.push_str(&format!("G-Abbv:{}\n", tokens.join(",")));
    }
    block
}
