//! Netscape cookie-jar loading.
//!
//! A `cookies.txt` in the session config directory seeds the HTTP client's
//! jar: one cookie per line, seven tab-separated fields
//! (domain, include-subdomains, path, secure, expiry, name, value).

use std::path::Path;

use reqwest::cookie::Jar;
use tracing::{debug, info};
use url::Url;

pub(crate) fn load_jar(path: &Path) -> Option<Jar> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "cookie jar unreadable");
            return None;
        }
    };

    let jar = Jar::default();
    let mut loaded = 0usize;

    for line in text.lines() {
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            continue;
        }
        let (domain, path, secure, name, value) =
            (fields[0], fields[2], fields[3], fields[5], fields[6]);

        let host = domain.trim_start_matches('.');
        let scheme = if secure.eq_ignore_ascii_case("TRUE") { "https" } else { "http" };
        let url = match Url::parse(&format!("{scheme}://{host}/")) {
            Ok(url) => url,
            Err(_) => continue,
        };

        jar.add_cookie_str(&format!("{name}={value}; Domain={host}; Path={path}"), &url);
        loaded += 1;
    }

    info!(loaded, path = %path.display(), "loaded cookie jar");
    Some(jar)
}
