use url::Url;

/// Validate a user supplied URL and return its normalized form.
///
/// Rules:
/// - must not be empty (after trimming)
/// - must be http/https
/// - host must equal one of `allowed_hosts` or be a subdomain of one
///   (`www.youtube.com`, `m.youtube.com` for `youtube.com`)
///
/// The error string is user facing.
pub fn validate_download_url(input: &str, allowed_hosts: &[String]) -> Result<String, String> {
    let trimmed = trim_trailing_punct(input.trim());
    if trimmed.is_empty() {
        return Err("URL cannot be empty".to_string());
    }

    let normalized =
        normalize_http_url(trimmed).ok_or_else(|| format!("Not a valid web URL: {trimmed}"))?;

    if allowed_hosts.is_empty() {
        return Ok(normalized);
    }

    let host = Url::parse(&normalized)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default();

    if host_is_allowed(&host, allowed_hosts) {
        Ok(normalized)
    } else {
        Err(format!(
            "Unsupported site {host:?}; expected one of: {}",
            allowed_hosts.join(", ")
        ))
    }
}

fn host_is_allowed(host: &str, allowed_hosts: &[String]) -> bool {
    allowed_hosts.iter().any(|allowed| {
        let allowed = allowed.to_ascii_lowercase();
        host == allowed || host.ends_with(&format!(".{allowed}"))
    })
}

/// Normalize a presumed http(s) URL.
///
/// - Only accepts http/https
/// - Lowercases scheme and host (done by `Url::parse` for these schemes)
/// - Removes the fragment, which is not meaningful for downloads
/// - Drops default ports (80 for http, 443 for https), via `Url::parse`
/// - Preserves path and query
pub fn normalize_http_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = Url::parse(trimmed).ok()?;

    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    url.host_str()?;

    url.set_fragment(None);

    Some(url.to_string())
}

/// Trim punctuation that commonly trails pasted URLs.
///
/// Example: `https://youtu.be/abc),` -> `https://youtu.be/abc`
fn trim_trailing_punct(s: &str) -> &str {
    s.trim_end_matches(|c: char| {
        matches!(
            c,
            ')' | ']' | '}' | '>' | ',' | '.' | ';' | ':' | '!' | '"' | '\''
        )
    })
}
