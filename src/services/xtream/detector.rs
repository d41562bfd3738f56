//! Xtream Codes URL detection
//!
//! Recovers server and credentials from URLs handed to the gateway.

use super::types::XtreamCredentials;
use tracing::debug;
use url::Url;

/// Reconstruct `scheme://host[:port]`
fn server_of(parsed: &Url) -> Option<String> {
    let host = parsed.host_str()?;
    let port_suffix = parsed
        .port()
        .map(|p| format!(":{}", p))
        .unwrap_or_default();
    Some(format!("{}://{}{}", parsed.scheme(), host, port_suffix))
}

/// Extract Xtream credentials from a URL
///
/// Supported URL patterns:
/// - `http://server:port/get.php?username=X&password=Y&...`
/// - `http://server:port/player_api.php?username=X&password=Y`
/// - `http://server:port/live/X/Y/123.ts` (also without `/live`)
pub fn extract_credentials(url: &str) -> Option<XtreamCredentials> {
    let parsed = match Url::parse(url) {
        Ok(url) => url,
        Err(e) => {
            debug!("Failed to parse URL: {}", e);
            return None;
        }
    };
    let server = server_of(&parsed)?;

    let path = parsed.path().to_lowercase();
    if path.ends_with("/get.php") || path.ends_with("/player_api.php") {
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        let username = params.get("username")?.to_string();
        let password = params.get("password")?.to_string();
        if username.is_empty() || password.is_empty() {
            debug!("Empty username or password in URL");
            return None;
        }
        return Some(XtreamCredentials::new(&server, &username, &password));
    }

    // /live/<user>/<pass>/<id>[.ext]
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["live", user, pass, _id] => Some(XtreamCredentials::new(&server, user, pass)),
        _ => None,
    }
}

/// Stream id from a `/live/<user>/<pass>/<id>.ts` URL
pub fn stream_id_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let id = last.split('.').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_credentials_valid() {
        let url = "http://example.com:8080/get.php?username=testuser&password=testpass&type=m3u_plus&output=ts";
        let creds = extract_credentials(url).expect("Should extract credentials");

        assert_eq!(creds.server, "http://example.com:8080");
        assert_eq!(creds.username, "testuser");
        assert_eq!(creds.password, "testpass");
    }

    #[test]
    fn test_extract_credentials_player_api() {
        let url = "https://secure.example.com/player_api.php?username=user&password=pass";
        let creds = extract_credentials(url).expect("Should extract credentials");

        assert_eq!(creds.server, "https://secure.example.com");
        assert_eq!(creds.username, "user");
    }

    #[test]
    fn test_extract_credentials_live_path() {
        let creds = extract_credentials("http://example.com:8080/live/user/pass/123.ts")
            .expect("Should extract credentials");
        assert_eq!(creds.server, "http://example.com:8080");
        assert_eq!(creds.password, "pass");
        assert_eq!(
            stream_id_of("http://example.com:8080/live/user/pass/123.ts").as_deref(),
            Some("123")
        );
    }

    #[test]
    fn test_extract_credentials_not_xtream() {
        assert!(extract_credentials("http://example.com/playlist.m3u").is_none());
        assert!(extract_credentials("http://example.com/api/streams?username=user&password=pass").is_none());
        assert!(extract_credentials("http://example.com/get.php?username=user").is_none());
        assert!(extract_credentials("not a url").is_none());
    }
}
