//! Admission control on the browser-declared `Origin` header.
//!
//! The decision is made before the WebSocket upgrade is accepted, so a denied request never
//! touches the backend.

use url::Url;

/// Production site allowed over HTTPS.
pub const PUBLIC_HOST: &str = "wokwi.com";

/// Preview deployments (`<anything>.preview.wokwi.com`) allowed over HTTPS.
pub const PREVIEW_HOST_SUFFIX: &str = ".preview.wokwi.com";

/// Hosts allowed over plain HTTP (local development of the simulator).
const LOOPBACK_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Returns whether a connection declaring `origin` may be admitted.
pub fn is_allowed(origin: &str) -> bool {
    let Ok(url) = Url::parse(origin.trim()) else {
        return false;
    };
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

    match url.scheme() {
        "https" => host == PUBLIC_HOST || host.ends_with(PREVIEW_HOST_SUFFIX),
        "http" => LOOPBACK_HOSTS.contains(&host.as_str()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::is_allowed;

    #[test]
    fn matches_rule_table() {
        let cases = [
            ("https://wokwi.com", true),
            ("https://wokwi.com/", true),
            ("https://Wokwi.com/", true),
            ("https://sub.preview.wokwi.com", true),
            ("https://something.preview.Wokwi.com/", true),
            ("http://localhost:3000", true),
            ("http://localhost:3000/", true),
            ("http://127.0.0.1/", true),
            ("https://evil.com", false),
            ("https://invalid.wokwi.com/", false),
            ("https://preview.wokwi.com/", false),
            ("https://127.0.0.1/", false),
            ("https://localhost/", false),
            ("http://evil.com", false),
            ("http://notwokwi.com/", false),
            ("http://wokwi.com/", false),
            ("https://notwokwi.com/", false),
            ("https://wokwi.com.evil.com/", false),
            ("ws://localhost/", false),
            ("file:///etc/passwd", false),
            ("null", false),
            ("", false),
            ("invalid url", false),
        ];

        for (origin, expected) in cases {
            assert_eq!(is_allowed(origin), expected, "origin={origin:?}");
        }
    }
}
