//! Address and mapping string helpers shared by the client and server.

/// Parses a forward mapping of the form `bind->target`.
///
/// `bind` may be a bare port (`"1412"`), in which case it is expanded to
/// `0.0.0.0:1412`. Returns `None` for malformed or empty mappings.
pub fn split_map(s: &str) -> Option<(String, String)> {
    let (bind, target) = s.split_once("->")?;
    let bind = bind.trim();
    let target = target.trim();
    if bind.is_empty() || target.is_empty() {
        return None;
    }
    let bind = if bind.contains(':') {
        bind.to_string()
    } else {
        format!("0.0.0.0:{}", bind)
    };
    Some((bind, target.to_string()))
}

/// Splits a stream target header (`tcp://host:port` or `udp://host:port`)
/// into its network and address parts. Anything without a `udp://` scheme is
/// treated as TCP.
pub fn split_target(s: &str) -> (&'static str, &str) {
    if let Some(addr) = s.strip_prefix("udp://") {
        ("udp", addr)
    } else {
        ("tcp", s.strip_prefix("tcp://").unwrap_or(s))
    }
}

/// Normalizes a configured path address into `host:port` form.
///
/// Strips any URL scheme and path component; a missing port defaults to 80
/// (443 for the TLS transports, which this build does not dial but may still
/// appear in shared config files).
pub fn parse_addr(addr: &str, transport: &str) -> String {
    let mut addr = addr.trim();
    for scheme in ["http://", "https://", "ws://", "wss://"] {
        if let Some(rest) = addr.strip_prefix(scheme) {
            addr = rest;
            break;
        }
    }
    if let Some(idx) = addr.find('/') {
        addr = &addr[..idx];
    }
    if addr.rfind(':').map_or(false, |i| i > addr.find(']').unwrap_or(0)) {
        return addr.to_string();
    }
    let port = match transport {
        "httpsmux" | "wssmux" => 443,
        _ => 80,
    };
    format!("{}:{}", addr, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_map_full() {
        let (bind, target) = split_map("1412->127.0.0.1:8080").unwrap();
        assert_eq!(bind, "0.0.0.0:1412");
        assert_eq!(target, "127.0.0.1:8080");
    }

    #[test]
    fn test_split_map_with_bind_host() {
        let (bind, target) = split_map(" 10.0.0.1:443 -> 127.0.0.1:22 ").unwrap();
        assert_eq!(bind, "10.0.0.1:443");
        assert_eq!(target, "127.0.0.1:22");
    }

    #[test]
    fn test_split_map_malformed() {
        assert!(split_map("no-arrow").is_none());
        assert!(split_map("->target").is_none());
        assert!(split_map("bind->").is_none());
        assert!(split_map("").is_none());
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("tcp://1.2.3.4:80"), ("tcp", "1.2.3.4:80"));
        assert_eq!(split_target("udp://dns.local:53"), ("udp", "dns.local:53"));
        assert_eq!(split_target("bare.host:80"), ("tcp", "bare.host:80"));
    }

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("example.com:2020", "httpmux"), "example.com:2020");
        assert_eq!(parse_addr("example.com", "httpmux"), "example.com:80");
        assert_eq!(parse_addr("http://example.com/path", "httpmux"), "example.com:80");
        assert_eq!(parse_addr("wss://example.com", "wssmux"), "example.com:443");
    }
}
