//! Proxy data plane: plain-HTTP forwarding and the CONNECT byte tunnel.

mod forwarder;
mod tunnel;

pub use forwarder::{forward_client, forward_http};
pub use tunnel::serve_tunnel;

/// Remove a trailing `:port` from a host string, leaving bare hostnames,
/// IPv4 literals, and bracketed or bare IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']')) =>
        {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ports_from_names_and_v4() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("10.1.2.3:8080"), "10.1.2.3");
    }

    #[test]
    fn leaves_ipv6_literals_alone() {
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[2001:db8::1]:8443"), "[2001:db8::1]");
    }

    #[test]
    fn ignores_non_numeric_suffixes() {
        assert_eq!(strip_port("example.com:http"), "example.com:http");
        assert_eq!(strip_port("example.com:"), "example.com:");
    }
}
