use std::net::IpAddr;

use crate::daemon::types::{Connection, ParseError};

/// Minimum number of whitespace separated fields in a usable `ss` row.
pub const MIN_FIELDS: usize = 6;
/// Position of the `sk:` field in `ss -e` rows.
pub const DEFAULT_COOKIE_FIELD: usize = 8;
pub const COOKIE_PREFIX: &str = "sk:";

/// Parses rows of `ss -e` output into [`Connection`]s.
#[derive(Clone, Debug)]
pub struct ConnectionParser {
    ignored_prefixes: Vec<String>,
    cookie_field: usize,
}

impl ConnectionParser {
    pub fn new(ignored_prefixes: Vec<String>, cookie_field: usize) -> Self {
        Self {
            ignored_prefixes,
            cookie_field,
        }
    }

    // Row looks like:
    //   tcp ESTAB 0 0 10.0.0.5:443 203.0.113.9:51844 uid:1000 ino:4242 sk:1a2b3c <->
    pub fn parse_line(&self, line: &str) -> Result<Connection, ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < MIN_FIELDS {
            return Err(ParseError::IncompleteLine { fields: parts.len() });
        }
        if parts[0] != "tcp" || parts[1] != "ESTAB" {
            return Err(ParseError::NotEstablishedTcp);
        }

        let (local_ip, local_port) = self.parse_ip_and_port(parts[4])?;
        let (remote_ip, remote_port) = self.parse_ip_and_port(parts[5])?;
        let cookie = parse_cookie(parts.get(self.cookie_field).copied())?;

        Ok(Connection {
            remote_ip,
            remote_port,
            local_ip,
            local_port,
            cookie: cookie.to_string(),
        })
    }

    /// Splits `addr:port` at the last colon, so `[2001:db8::1]:443` works.
    pub fn parse_ip_and_port(&self, token: &str) -> Result<(String, u16), ParseError> {
        let (addr, port) = token
            .rsplit_once(':')
            .ok_or_else(|| ParseError::MissingSeparator(token.to_string()))?;

        let addr = addr
            .strip_prefix('[')
            .and_then(|a| a.strip_suffix(']'))
            .unwrap_or(addr);

        if self.is_ignored(addr) {
            return Err(ParseError::IgnoredAddress(addr.to_string()));
        }
        if addr.parse::<IpAddr>().is_err() {
            return Err(ParseError::InvalidAddress(addr.to_string()));
        }
        // Digits only: `u16::from_str` would also take a leading `+`.
        let port = Some(port)
            .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| ParseError::InvalidPort(port.to_string()))?;

        Ok((addr.to_string(), port))
    }

    /// Plain string prefix match, not a CIDR test.
    pub fn is_ignored(&self, addr: &str) -> bool {
        self.ignored_prefixes
            .iter()
            .any(|prefix| addr.starts_with(prefix.as_str()))
    }
}

fn parse_cookie(field: Option<&str>) -> Result<&str, ParseError> {
    field
        .and_then(|f| f.strip_prefix(COOKIE_PREFIX))
        .ok_or(ParseError::NoCookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::types::join_host_port;

    fn parser() -> ConnectionParser {
        ConnectionParser::new(
            vec!["127.".into(), "128.112.139.".into(), "::ffff:127.0.0.1".into()],
            DEFAULT_COOKIE_FIELD,
        )
    }

    #[test]
    fn parses_established_ipv4_row() {
        let line = "tcp ESTAB 0 0 10.0.0.5:443 203.0.113.9:51844 uid:0 ino:5521 sk:1a2b3c <->";
        let conn = parser().parse_line(line).unwrap();
        assert_eq!(
            conn,
            Connection {
                remote_ip: "203.0.113.9".into(),
                remote_port: 51844,
                local_ip: "10.0.0.5".into(),
                local_port: 443,
                cookie: "1a2b3c".into(),
            }
        );
    }

    #[test]
    fn parses_bracketed_ipv6_row() {
        let line = "tcp   ESTAB  0  36  [2001:db8::5]:22   [2001:db8:1::9]:60112  uid:0 ino:77 sk:84ff <->";
        let conn = parser().parse_line(line).unwrap();
        assert_eq!(conn.local_ip, "2001:db8::5");
        assert_eq!(conn.local_port, 22);
        assert_eq!(conn.remote_ip, "2001:db8:1::9");
        assert_eq!(conn.remote_port, 60112);
        assert_eq!(conn.cookie, "84ff");
    }

    #[test]
    fn formatting_back_reproduces_tokens() {
        let p = parser();
        for token in ["10.0.0.5:443", "[2001:db8::5]:22", "198.51.100.7:0"] {
            let (ip, port) = p.parse_ip_and_port(token).unwrap();
            assert_eq!(join_host_port(&ip, port), token);
        }
    }

    #[test]
    fn rejects_short_lines() {
        assert_eq!(
            parser().parse_line("tcp ESTAB 0 0 10.0.0.5:443"),
            Err(ParseError::IncompleteLine { fields: 5 })
        );
        assert_eq!(parser().parse_line(""), Err(ParseError::IncompleteLine { fields: 0 }));
    }

    #[test]
    fn rejects_other_protocols_and_states() {
        let p = parser();
        for line in [
            "Netid State Recv-Q Send-Q Local Address:Port Peer Address:Port",
            "udp ESTAB 0 0 10.0.0.5:53 203.0.113.9:5353 uid:0 ino:1 sk:1",
            "tcp TIME-WAIT 0 0 10.0.0.5:443 203.0.113.9:51844 uid:0 ino:1 sk:1",
            "TCP ESTAB 0 0 10.0.0.5:443 203.0.113.9:51844 uid:0 ino:1 sk:1",
            "tcp estab 0 0 10.0.0.5:443 203.0.113.9:51844 uid:0 ino:1 sk:1",
            "u_str ESTAB 0 0 * 12345 * 12346",
        ] {
            assert_eq!(p.parse_line(line), Err(ParseError::NotEstablishedTcp), "{line}");
        }
    }

    #[test]
    fn ignored_prefix_wins_over_port_validity() {
        let p = parser();
        assert_eq!(
            p.parse_ip_and_port("127.0.0.1:9999"),
            Err(ParseError::IgnoredAddress("127.0.0.1".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("128.112.139.4:notaport"),
            Err(ParseError::IgnoredAddress("128.112.139.4".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("[::ffff:127.0.0.1]:80"),
            Err(ParseError::IgnoredAddress("::ffff:127.0.0.1".into()))
        );
    }

    #[test]
    fn loopback_remote_rejects_whole_line() {
        let line = "tcp ESTAB 0 0 10.0.0.5:443 127.0.0.1:9999 uid:0 ino:1 sk:1a2b3c";
        assert_eq!(
            parser().parse_line(line),
            Err(ParseError::IgnoredAddress("127.0.0.1".into()))
        );
    }

    #[test]
    fn rejects_bad_addresses_and_ports() {
        let p = parser();
        assert_eq!(
            p.parse_ip_and_port("nohostport"),
            Err(ParseError::MissingSeparator("nohostport".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("*:*"),
            Err(ParseError::InvalidAddress("*".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("300.1.1.1:80"),
            Err(ParseError::InvalidAddress("300.1.1.1".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("10.0.0.1:http"),
            Err(ParseError::InvalidPort("http".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("10.0.0.1:-1"),
            Err(ParseError::InvalidPort("-1".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("10.0.0.1:70000"),
            Err(ParseError::InvalidPort("70000".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("10.0.0.1:+80"),
            Err(ParseError::InvalidPort("+80".into()))
        );
        assert_eq!(
            p.parse_ip_and_port("10.0.0.1:"),
            Err(ParseError::InvalidPort("".into()))
        );
    }

    #[test]
    fn requires_cookie_at_fixed_field() {
        let p = parser();
        assert_eq!(
            p.parse_line("tcp ESTAB 0 0 10.0.0.5:443 203.0.113.9:51844 uid:0 ino:1 cookie:1"),
            Err(ParseError::NoCookie)
        );
        assert_eq!(
            p.parse_line("tcp ESTAB 0 0 10.0.0.5:443 203.0.113.9:51844"),
            Err(ParseError::NoCookie)
        );
        // sk: present but at the wrong position
        assert_eq!(
            p.parse_line("tcp ESTAB 0 0 10.0.0.5:443 203.0.113.9:51844 sk:1 ino:1 uid:0"),
            Err(ParseError::NoCookie)
        );
    }

    #[test]
    fn cookie_field_is_configurable() {
        let p = ConnectionParser::new(vec![], 6);
        let conn = p
            .parse_line("tcp ESTAB 0 0 10.0.0.5:443 203.0.113.9:51844 sk:ff")
            .unwrap();
        assert_eq!(conn.cookie, "ff");
    }
}
