use std::collections::BTreeMap;

use anyhow::Context;
use log::{debug, info};
use tokio::process::Command;

use crate::daemon::cache::RecentIpCache;
use crate::daemon::parser::ConnectionParser;
use crate::daemon::types::Connection;

/// Flag asking `ss` for extended socket info, which includes `sk:` cookies.
pub const EXTENDED_FLAG: &str = "-e";

/// Runs the connection-table command and turns its output into fresh
/// connections.
#[derive(Clone, Debug)]
pub struct SsSource {
    program: String,
    args: Vec<String>,
    parser: ConnectionParser,
}

/// Lines skipped in one read, by [`ParseError::reason`](crate::daemon::types::ParseError::reason).
pub type SkipCounts = BTreeMap<&'static str, usize>;

impl SsSource {
    pub fn new(program: impl Into<String>, parser: ConnectionParser) -> Self {
        Self {
            program: program.into(),
            args: vec![EXTENDED_FLAG.to_string()],
            parser,
        }
    }

    /// Replaces the default `-e` argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Reads the connection table and returns connections whose remote IP is
    /// not yet in `cache`, recording each of them in it.
    ///
    /// An error here means the host tooling is unusable and is meant to be
    /// fatal to the caller.
    pub async fn get_connections(&self, cache: &RecentIpCache) -> anyhow::Result<Vec<Connection>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} failed ({}): {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let (fresh, skipped) = collect_new(&text, &self.parser, cache);
        if !skipped.is_empty() {
            debug!("skipped lines: {skipped:?}");
        }
        Ok(fresh)
    }
}

/// Parses every line independently and filters through the dedup cache.
pub fn collect_new(
    text: &str,
    parser: &ConnectionParser,
    cache: &RecentIpCache,
) -> (Vec<Connection>, SkipCounts) {
    let mut fresh = Vec::new();
    let mut skipped = SkipCounts::new();

    for line in text.lines() {
        let conn = match parser.parse_line(line) {
            Ok(c) => c,
            Err(e) => {
                *skipped.entry(e.reason()).or_default() += 1;
                continue;
            }
        };
        if !cache.add(&conn.remote_ip) {
            *skipped.entry("recently_probed").or_default() += 1;
            continue;
        }
        info!("pool add {}", conn);
        fresh.push(conn);
    }

    (fresh, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::parser::DEFAULT_COOKIE_FIELD;
    use std::time::Duration;

    const SS_OUTPUT: &str = "\
Netid State  Recv-Q Send-Q Local Address:Port   Peer Address:Port  Process
u_str ESTAB  0      0      * 31847              * 31848
tcp   ESTAB  0      0      10.0.0.5:443         203.0.113.9:51844  uid:0 ino:5521 sk:1a2b3c <->
tcp   ESTAB  0      0      10.0.0.5:443         203.0.113.9:51900  uid:0 ino:5522 sk:1a2b3d <->
tcp   ESTAB  0      0      10.0.0.5:22          127.0.0.1:9999     uid:0 ino:5523 sk:1a2b3e <->
tcp   TIME-WAIT 0   0      10.0.0.5:443         198.51.100.3:40000
tcp   ESTAB  0      0      [2001:db8::5]:443    [2001:db8:1::9]:60112 uid:0 ino:5524 sk:84ff <->
";

    fn parser() -> ConnectionParser {
        ConnectionParser::new(vec!["127.".into()], DEFAULT_COOKIE_FIELD)
    }

    #[test]
    fn collects_one_connection_per_new_remote_ip() {
        let cache = RecentIpCache::new(Duration::from_secs(120));
        let (fresh, skipped) = collect_new(SS_OUTPUT, &parser(), &cache);

        let remotes: Vec<_> = fresh.iter().map(|c| c.remote_ip.as_str()).collect();
        assert_eq!(remotes, ["203.0.113.9", "2001:db8:1::9"]);
        assert_eq!(fresh[0].cookie, "1a2b3c");
        assert_eq!(cache.len(), 2);
        assert!(!cache.has("127.0.0.1"));

        assert_eq!(skipped.get("recently_probed"), Some(&1));
        assert_eq!(skipped.get("ignored_address"), Some(&1));
        assert_eq!(skipped.get("not_established_tcp"), Some(&3));
    }

    #[test]
    fn second_read_inside_window_yields_nothing() {
        let cache = RecentIpCache::new(Duration::from_secs(120));
        let (first, _) = collect_new(SS_OUTPUT, &parser(), &cache);
        let (second, skipped) = collect_new(SS_OUTPUT, &parser(), &cache);
        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(skipped.get("recently_probed"), Some(&3));
    }

    #[tokio::test]
    async fn runs_the_configured_command() {
        let cache = RecentIpCache::new(Duration::from_secs(120));
        let source = SsSource::new("printf", parser())
            .with_args(["tcp ESTAB 0 0 10.0.0.5:443 203.0.113.9:51844 uid:0 ino:1 sk:1a2b3c\n"]);
        let conns = source.get_connections(&cache).await.unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].remote_ip, "203.0.113.9");
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let cache = RecentIpCache::new(Duration::from_secs(120));
        let source = SsSource::new("/nonexistent/ss", parser());
        assert!(source.get_connections(&cache).await.is_err());
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let cache = RecentIpCache::new(Duration::from_secs(120));
        let source = SsSource::new("false", parser()).with_args(Vec::<String>::new());
        assert!(source.get_connections(&cache).await.is_err());
    }
}
