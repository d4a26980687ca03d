//! Naming and placement of probe output files.
//!
//! Files land at `<root>/<YYYY>/<MM>/<DD>/<host>_<boot_epoch>_<cookie>`. The
//! boot epoch is the modification time of a long-lived system path (`/proc`
//! by default), which stays fixed for the life of the host boot, so the
//! triple identifies one socket across restarts of this daemon.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::Context;
use chrono::{Datelike, NaiveDate};

/// Host name plus boot epoch, read fresh for every filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostMarker {
    pub hostname: String,
    pub boot_epoch: u64,
}

impl HostMarker {
    pub fn read(boot_marker: &Path) -> anyhow::Result<Self> {
        let modified = std::fs::metadata(boot_marker)
            .and_then(|m| m.modified())
            .with_context(|| format!("cannot stat {}", boot_marker.display()))?;
        let boot_epoch = modified
            .duration_since(UNIX_EPOCH)
            .context("boot marker predates the unix epoch")?
            .as_secs();

        let hostname = hostname::get()
            .context("cannot read host name")?
            .to_string_lossy()
            .trim()
            .to_string();
        if hostname.is_empty() {
            anyhow::bail!("host name is empty");
        }

        Ok(Self { hostname, boot_epoch })
    }
}

/// Where and under which name probe results are written.
#[derive(Clone, Debug)]
pub struct OutputLayout {
    root: PathBuf,
    boot_marker: PathBuf,
    short_hostname: bool,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, boot_marker: impl Into<PathBuf>, short_hostname: bool) -> Self {
        Self {
            root: root.into(),
            boot_marker: boot_marker.into(),
            short_hostname,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn make_filename(&self, cookie: &str) -> anyhow::Result<String> {
        let marker = HostMarker::read(&self.boot_marker)?;
        let host = if self.short_hostname {
            site_hostname(&marker.hostname)
        } else {
            marker.hostname.as_str()
        };
        Ok(format_filename(host, marker.boot_epoch, cookie))
    }

    pub fn make_output_directory(&self, today: NaiveDate) -> io::Result<PathBuf> {
        make_output_directory(&self.root, today)
    }
}

pub fn format_filename(host: &str, boot_epoch: u64, cookie: &str) -> String {
    format!("{host}_{boot_epoch}_{}", normalize_cookie(cookie))
}

/// Renders a hex cookie as 16 upper-case digits. Anything that is not a
/// 64-bit hex number is kept as-is.
pub fn normalize_cookie(cookie: &str) -> String {
    if cookie.starts_with('+') {
        return cookie.to_string();
    }
    match u64::from_str_radix(cookie, 16) {
        Ok(value) => format!("{value:016X}"),
        Err(_) => cookie.to_string(),
    }
}

/// Ensures `root/YYYY/MM/DD/` exists and returns it. Safe to race.
pub fn make_output_directory(root: &Path, today: NaiveDate) -> io::Result<PathBuf> {
    let dir = root
        .join(format!("{:04}", today.year()))
        .join(format!("{:02}", today.month()))
        .join(format!("{:02}", today.day()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// `mlab1.nyc01.measurement-lab.org` -> `mlab1.nyc01`. Other names pass
/// through untouched.
pub fn site_hostname(hostname: &str) -> &str {
    let mut parts = hostname.splitn(3, '.');
    let (Some(node), Some(site)) = (parts.next(), parts.next()) else {
        return hostname;
    };

    let node_ok = node
        .strip_prefix("mlab")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));

    let site_bytes = site.as_bytes();
    let letters = site_bytes.iter().take_while(|b| b.is_ascii_lowercase()).count();
    let digits = site_bytes[letters..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();

    // mlab\d+\.[a-z]{3}\d+
    if !node_ok || letters != 3 || digits == 0 {
        return hostname;
    }
    &hostname[..node.len() + 1 + letters + digits]
}
