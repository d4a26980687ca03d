use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::process::Command;

use crate::daemon::output::OutputLayout;
use crate::daemon::types::Connection;

/// How to invoke the traceroute binary (scamper).
#[derive(Clone, Debug)]
pub struct ProbeCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub enum ProbeError {
    Filename(anyhow::Error),
    Spawn(std::io::Error),
    Timeout(Duration),
    Exit { status: ExitStatus, stderr: String },
    Write { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Filename(e) => write!(f, "cannot build output filename: {e:#}"),
            ProbeError::Spawn(e) => write!(f, "failed to launch probe: {e}"),
            ProbeError::Timeout(t) => write!(f, "probe timed out after {t:?}"),
            ProbeError::Exit { status, stderr } => {
                write!(f, "probe exited with {status}")?;
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            ProbeError::Write { path, source } => {
                write!(f, "cannot write {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ProbeError {}

impl ProbeCommand {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Arguments for one multipath ICMP trace. The `-I` grammar belongs to
    /// scamper and must not change.
    pub fn args(remote_ip: &str) -> [String; 4] {
        [
            "-O".to_string(),
            "json".to_string(),
            "-I".to_string(),
            format!("tracelb -P icmp-echo -q 3 -O ptr {remote_ip}"),
        ]
    }

    /// Runs the probe to completion and returns its stdout.
    pub async fn run(&self, remote_ip: &str) -> Result<Vec<u8>, ProbeError> {
        let child = Command::new(&self.binary)
            .args(Self::args(remote_ip))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProbeError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(ProbeError::Spawn)?;

        if !output.status.success() {
            return Err(ProbeError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// One probe: name the output, trace the remote address, persist stdout.
/// Nothing is written unless every step succeeds.
pub async fn probe_connection(
    conn: &Connection,
    probe: &ProbeCommand,
    layout: &OutputLayout,
) -> Result<PathBuf, ProbeError> {
    let filename = layout.make_filename(&conn.cookie).map_err(ProbeError::Filename)?;
    info!("probe start {} {} -> {}", conn.remote_ip, conn.remote_port, filename);

    let payload = probe.run(&conn.remote_ip).await?;

    let dir = layout
        .make_output_directory(Utc::now().date_naive())
        .map_err(|source| ProbeError::Write {
            path: layout.root().to_path_buf(),
            source,
        })?;
    let path = dir.join(&filename);
    tokio::fs::write(&path, &payload)
        .await
        .map_err(|source| ProbeError::Write {
            path: path.clone(),
            source,
        })?;

    info!("wrote {} bytes to {}", payload.len(), path.display());
    Ok(path)
}

/// Runs [`probe_connection`] and logs instead of returning errors.
pub async fn probe_and_log(conn: Connection, probe: &ProbeCommand, layout: &OutputLayout) -> bool {
    match probe_connection(&conn, probe, layout).await {
        Ok(_) => true,
        Err(e) => {
            warn!("probe {} failed: {}", conn.remote_ip, e);
            false
        }
    }
}
