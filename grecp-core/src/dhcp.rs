//! DHCP over the tunnel through busybox `udhcpc` / `udhcpc6`.
//!
//! The helper runs in the foreground for a single lease (`-q`) and calls a
//! small script on each event. The script prints the lease as `key=value`
//! lines, which end up on the helper's stdout and are parsed once it exits.

use crate::session::{Dhcp4Lease, Dhcp6Lease};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Script run by udhcpc on every event
pub const DHCP_SCRIPT: &str = r#"#!/bin/busybox sh
if [ "${1}" = "bound" ]
then
    if [ -n "${ip}" ]
    then
        echo "ip=${ip}"
        echo "lease=${lease}"
    elif [ -n "${ipv6prefix}" ]
    then
        echo "prefix_address=${ipv6prefix%/*}"
        echo "prefix_length=${ipv6prefix#*/}"
        echo "lease=${ipv6prefix_lease}"
    fi
fi
"#;

/// DHCP helper errors
#[derive(Debug, thiserror::Error)]
pub enum DhcpError {
    #[error("Failed to write DHCP script {path}: {source}")]
    Script { path: PathBuf, source: io::Error },

    #[error("Failed to start {applet}: {source}")]
    Spawn { applet: &'static str, source: io::Error },

    #[error("{applet} exited with {status}")]
    Exit { applet: &'static str, status: std::process::ExitStatus },

    #[error("Failed to read {applet} output: {source}")]
    Output { applet: &'static str, source: io::Error },
}

/// The helper script on disk, removed on drop
#[derive(Debug)]
pub struct DhcpScript {
    path: PathBuf,
}

impl DhcpScript {
    /// Write the script to a fresh file in `dir`, readable and executable
    /// only by the owner
    pub fn create_in(dir: &Path) -> Result<Self, DhcpError> {
        let path = dir.join(format!("grecp-client.{}.dhcp.sh", std::process::id()));
        let script_err = |source| DhcpError::Script {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&path)
            .map_err(script_err)?;
        file.write_all(DHCP_SCRIPT.as_bytes()).map_err(script_err)?;

        tracing::debug!("Wrote DHCP script to {}", path.display());
        Ok(Self { path })
    }

    pub fn create() -> Result<Self, DhcpError> {
        Self::create_in(&std::env::temp_dir())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DhcpScript {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove DHCP script {}: {e}", self.path.display());
        }
    }
}

/// Address family a helper negotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn applet(self) -> &'static str {
        match self {
            Self::Ipv4 => "udhcpc",
            Self::Ipv6 => "udhcpc6",
        }
    }
}

/// A DHCP client process the control loop can start and poll.
pub trait LeaseHelper: Send {
    fn family(&self) -> Family;

    /// Start negotiating on `interface`
    fn start(&mut self, interface: &str) -> Result<(), DhcpError>;

    /// Check on the helper without blocking.
    ///
    /// Returns `None` while it runs (or was never started), and its
    /// output once it has exited successfully.
    fn poll(&mut self) -> Option<Result<String, DhcpError>>;

    fn is_running(&self) -> bool;

    /// Stop the helper if it runs
    fn kill(&mut self);
}

/// busybox udhcpc / udhcpc6
pub struct UdhcpcHelper {
    family: Family,
    busybox: PathBuf,
    script: PathBuf,
    verbose: bool,
    child: Option<Child>,
}

impl UdhcpcHelper {
    pub fn new(family: Family, busybox: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            family,
            busybox: busybox.into(),
            script: script.into(),
            verbose: false,
            child: None,
        }
    }

    /// Pass `-v` to the helper
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Command line after the applet name
    pub fn args(&self, interface: &str) -> Vec<String> {
        let script = self.script.display().to_string();
        let mut args: Vec<String> = match self.family {
            Family::Ipv4 => vec!["-i", interface, "-s", script.as_str(), "-n", "-q", "-f", "-C"],
            Family::Ipv6 => vec![
                "-i",
                interface,
                "-s",
                script.as_str(),
                "-f",
                "-n",
                "-q",
                "-r",
                "no",
                "-d",
            ],
        }
        .into_iter()
        .map(String::from)
        .collect();
        if self.verbose {
            args.push("-v".to_string());
        }
        args
    }

    fn collect_output(&self, child: &mut Child) -> Result<String, DhcpError> {
        let applet = self.family.applet();
        let mut output = String::new();
        if let Some(stdout) = child.stdout.as_mut() {
            stdout
                .read_to_string(&mut output)
                .map_err(|source| DhcpError::Output { applet, source })?;
        }
        if let Some(stderr) = child.stderr.as_mut() {
            stderr
                .read_to_string(&mut output)
                .map_err(|source| DhcpError::Output { applet, source })?;
        }
        Ok(output)
    }
}

impl LeaseHelper for UdhcpcHelper {
    fn family(&self) -> Family {
        self.family
    }

    fn start(&mut self, interface: &str) -> Result<(), DhcpError> {
        let applet = self.family.applet();
        let child = Command::new(&self.busybox)
            .arg0(applet)
            .args(self.args(interface))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DhcpError::Spawn { applet, source })?;

        tracing::info!("Started {} with pid {}", applet, child.id());
        self.child = Some(child);
        Ok(())
    }

    fn poll(&mut self) -> Option<Result<String, DhcpError>> {
        let applet = self.family.applet();
        let mut child = self.child.take()?;

        match child.try_wait() {
            Ok(None) => {
                self.child = Some(child);
                None
            }
            Ok(Some(status)) if status.success() => Some(self.collect_output(&mut child)),
            Ok(Some(status)) => Some(Err(DhcpError::Exit { applet, status })),
            Err(source) => Some(Err(DhcpError::Output { applet, source })),
        }
    }

    fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let applet = self.family.applet();
        match child.kill() {
            Ok(()) => tracing::info!("Killed {} with pid {}", applet, child.id()),
            Err(e) => tracing::error!("Failed to kill {} with pid {}: {e}", applet, child.id()),
        }
        let _ = child.wait();
    }
}

impl Drop for UdhcpcHelper {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Values printed by the helper script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseOutput {
    pub ip: Option<Ipv4Addr>,
    pub prefix_address: Option<Ipv6Addr>,
    pub prefix_length: Option<u8>,
    pub lease: Option<u32>,
}

/// Parse helper output. Unrecognised lines are logged at debug.
pub fn parse_lease_output(output: &str) -> LeaseOutput {
    let mut parsed = LeaseOutput::default();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some(("ip", value)) => parsed.ip = value.parse().ok(),
            Some(("prefix_address", value)) => parsed.prefix_address = value.parse().ok(),
            Some(("prefix_length", value)) => parsed.prefix_length = value.parse().ok(),
            Some(("lease", value)) => parsed.lease = value.parse().ok(),
            _ => tracing::debug!("{line}"),
        }
    }
    parsed
}

impl LeaseOutput {
    pub fn lease_time(&self) -> Option<Duration> {
        self.lease
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(u64::from(secs)))
    }

    /// IPv4 lease, if the output holds a usable one
    pub fn into_dhcp4(self, obtained: Duration) -> Option<Dhcp4Lease> {
        Some(Dhcp4Lease {
            lease_time: self.lease_time()?,
            ip: self.ip?,
            obtained,
        })
    }

    /// Delegated IPv6 prefix, if the output holds a usable one
    pub fn into_dhcp6(self, obtained: Duration) -> Option<Dhcp6Lease> {
        Some(Dhcp6Lease {
            lease_time: self.lease_time()?,
            prefix_address: self.prefix_address?,
            prefix_length: self.prefix_length?,
            obtained,
        })
    }
}
