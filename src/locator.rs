//! Locates the running language_server process and recovers the launch-time
//! credentials embedded in its command line.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sysinfo::System;

use crate::error::Result;

/// Case-sensitive substring the target process name must contain.
pub const PROCESS_NAME_FILTER: &str = "language_server";

const ENUMERATION_TIMEOUT: Duration = Duration::from_secs(15);
const PORT_LIST_TIMEOUT: Duration = Duration::from_secs(5);

static EXTENSION_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--extension_server_port[=\s]+(\d+)").expect("regex compile"));
static CSRF_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)--csrf[_-]token[=\s]+(\S+)").expect("regex compile"));

/// One enumerated process: numeric id plus its full command-line text.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command_line: String,
}

/// Credentials recovered from a matching process. Immutable; rebuilt from
/// scratch on every discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCredentials {
    pub pid: u32,
    pub csrf_token: String,
    /// `--extension_server_port` value, used as a last-resort API port.
    pub extension_port: Option<u16>,
}

/// Host queries the locator depends on. Production uses [`SystemProcessSource`];
/// tests substitute fakes.
#[async_trait]
pub trait ProcessSource: Send + Sync {
    /// Processes whose name contains `name_filter`, with full command lines.
    async fn matching_processes(&self, name_filter: &str) -> Result<Vec<ProcessEntry>>;

    /// TCP ports `pid` is listening on, deduplicated and sorted ascending.
    async fn listening_ports(&self, pid: u32) -> Result<Vec<u16>>;
}

/// Find the first matching process that exposes a non-empty CSRF token.
///
/// Enumeration failure, zero matches, and token-less matches all collapse to
/// `None`; the distinct reasons only show up in the logs.
pub async fn locate(source: &dyn ProcessSource) -> Option<ProcessCredentials> {
    let entries = match source.matching_processes(PROCESS_NAME_FILTER).await {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!("process enumeration failed: {error:#}");
            return None;
        }
    };

    if entries.is_empty() {
        tracing::debug!("no process matching `{PROCESS_NAME_FILTER}` is running");
        return None;
    }

    for entry in &entries {
        match extract_credentials(entry) {
            Some(credentials) => {
                tracing::info!(
                    "pid {}: extension_port={:?}, csrf_token={}",
                    credentials.pid,
                    credentials.extension_port,
                    redact_token(&credentials.csrf_token),
                );
                return Some(credentials);
            }
            None => {
                tracing::debug!("pid {}: no CSRF token in command line, skipping", entry.pid);
            }
        }
    }

    tracing::warn!(
        "found {} matching process(es) but none carried a CSRF token",
        entries.len()
    );
    None
}

/// Pull the CSRF token (mandatory) and extension port (optional) out of a
/// command line. Returns `None` when the token flag is missing.
pub fn extract_credentials(entry: &ProcessEntry) -> Option<ProcessCredentials> {
    let csrf_token = CSRF_TOKEN_RE
        .captures(&entry.command_line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())?;

    let extension_port = EXTENSION_PORT_RE
        .captures(&entry.command_line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok());

    Some(ProcessCredentials {
        pid: entry.pid,
        csrf_token,
        extension_port,
    })
}

/// Shorten a token to a `prefix…suffix` sliver safe to log.
pub fn redact_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() > 10 {
        let head: String = chars[..6].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}…{tail}")
    } else {
        let head: String = chars.iter().take(6).collect();
        format!("{head}****")
    }
}

/// Live host implementation backed by sysinfo plus a platform subprocess for
/// socket state.
pub struct SystemProcessSource;

#[async_trait]
impl ProcessSource for SystemProcessSource {
    async fn matching_processes(&self, name_filter: &str) -> Result<Vec<ProcessEntry>> {
        let filter = name_filter.to_owned();
        let entries = tokio::time::timeout(
            ENUMERATION_TIMEOUT,
            tokio::task::spawn_blocking(move || {
                let mut system = System::new();
                system.refresh_processes();
                system
                    .processes()
                    .iter()
                    .filter(|(_, process)| process.name().contains(&filter))
                    .map(|(pid, process)| ProcessEntry {
                        pid: pid.as_u32(),
                        command_line: process.cmd().join(" "),
                    })
                    .collect::<Vec<_>>()
            }),
        )
        .await
        .context("process enumeration timed out")?
        .context("process enumeration task failed")?;
        Ok(entries)
    }

    async fn listening_ports(&self, pid: u32) -> Result<Vec<u16>> {
        let stdout = query_listening_ports(pid).await?;
        let ports = sys::parse_listening_ports(&stdout);
        tracing::debug!("pid {pid} listening ports: {ports:?}");
        Ok(ports)
    }
}

async fn query_listening_ports(pid: u32) -> Result<String> {
    let output = tokio::time::timeout(PORT_LIST_TIMEOUT, sys::port_list_command(pid).output())
        .await
        .context("port listing timed out")?
        .context("running port listing command")?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(unix)]
mod sys {
    use std::collections::BTreeSet;

    use once_cell::sync::Lazy;
    use regex::Regex;
    use tokio::process::Command;

    static LISTEN_PORT_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r":(\d+)\s+\(LISTEN\)").expect("regex compile"));

    pub fn port_list_command(pid: u32) -> Command {
        let mut command = Command::new("lsof");
        command.args(["-nP", "-iTCP", "-sTCP:LISTEN", "-a", "-p"]);
        command.arg(pid.to_string());
        command
    }

    pub fn parse_listening_ports(stdout: &str) -> Vec<u16> {
        let ports: BTreeSet<u16> = LISTEN_PORT_RE
            .captures_iter(stdout)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| m.as_str().parse::<u16>().ok())
            .collect();
        ports.into_iter().collect()
    }
}

#[cfg(windows)]
mod sys {
    use std::collections::BTreeSet;

    use tokio::process::Command;

    pub fn port_list_command(pid: u32) -> Command {
        let script = format!(
            "Get-NetTCPConnection -OwningProcess {pid} -State Listen -ErrorAction SilentlyContinue \
             | Select-Object -ExpandProperty LocalPort | Sort-Object -Unique"
        );
        let mut command = Command::new("powershell");
        command.args(["-NoProfile", "-Command", &script]);
        command
    }

    pub fn parse_listening_ports(stdout: &str) -> Vec<u16> {
        let ports: BTreeSet<u16> = stdout
            .lines()
            .filter_map(|line| line.trim().parse::<u16>().ok())
            .collect();
        ports.into_iter().collect()
    }
}
