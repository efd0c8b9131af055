//! Hosts file synchronizer.
//!
//! The daemon owns a *managed region* at the end of the target file.  It
//! starts at [`START_MARKER`] and runs to end of file; everything before it
//! belongs to the user and is carried over unchanged.  Each synchronization
//! renders the whole region from the registry and swaps the file in one
//! rename, so readers see either the old or the new file, never a mix:
//!
//! ```text
//! 127.0.0.1    localhost
//!
//!
//! #-----------Docker-Hoster-Domains----------
//! 172.17.0.2    app   web1   web1.local
//! 172.17.0.5    proxy
//!
//! #-----------Traefik-Hosts-----------
//! 172.17.0.5    blog.example
//!
//! #-----Do-not-add-hosts-after-this-line-----
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use log::{debug, info};

use crate::error::HostsError;
use crate::registry::ContainerRegistry;

/// First line of the managed region.
pub const START_MARKER: &str = "#-----------Docker-Hoster-Domains----------";
/// Heads the line that points proxy-claimed hostnames at the proxy.
pub const PROXY_MARKER: &str = "#-----------Traefik-Hosts-----------";
/// Last line of the managed region.
pub const END_MARKER: &str = "#-----Do-not-add-hosts-after-this-line-----";

/// Outcome of one [`apply`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    /// Number of lines in the rendered managed region.
    pub region_lines: usize,
    /// False when the file already had the rendered content.
    pub written: bool,
}

/// Values derived from the whole registry before rendering.
struct RenderState<'a> {
    claimed_hostnames: BTreeSet<&'a str>,
    proxy_address: Option<&'a str>,
}

impl<'a> RenderState<'a> {
    fn from_registry(registry: &'a ContainerRegistry) -> Self {
        let mut claimed_hostnames = BTreeSet::new();
        let mut proxy_address = None;
        for (_, record) in registry.all() {
            claimed_hostnames.extend(record.proxy_claimed_hostnames.iter().map(String::as_str));
            if record.is_proxy && proxy_address.is_none() {
                proxy_address = record.first_address();
            }
        }
        Self {
            claimed_hostnames,
            proxy_address,
        }
    }

    /// Hostnames claimed by the proxy only move when a proxy is running.
    fn is_redirected(&self, domain: &str) -> bool {
        self.proxy_address.is_some() && self.claimed_hostnames.contains(domain)
    }
}

/// Renders the managed region for `registry`, one entry per element.
///
/// An empty registry renders nothing, not even the start marker.  Bindings
/// without an address, or whose hostnames have all been redirected to the
/// proxy, produce no line.
pub fn render(registry: &ContainerRegistry) -> Vec<String> {
    if registry.is_empty() {
        return Vec::new();
    }
    let state = RenderState::from_registry(registry);

    let mut lines = vec![START_MARKER.to_string()];
    for (_, record) in registry.all() {
        for binding in record.networks.iter().filter(|b| !b.ip.is_empty()) {
            let domains: Vec<&str> = binding
                .domains
                .iter()
                .map(String::as_str)
                .filter(|domain| !state.is_redirected(domain))
                .collect();
            if domains.is_empty() {
                continue;
            }
            lines.push(entry_line(&binding.ip, &domains));
        }
    }

    if let Some(proxy_address) = state.proxy_address {
        if !state.claimed_hostnames.is_empty() {
            let claimed: Vec<&str> = state.claimed_hostnames.iter().copied().collect();
            lines.push(String::new());
            lines.push(PROXY_MARKER.to_string());
            lines.push(entry_line(proxy_address, &claimed));
            lines.push(String::new());
        }
    }

    lines.push(END_MARKER.to_string());
    lines
}

fn entry_line(ip: &str, domains: &[&str]) -> String {
    format!("{}    {}", ip, domains.join("   "))
}

/// Returns the unmanaged part of `content`: everything before the first
/// start marker line, minus trailing blank lines.
pub fn strip_managed_region(content: &str) -> &str {
    let mut head_len = content.len();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if line.strip_suffix('\n').unwrap_or(line) == START_MARKER {
            head_len = offset;
            break;
        }
        offset += line.len();
    }

    let head = &content[..head_len];
    let mut keep = 0;
    let mut offset = 0;
    for line in head.split_inclusive('\n') {
        offset += line.len();
        if !line.trim().is_empty() {
            keep = offset;
        }
    }
    &head[..keep]
}

/// Joins the unmanaged prefix and the rendered region into the new file
/// content, with two blank lines between them.
fn compose(prefix: &str, region: &[String]) -> String {
    let mut content = String::from(prefix);
    if region.is_empty() {
        return content;
    }
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str("\n\n");
    for line in region {
        content.push_str(line);
        content.push('\n');
    }
    content
}

/// Rewrites the managed region of `path` to match `registry`.
pub fn apply(path: &Path, registry: &ContainerRegistry) -> Result<ApplySummary, HostsError> {
    let current = fs::read_to_string(path).map_err(|source| HostsError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let region = render(registry);
    let updated = compose(strip_managed_region(&current), &region);

    if region.is_empty() {
        info!("Removing all managed hosts from {}", path.display());
    } else {
        info!("Updating {} with:\n{}", path.display(), region.join("\n"));
    }

    let written = updated != current;
    if written {
        replace(path, &updated)?;
    } else {
        debug!("{} already up to date", path.display());
    }

    Ok(ApplySummary {
        region_lines: region.len(),
        written,
    })
}

/// Writes `content` to a sibling temporary file and renames it over `path`.
fn replace(path: &Path, content: &str) -> Result<(), HostsError> {
    let write_err = |source: std::io::Error| HostsError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".hoster-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;

    temp.write_all(content.as_bytes()).map_err(write_err)?;
    // Temp files are created 0600; keep the target readable by resolvers.
    if let Ok(metadata) = fs::metadata(path) {
        temp.as_file()
            .set_permissions(metadata.permissions())
            .map_err(write_err)?;
    }
    temp.as_file().sync_all().map_err(write_err)?;

    // On failure the temp file is dropped (and deleted) with the error.
    temp.persist(path).map_err(|e| HostsError::Persist {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}
