//! Locating environment tools on a host
//!
//! Non-interactive shells rarely have conda on `PATH`, so a tool is looked up
//! over a fixed ladder, each rung tried only when the previous one failed:
//!
//! 1. `command -v` in the default shell
//! 2. `command -v` after sourcing the user's shell profiles
//! 3. a list of conventional install locations
//! 4. inference from sibling `envs/` directories
//!
//! The first hit is cached per host and tool.

use dashmap::DashMap;
use serve_core::{ExecutionTarget, HostIdentity};
use std::fmt;
use tracing::{debug, info};

/// Environment managers understood by `run -n <env>`, in preference order
pub const CONDA_TOOLS: &[&str] = &["conda", "mamba", "micromamba"];

const PROFILES: &str = "~/.bashrc ~/.bash_profile ~/.profile ~/.zshrc";

const INSTALL_ROOTS: &[&str] = &[
    "$HOME/miniconda3",
    "$HOME/anaconda3",
    "$HOME/miniforge3",
    "$HOME/mambaforge",
    "$HOME/micromamba",
    "$HOME/.local",
    "/opt/conda",
    "/opt/miniconda3",
    "/opt/anaconda3",
    "/opt/miniforge3",
    "/usr/local/miniconda3",
    "/usr/local/anaconda3",
    "/usr/local",
];

/// A rung of the lookup ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStep {
    Path,
    Profile,
    Conventional,
    Sibling,
}

impl DiscoveryStep {
    pub const LADDER: [DiscoveryStep; 4] = [
        DiscoveryStep::Path,
        DiscoveryStep::Profile,
        DiscoveryStep::Conventional,
        DiscoveryStep::Sibling,
    ];

    pub fn command(self, tool: &str) -> String {
        match self {
            DiscoveryStep::Path => format!("command -v {} 2>/dev/null", tool),
            DiscoveryStep::Profile => format!(
                "bash -lc 'for f in {}; do [ -f \"$f\" ] && . \"$f\" >/dev/null 2>&1; done; command -v {}' 2>/dev/null",
                PROFILES, tool
            ),
            DiscoveryStep::Conventional => {
                let candidates = INSTALL_ROOTS
                    .iter()
                    .map(|root| format!("\"{}/bin/{}\"", root, tool))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!(
                    "for p in {}; do [ -x \"$p\" ] && echo \"$p\" && break; done",
                    candidates
                )
            }
            DiscoveryStep::Sibling => format!(
                "for d in \"$HOME\"/*/envs /opt/*/envs; do [ -x \"$d/../bin/{tool}\" ] && echo \"$(cd \"$d/..\" && pwd)/bin/{tool}\" && break; done 2>/dev/null",
                tool = tool
            ),
        }
    }
}

impl fmt::Display for DiscoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiscoveryStep::Path => "path",
            DiscoveryStep::Profile => "profile",
            DiscoveryStep::Conventional => "conventional",
            DiscoveryStep::Sibling => "sibling",
        };
        f.write_str(name)
    }
}

/// An absolute path on the first line of `output`. `command -v` prints a
/// bare name for shell functions and aliases, which does not count.
fn absolute_path(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| line.starts_with('/'))
        .map(str::to_string)
}

/// Cached tool lookup
#[derive(Debug, Default)]
pub struct ToolDiscovery {
    cache: DashMap<String, String>,
}

impl ToolDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_key(identity: &HostIdentity, tool: &str) -> String {
        format!("{}|{}", identity.key(), tool)
    }

    /// Absolute path of `tool` on `host`, or `None` when every rung fails
    pub async fn locate(&self, host: &dyn ExecutionTarget, tool: &str) -> Option<String> {
        let key = Self::cache_key(host.identity(), tool);
        if let Some(path) = self.cache.get(&key) {
            return Some(path.value().clone());
        }

        for step in DiscoveryStep::LADDER {
            let result = host.run(&step.command(tool)).await;
            if let Some(path) = absolute_path(&result.stdout) {
                info!(host = %host.identity(), tool, step = %step, path = %path, "Located tool");
                self.cache.insert(key, path.clone());
                return Some(path);
            }
            debug!(host = %host.identity(), tool, step = %step, "Tool lookup missed");
        }
        None
    }

    /// First of `tools` that can be located, with its path
    pub async fn locate_any(&self, host: &dyn ExecutionTarget, tools: &[&str]) -> Option<(String, String)> {
        for tool in tools {
            if let Some(path) = self.locate(host, tool).await {
                return Some((tool.to_string(), path));
            }
        }
        None
    }

    /// A conda-compatible environment manager
    pub async fn conda(&self, host: &dyn ExecutionTarget) -> Option<(String, String)> {
        self.locate_any(host, CONDA_TOOLS).await
    }

    pub fn cached(&self, identity: &HostIdentity, tool: &str) -> Option<String> {
        self.cache.get(&Self::cache_key(identity, tool)).map(|p| p.value().clone())
    }

    /// Forget every tool located on `identity`
    pub fn clear(&self, identity: &HostIdentity) {
        let prefix = format!("{}|", identity.key());
        self.cache.retain(|key, _| !key.starts_with(&prefix));
    }
}
