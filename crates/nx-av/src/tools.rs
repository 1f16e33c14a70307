//! External tool detection and management.
//!
//! The [`ToolRegistry`] discovers and caches the locations of the external
//! CLI tools the pipeline drives (ffmpeg, mp4info, mp4fragment) and provides
//! lookup methods for the rest of the crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Known tool names that the registry manages.
pub const KNOWN_TOOLS: &[&str] = &["ffmpeg", "mp4info", "mp4fragment"];

/// A discovered external tool.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Human-readable tool name (e.g. "ffmpeg").
    pub name: String,
    /// Resolved path to the executable.
    pub path: PathBuf,
    /// Limit for run-to-completion invocations; `None` runs until exit.
    pub timeout: Option<Duration>,
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Whether the tool was found.
    pub available: bool,
    /// Version string (first line of the tool's banner), if available.
    pub version: Option<String>,
    /// Resolved path to the executable.
    pub path: Option<PathBuf>,
}

/// Registry holding discovered tool configurations.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

impl ToolRegistry {
    /// Discover tools by searching `PATH` (or using overrides from config).
    ///
    /// For each known tool, if the [`nx_core::config::ToolsConfig`] supplies a
    /// custom path **and** that path exists, it is used directly.  Otherwise
    /// [`which::which`] is used to locate the tool in `PATH`.  Tools that are
    /// not found are silently omitted from the registry.
    pub fn discover(tools_config: &nx_core::config::ToolsConfig) -> Self {
        let mut registry = Self::default();

        for &name in KNOWN_TOOLS {
            let custom_path = match name {
                "ffmpeg" => tools_config.ffmpeg_path.as_deref(),
                "mp4info" => tools_config.mp4info_path.as_deref(),
                "mp4fragment" => tools_config.mp4fragment_path.as_deref(),
                _ => None,
            };

            let resolved = match custom_path {
                Some(p) if p.exists() => Some(p.to_path_buf()),
                Some(p) => {
                    tracing::warn!(
                        "Configured path for {name} does not exist ({}); searching PATH",
                        p.display()
                    );
                    which::which(name).ok()
                }
                None => which::which(name).ok(),
            };

            match resolved {
                Some(path) => {
                    tracing::debug!("Found {name} at {}", path.display());
                    registry.insert(name, path, tools_config.timeout(name));
                }
                None => tracing::debug!("{name} not found"),
            }
        }

        registry
    }

    /// Register (or replace) a tool at an explicit path.
    /// The tool runs without a time limit.
    pub fn with_tool(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.insert(name, path.into(), None);
        self
    }

    fn insert(&mut self, name: &str, path: PathBuf, timeout: Option<Duration>) {
        self.tools.insert(
            name.to_string(),
            ToolConfig {
                name: name.to_string(),
                path,
                timeout,
            },
        );
    }

    /// Return a reference to the [`ToolConfig`] for the given tool, or an
    /// [`nx_core::Error::Tool`] if the tool was not found during discovery.
    pub fn require(&self, name: &str) -> nx_core::Result<&ToolConfig> {
        self.tools
            .get(name)
            .ok_or_else(|| nx_core::Error::tool(name, format!("{name} not found; is it installed and in PATH?")))
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&name| match self.tools.get(name) {
                Some(cfg) => ToolInfo {
                    name: name.to_string(),
                    available: true,
                    version: detect_version(name, &cfg.path),
                    path: Some(cfg.path.clone()),
                },
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                },
            })
            .collect()
    }

    /// Iterate over all registered tool configs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ToolConfig)> {
        self.tools.iter()
    }
}

/// Return the first line of the tool's version banner.
///
/// ffmpeg answers `-version`; the Bento4 tools print their banner (with the
/// version) as part of the usage text and exit non-zero, so their status is
/// not checked.
fn detect_version(name: &str, path: &Path) -> Option<String> {
    let mut cmd = std::process::Command::new(path);
    if name == "ffmpeg" {
        cmd.arg("-version");
    }

    let output = cmd.output().ok()?;

    if name == "ffmpeg" && !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|s| s.trim().to_string())
}
