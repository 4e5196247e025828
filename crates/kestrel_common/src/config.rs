//! Configuration surface for the directory core.
//!
//! Deserializes from the server's TOML config file; every section has serde
//! defaults so a missing section means "defaults throughout".

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

/// Entry-store behavior toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Allow `delete_subtree` requests. Leaf-only delete stays the default
    /// even when this is on; recursive delete must be explicitly requested
    /// per operation.
    pub allow_recursive_delete: bool,
    /// During bulk import, log progress every N entries (0 = silent).
    pub bulk_import_log_every: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            allow_recursive_delete: false,
            bulk_import_log_every: 10_000,
        }
    }
}

/// Default search limits, overridable per request. 0 means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub default_size_limit: usize,
    pub default_time_limit_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_size_limit: 0,
            default_time_limit_ms: 0,
        }
    }
}

/// Export defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub existing_file_behavior: ExistingFileBehavior,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub hash: bool,
    #[serde(default)]
    pub sign: bool,
    /// Column at which LDIF lines are folded (0 = no folding).
    #[serde(default = "default_wrap_column")]
    pub wrap_column: usize,
}

fn default_wrap_column() -> usize {
    76
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            existing_file_behavior: ExistingFileBehavior::Fail,
            compress: false,
            hash: false,
            sign: false,
            wrap_column: default_wrap_column(),
        }
    }
}

/// How an export treats an already-existing destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingFileBehavior {
    Append,
    Overwrite,
    #[default]
    Fail,
}

impl FromStr for ExistingFileBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "overwrite" => Ok(Self::Overwrite),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown existing-file behavior: {other}")),
        }
    }
}

/// Scope of a search or scan relative to its base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    /// The base entry only.
    Base,
    /// Immediate children, excluding the base.
    OneLevel,
    /// The base and every descendant.
    #[default]
    WholeSubtree,
    /// Every descendant, excluding the base.
    SubordinateSubtree,
}

impl SearchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::OneLevel => "one",
            Self::WholeSubtree => "sub",
            Self::SubordinateSubtree => "subordinate",
        }
    }
}

impl std::fmt::Display for SearchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "one" | "onelevel" => Ok(Self::OneLevel),
            "sub" | "subtree" => Ok(Self::WholeSubtree),
            "subordinate" | "subordinatesubtree" => Ok(Self::SubordinateSubtree),
            other => Err(format!("unknown search scope: {other}")),
        }
    }
}

/// Alias-dereference policy carried on search requests. The core records
/// it and hands it to the (out-of-scope) dereference collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DereferencePolicy {
    #[default]
    Never,
    Always,
    Search,
    Find,
}

impl FromStr for DereferencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            "search" => Ok(Self::Search),
            "find" => Ok(Self::Find),
            other => Err(format!("unknown dereference policy: {other}")),
        }
    }
}
