//! YAML run configuration, defaults, and flag overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zoneshift_core::{MigrationConfig, PollIntervals};
use zoneshift_engine::{CoordinatorSettings, NamespaceScope, ScaleMode, DEFAULT_SYNC_NAMESPACES};

pub const DEFAULT_CONFIG_FILE: &str = "zoneshift.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("failed to write config file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to render example config: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("at least one namespace is required")]
    NoNamespaces,
    #[error("namespace name cannot be empty")]
    EmptyNamespace,
    #[error("targetZone is required")]
    MissingZone,
    #[error("storageClass is required")]
    MissingStorageClass,
    #[error("maxConcurrency must be at least 1")]
    Concurrency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub name: String,
    /// Empty means every PVC in the namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pvcs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_context: Option<String>,
    pub namespaces: Vec<NamespaceEntry>,
    pub target_zone: String,
    pub storage_class: String,
    pub max_concurrency: usize,
    pub dry_run: bool,
    #[serde(rename = "skipArgoCD")]
    pub skip_argocd: bool,
    #[serde(rename = "argoCDNamespaces")]
    pub argocd_namespaces: Vec<String>,
    pub scale_mode: ScaleMode,
    pub drain_timeout_secs: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            kube_context: None,
            namespaces: vec![NamespaceEntry { name: "default".into(), pvcs: Vec::new() }],
            target_zone: "eu-west-1a".into(),
            storage_class: "gp3".into(),
            max_concurrency: 5,
            dry_run: false,
            skip_argocd: false,
            argocd_namespaces: DEFAULT_SYNC_NAMESPACES.iter().map(|s| s.to_string()).collect(),
            scale_mode: ScaleMode::Auto,
            drain_timeout_secs: 300,
        }
    }
}

/// Flag values; only those actually given replace file values.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    /// Kubernetes context to use (defaults to the current context)
    #[arg(long = "context")]
    pub context: Option<String>,
    /// Namespace(s) to migrate, comma separated; every PVC in them is included
    #[arg(short = 'n', long = "namespace", value_delimiter = ',')]
    pub namespaces: Option<Vec<String>>,
    /// Target availability zone
    #[arg(short = 'z', long = "zone")]
    pub zone: Option<String>,
    /// Storage class for the new PVs and PVCs
    #[arg(short = 's', long = "storage-class")]
    pub storage_class: Option<String>,
    /// Maximum concurrent migrations
    #[arg(long = "concurrency")]
    pub concurrency: Option<usize>,
    /// Walk every step without changing anything
    #[arg(long = "dry-run")]
    pub dry_run: bool,
    /// Leave Argo CD applications alone
    #[arg(long = "skip-argocd")]
    pub skip_argocd: bool,
    /// Namespaces searched for Argo CD applications, comma separated
    #[arg(long = "argocd-namespaces", value_delimiter = ',')]
    pub argocd_namespaces: Option<Vec<String>>,
    /// Who scales workloads down: auto or manual
    #[arg(long = "scale-mode")]
    pub scale_mode: Option<ScaleMode>,
    /// Seconds to wait for pods to stop after scaling down
    #[arg(long = "drain-timeout", env = "ZONESHIFT_DRAIN_TIMEOUT_SECS")]
    pub drain_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Missing fields take their defaults.
    pub fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn apply(&mut self, o: &Overrides) {
        if let Some(ctx) = &o.context {
            self.kube_context = Some(ctx.clone());
        }
        if let Some(nss) = &o.namespaces {
            self.namespaces = nss.iter().map(|n| NamespaceEntry { name: n.trim().to_string(), pvcs: Vec::new() }).collect();
        }
        if let Some(z) = &o.zone {
            self.target_zone = z.clone();
        }
        if let Some(sc) = &o.storage_class {
            self.storage_class = sc.clone();
        }
        if let Some(c) = o.concurrency {
            self.max_concurrency = c;
        }
        if o.dry_run {
            self.dry_run = true;
        }
        if o.skip_argocd {
            self.skip_argocd = true;
        }
        if let Some(nss) = &o.argocd_namespaces {
            self.argocd_namespaces = nss.clone();
        }
        if let Some(mode) = o.scale_mode {
            self.scale_mode = mode;
        }
        if let Some(secs) = o.drain_timeout_secs {
            self.drain_timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespaces.is_empty() {
            return Err(ConfigError::NoNamespaces);
        }
        if self.namespaces.iter().any(|n| n.name.trim().is_empty()) {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.target_zone.trim().is_empty() {
            return Err(ConfigError::MissingZone);
        }
        if self.storage_class.trim().is_empty() {
            return Err(ConfigError::MissingStorageClass);
        }
        if self.max_concurrency < 1 {
            return Err(ConfigError::Concurrency);
        }
        Ok(())
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.iter().map(|n| n.name.clone()).collect()
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        let mut s = CoordinatorSettings::new(
            self.namespaces.iter().map(|n| NamespaceScope { name: n.name.clone(), claims: n.pvcs.clone() }).collect(),
        );
        s.sync_search_namespaces = (!self.skip_argocd).then(|| self.argocd_namespaces.clone());
        s.dry_run = self.dry_run;
        s.scale_mode = self.scale_mode;
        s.drain_timeout = Duration::from_secs(self.drain_timeout_secs);
        s
    }

    pub fn migration_config(&self, tasks: Vec<String>, poll: PollIntervals) -> MigrationConfig {
        let mut cfg = MigrationConfig::new(&self.target_zone, &self.storage_class);
        cfg.namespaces = self.namespace_names();
        cfg.max_concurrency = self.max_concurrency;
        cfg.tasks = tasks;
        cfg.dry_run = self.dry_run;
        cfg.poll = poll;
        cfg
    }
}

const EXAMPLE_HEADER: &str = "\
# zoneshift configuration
#
# Migrates PVC-backed EBS volumes to another availability zone.
#
# Each namespace can list the PVCs to migrate. A namespace without a
# `pvcs` list has every PVC in it migrated.
#
# Flags override these values (--zone, --storage-class, ...).

# kubeContext: my-cluster-context  # optional, defaults to the current context

";

pub fn example() -> FileConfig {
    FileConfig {
        namespaces: vec![
            NamespaceEntry { name: "namespace-1".into(), pvcs: vec!["pvc-1".into(), "pvc-2".into()] },
            NamespaceEntry { name: "namespace-2".into(), pvcs: Vec::new() },
        ],
        ..FileConfig::default()
    }
}

pub fn example_text() -> Result<String, ConfigError> {
    Ok(format!("{}{}", EXAMPLE_HEADER, serde_yaml::to_string(&example())?))
}

/// Write the example config, readable only by the owner on unix.
pub fn write_example(path: &Path) -> Result<(), ConfigError> {
    use std::io::Write;

    let text = example_text()?;
    let wrap = |source| ConfigError::Write { path: path.to_path_buf(), source };
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path).map_err(wrap)?;
    file.write_all(text.as_bytes()).map_err(wrap)
}
