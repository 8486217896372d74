//! The working-container surface the engine builds against.
//!
//! A [`Builder`] represents one mutable working container created from a base
//! image. The engine mounts it, copies into it, runs commands in it, rewrites
//! its configuration, and commits it; how any of that is implemented (overlay
//! mounts, OCI runtimes, chroots) is the backend's business.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::store::ImageRef;

/// Shared writable sink for progress and process output.
pub type LogSink = Arc<Mutex<dyn Write + Send>>;

/// Shared readable stream wired to RUN's stdin.
pub type InputStream = Arc<Mutex<dyn Read + Send>>;

pub fn stdout_sink() -> LogSink {
    Arc::new(Mutex::new(std::io::stdout()))
}

pub fn stderr_sink() -> LogSink {
    Arc::new(Mutex::new(std::io::stderr()))
}

/// When to pull the base image for a new working container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullPolicy {
    #[default]
    IfMissing,
    Always,
    Never,
}

/// How RUN commands are isolated from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    #[default]
    Default,
    Oci,
    OciRootless,
    Chroot,
}

/// Whether a new network namespace gets interfaces and routes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkPolicy {
    #[default]
    Default,
    Disabled,
    Enabled,
}

/// Compression applied to committed layer blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Uncompressed,
    Gzip,
    Bzip2,
    Xz,
}

/// Manifest and config format of committed images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Oci,
    Docker,
}

/// A transient mount made available to RUN but never committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

/// One namespace knob for the working container's processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceOption {
    pub name: String,
    pub host: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Id mappings for a per-build user namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMappingOptions {
    pub host_uid_mapping: bool,
    pub host_gid_mapping: bool,
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

/// Healthcheck settings carried in the image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub start_period: Option<Duration>,
    pub retries: u32,
}

/// The configuration recorded in a committed image.
///
/// The engine keeps its own copy per stage, mutates it as metadata
/// instructions are dispatched, and imprints it onto the builder right before
/// each commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub hostname: String,
    pub domainname: String,
    pub user: String,
    /// `KEY=VALUE` entries, in declaration order.
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub shell: Vec<String>,
    pub workdir: String,
    pub labels: BTreeMap<String, String>,
    pub volumes: BTreeSet<String>,
    pub exposed_ports: BTreeSet<String>,
    pub onbuild: Vec<String>,
    pub stop_signal: String,
    pub healthcheck: Option<Healthcheck>,
    pub maintainer: String,
    pub architecture: String,
    pub network_disabled: bool,
}

impl ImageConfig {
    /// Set or replace one `KEY=VALUE` environment entry.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{key}=");
        let entry = format!("{key}={value}");
        if let Some(existing) = self.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            *existing = entry;
        } else {
            self.env.push(entry);
        }
    }

    /// Look up the value of one environment entry.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("{key}=");
        self.env
            .iter()
            .find_map(|e| e.strip_prefix(&prefix))
    }
}

/// Options for creating a working container from a base image.
#[derive(Clone, Default)]
pub struct BuilderOptions {
    pub from_image: String,
    pub pull_policy: PullPolicy,
    pub registry: String,
    pub blob_directory: Option<PathBuf>,
    pub signature_policy_path: Option<PathBuf>,
    pub report_writer: Option<LogSink>,
    pub isolation: Isolation,
    pub namespace_options: Vec<NamespaceOption>,
    pub configure_network: NetworkPolicy,
    pub cni_plugin_path: Option<PathBuf>,
    pub cni_config_dir: Option<PathBuf>,
    pub id_mapping: Option<IdMappingOptions>,
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
    pub default_mounts_file_path: Option<PathBuf>,
    pub format: OutputFormat,
    pub args: BTreeMap<String, String>,
}

/// Options for one `Builder::add` invocation.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub chown: Option<String>,
    pub context_dir: PathBuf,
    pub excludes: Vec<String>,
}

/// Options for one `Builder::run` invocation.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub hostname: String,
    pub runtime: String,
    pub runtime_args: Vec<String>,
    pub no_pivot: bool,
    pub mounts: Vec<Mount>,
    pub env: Vec<String>,
    pub user: String,
    pub workdir: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub stdin: Option<InputStream>,
    pub stdout: Option<LogSink>,
    pub stderr: Option<LogSink>,
    pub quiet: bool,
    pub configure_network: NetworkPolicy,
    pub namespace_options: Vec<NamespaceOption>,
}

/// Options for one `Builder::commit` invocation.
#[derive(Clone, Default)]
pub struct CommitOptions {
    pub compression: Compression,
    pub signature_policy_path: Option<PathBuf>,
    pub additional_tags: Vec<String>,
    pub report_writer: Option<LogSink>,
    pub preferred_format: OutputFormat,
    pub iid_file: Option<PathBuf>,
    pub squash: bool,
    pub blob_directory: Option<PathBuf>,
    /// Image id recorded as the committed image's parent.
    pub parent: Option<String>,
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub image_id: String,
    /// `sha256:<hex>` digest of the committed manifest.
    pub manifest_digest: String,
}

/// One working container.
///
/// `delete` is idempotent; every other mutating call requires the container
/// to still exist. Mutating the configuration only affects future commits.
pub trait Builder {
    fn container_id(&self) -> &str;

    /// Name of the image the container was created from.
    fn from_image(&self) -> &str;

    /// Id of the image the container was created from; recorded as the
    /// parent of committed images.
    fn from_image_id(&self) -> &str;

    /// Top layer id of the base image.
    fn top_layer(&self) -> &str;

    fn config(&self) -> &ImageConfig;

    fn config_mut(&mut self) -> &mut ImageConfig;

    /// The `created_by` string recorded in the next commit's history entry.
    fn set_created_by(&mut self, created_by: &str);

    fn set_annotation(&mut self, key: &str, value: &str);

    /// Mount the container's root filesystem, returning the mountpoint.
    fn mount(&mut self, label: &str) -> Result<PathBuf>;

    /// Copy sources into the working tree. Sources are URLs or absolute host
    /// paths; `download` distinguishes ADD from COPY. The backend performs
    /// glob expansion and applies the exclusion patterns.
    fn add(&mut self, dest: &str, download: bool, options: AddOptions, sources: &[String])
        -> Result<()>;

    /// Run a command inside the container through the configured runtime.
    fn run(&mut self, cancel: &CancelToken, args: &[String], options: RunOptions) -> Result<()>;

    /// Commit the container's contents as a new image under `image_ref`.
    fn commit(&mut self, cancel: &CancelToken, image_ref: &ImageRef, options: CommitOptions)
        -> Result<CommitResult>;

    /// Delete the working container. Safe to call more than once.
    fn delete(&mut self) -> Result<()>;
}
