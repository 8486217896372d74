//! The build engine: options, progress logging, and the entry point that
//! turns Dockerfile paths into a committed image.

pub mod cache;
pub mod executor;
pub mod preprocess;
pub mod stage_executor;
pub mod step;
pub mod volume;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dockerfile_parser::Dockerfile;
use once_cell::sync::Lazy;
use tracing::debug;

pub use crate::builder::{stderr_sink, stdout_sink};
use crate::builder::{
    Compression, IdMappingOptions, InputStream, Isolation, LogSink, Mount, NamespaceOption,
    NetworkPolicy, OutputFormat, PullPolicy,
};
use crate::cancel::CancelToken;
use crate::error::BuildError;
pub use crate::image::executor::Executor;
pub use crate::image::step::BuildStage;
use crate::store::{CanonicalRef, Store};

/// Build args accepted without a matching `ARG` declaration. Everything else
/// that goes unconsumed is reported at the end of the build.
pub static BUILTIN_ALLOWED_BUILD_ARGS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "HTTP_PROXY",
        "http_proxy",
        "HTTPS_PROXY",
        "https_proxy",
        "FTP_PROXY",
        "ftp_proxy",
        "NO_PROXY",
        "no_proxy",
    ]
    .into_iter()
    .collect()
});

/// Presence of this variable passes no-pivot-root through to the runtime.
pub(crate) const NOPIVOT_ENV: &str = "IMAGEFORGE_NOPIVOT";

/// Step-counting progress logger. Each recorded message is prefixed with an
/// auto-incrementing `STEP N:`.
#[derive(Clone)]
pub struct BuildLog {
    sink: LogSink,
    counter: Arc<AtomicUsize>,
}

impl BuildLog {
    pub fn to_sink(sink: LogSink) -> Self {
        Self {
            sink,
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stderr() -> Self {
        Self::to_sink(stderr_sink())
    }

    pub fn record(&self, message: &str) {
        let step = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "STEP {step}: {message}");
        }
    }
}

impl Default for BuildLog {
    fn default() -> Self {
        Self::stderr()
    }
}

/// Everything that can be tuned about one build.
#[derive(Clone, Default)]
pub struct BuildOptions {
    /// Default source location for COPY and ADD.
    pub context_directory: PathBuf,
    pub pull_policy: PullPolicy,
    /// Prepended to image names that cannot be resolved as written. No
    /// separator is implicitly added.
    pub registry: String,
    /// Log instructions we don't recognize and keep going, instead of
    /// failing the build.
    pub ignore_unrecognized_instructions: bool,
    /// Suppress step announcements.
    pub quiet: bool,
    pub isolation: Isolation,
    /// Command invoked for RUN instructions; takes runc-compatible flags.
    pub runtime: String,
    pub runtime_args: Vec<String>,
    /// Mounts available during RUN but absent from the committed image.
    pub transient_mounts: Vec<Mount>,
    pub compression: Compression,
    /// Values interpolated into the Dockerfile's ARG declarations.
    pub args: BTreeMap<String, String>,
    /// Name the final image is written under.
    pub output: String,
    pub additional_tags: Vec<String>,
    /// Progress callback; defaults to a `STEP N:` counter on the error sink.
    pub log: Option<BuildLog>,
    /// Connected to stdin for RUN instructions.
    pub input: Option<InputStream>,
    /// Non-error build output; defaults to stdout.
    pub out: Option<LogSink>,
    /// Error log output; defaults to stderr.
    pub err: Option<LogSink>,
    pub signature_policy_path: Option<PathBuf>,
    /// Progress reporting for pulls and the final image write.
    pub report_writer: Option<LogSink>,
    pub output_format: OutputFormat,
    pub namespace_options: Vec<NamespaceOption>,
    pub configure_network: NetworkPolicy,
    pub cni_plugin_path: Option<PathBuf>,
    pub cni_config_dir: Option<PathBuf>,
    pub id_mapping: Option<IdMappingOptions>,
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
    /// File listing host-path:container-path mounts applied to every RUN.
    pub default_mounts_file_path: Option<PathBuf>,
    /// Write the final image id here instead of printing it.
    pub iid_file: Option<PathBuf>,
    pub squash: bool,
    /// `key=value` label strings overlaid onto every committed image.
    pub labels: Vec<String>,
    /// `key=value` annotation strings overlaid onto every committed image.
    pub annotations: Vec<String>,
    /// Commit a cacheable image per step instead of one image per stage.
    pub layers: bool,
    /// Build from scratch without consulting cached images.
    pub no_cache: bool,
    /// Remove intermediate containers once the build succeeds.
    pub remove_intermediate_ctrs: bool,
    /// Remove intermediate containers even when the build fails.
    pub force_rm_intermediate_ctrs: bool,
    /// Directory for caching layer blobs.
    pub blob_directory: Option<PathBuf>,
    /// Stop after the stage with this name.
    pub target: Option<String>,
}

impl BuildOptions {
    /// Options wired for a build rooted at `context_directory`, with layer
    /// caching on and intermediate containers removed on success.
    pub fn for_context(context_directory: impl Into<PathBuf>) -> Self {
        Self {
            context_directory: context_directory.into(),
            runtime: "runc".to_string(),
            layers: true,
            remove_intermediate_ctrs: true,
            ..Self::default()
        }
    }
}

/// Load `.dockerignore` exclusion patterns from the context directory.
/// A missing file means no exclusions.
pub fn parse_dockerignore(context_dir: &Path) -> Result<Vec<String>> {
    let path = context_dir.join(".dockerignore");
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Parse one or more Dockerfiles (paths or URLs), preprocess them, and run
/// the resulting stages to completion. Returns the final image id and, when
/// the output name parses as a docker reference, its canonical digest form.
pub fn build_dockerfiles(
    cancel: &CancelToken,
    store: Arc<dyn Store>,
    options: BuildOptions,
    paths: &[&str],
) -> Result<(String, Option<CanonicalRef>)> {
    if paths.is_empty() {
        return Err(BuildError::NoDockerfiles.into());
    }
    let mut contents = Vec::with_capacity(paths.len());
    for path in paths {
        let (resolved_name, body) = read_dockerfile(path, &options.context_directory)?;
        let body = if resolved_name.ends_with(".in") {
            preprocess::preprocess_dockerfile_contents(&body, &options.context_directory)?
        } else {
            body
        };
        contents.push(body);
    }

    let contents = preprocess::process_copy_from(contents);
    let combined = contents.join("\n");
    let dockerfile = Dockerfile::parse(&combined).context("parsing Dockerfile")?;

    let target = options.target.clone();
    let provided_args = options.args.clone();
    let mut exec = Executor::new(store, options)?;
    for name in step::global_arg_names(&dockerfile) {
        exec.mark_arg_used(&name);
    }
    let from_args = step::global_arg_values(&dockerfile, &provided_args);
    let mut stages = step::split_stages(&dockerfile, &combined, &from_args)
        .context("reading multiple stages")?;
    if let Some(target) = target.filter(|t| !t.is_empty()) {
        let Some(position) = stages.iter().position(|stage| stage.name == target) else {
            return Err(BuildError::TargetNotFound(target).into());
        };
        stages.truncate(position + 1);
    }
    exec.build(cancel, &stages)
}

/// Fetch one Dockerfile by URL or path. Local paths are retried under the
/// context directory, directories resolve to their `Dockerfile`, and empty
/// content is an error. Returns the resolved name alongside the content.
fn read_dockerfile(path: &str, context_dir: &Path) -> Result<(String, String)> {
    if path.starts_with("http://") || path.starts_with("https://") {
        debug!(path, "reading remote Dockerfile");
        let response =
            reqwest::blocking::get(path).with_context(|| format!("getting {path:?}"))?;
        let body = response
            .text()
            .with_context(|| format!("reading {path:?}"))?;
        if body.is_empty() {
            return Err(BuildError::EmptyDockerfile(path.to_string()).into());
        }
        return Ok((path.to_string(), body));
    }
    let mut file = PathBuf::from(path);
    if !file.exists() {
        file = context_dir.join(path);
    }
    let metadata =
        fs::metadata(&file).with_context(|| format!("reading info about {path:?}"))?;
    if metadata.is_dir() {
        file = file.join("Dockerfile");
    }
    debug!(path = %file.display(), "reading local Dockerfile");
    let body =
        fs::read_to_string(&file).with_context(|| format!("reading {:?}", file.display()))?;
    if body.is_empty() {
        return Err(BuildError::EmptyDockerfile(path.to_string()).into());
    }
    Ok((file.to_string_lossy().into_owned(), body))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex};

    use tempfile::tempdir;

    use super::{parse_dockerignore, read_dockerfile, BuildLog};
    use crate::builder::LogSink;
    use crate::error::BuildError;

    #[test]
    fn test_parse_dockerignore_missing_file() {
        let dir = tempdir().unwrap();
        assert!(parse_dockerignore(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_parse_dockerignore_skips_comments() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(".dockerignore"),
            "# comment\n\ntarget/\n*.log\n",
        )
        .unwrap();
        assert_eq!(
            parse_dockerignore(dir.path()).unwrap(),
            vec!["target/".to_string(), "*.log".to_string()]
        );
    }

    #[test]
    fn test_build_log_counts_steps() {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink: LogSink = buffer.clone();
        let log = BuildLog::to_sink(sink);
        log.record("FROM busybox");
        log.record("RUN echo hi");
        let written = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(written, "STEP 1: FROM busybox\nSTEP 2: RUN echo hi\n");
    }

    #[test]
    fn test_read_dockerfile_directory_and_context_fallback() {
        let context = tempdir().unwrap();
        fs::write(context.path().join("Dockerfile"), "FROM busybox\n").unwrap();
        // A directory resolves to its Dockerfile.
        let (name, body) =
            read_dockerfile(context.path().to_str().unwrap(), context.path()).unwrap();
        assert!(name.ends_with("Dockerfile"));
        assert_eq!(body, "FROM busybox\n");
        // A bare name is retried under the context directory.
        let (_, body) = read_dockerfile("Dockerfile", context.path()).unwrap();
        assert_eq!(body, "FROM busybox\n");
    }

    #[test]
    fn test_read_dockerfile_empty_is_an_error() {
        let context = tempdir().unwrap();
        fs::write(context.path().join("Dockerfile"), "").unwrap();
        let err = read_dockerfile("Dockerfile", context.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::EmptyDockerfile(_))
        ));
    }
}
