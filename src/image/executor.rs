//! The build orchestrator.
//!
//! Drives one or more stages in declaration order, threads committed image
//! ids between them for `FROM <alias>` and `COPY --from`, and tears down
//! working containers and intermediate images on every exit path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, error};

use crate::builder::{
    Compression, IdMappingOptions, ImageConfig, InputStream, Isolation, LogSink, Mount,
    NamespaceOption, NetworkPolicy, OutputFormat, PullPolicy,
};
use crate::cancel::CancelToken;
use crate::error::BuildError;
use crate::image::stage_executor::{Stage, StageExecutor};
use crate::image::step::BuildStage;
use crate::image::volume::VolumeCache;
use crate::image::{
    parse_dockerignore, stderr_sink, stdout_sink, BuildLog, BuildOptions,
    BUILTIN_ALLOWED_BUILD_ARGS,
};
use crate::store::{CanonicalRef, ImageRef, Store};

/// Coordinates an entire build, using one stage executor per stage.
pub struct Executor {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) context_dir: PathBuf,
    pub(crate) excludes: Vec<String>,
    pub(crate) pull_policy: PullPolicy,
    pub(crate) registry: String,
    pub(crate) ignore_unrecognized_instructions: bool,
    pub(crate) quiet: bool,
    pub(crate) isolation: Isolation,
    pub(crate) runtime: String,
    pub(crate) runtime_args: Vec<String>,
    pub(crate) transient_mounts: Vec<Mount>,
    pub(crate) compression: Compression,
    pub(crate) build_args: BTreeMap<String, String>,
    pub(crate) output: String,
    pub(crate) output_format: OutputFormat,
    pub(crate) additional_tags: Vec<String>,
    pub(crate) log: BuildLog,
    pub(crate) input: Option<InputStream>,
    pub(crate) out: LogSink,
    pub(crate) err: LogSink,
    pub(crate) signature_policy_path: Option<PathBuf>,
    pub(crate) report_writer: Option<LogSink>,
    pub(crate) namespace_options: Vec<NamespaceOption>,
    pub(crate) configure_network: NetworkPolicy,
    pub(crate) cni_plugin_path: Option<PathBuf>,
    pub(crate) cni_config_dir: Option<PathBuf>,
    pub(crate) id_mapping: Option<IdMappingOptions>,
    pub(crate) add_capabilities: Vec<String>,
    pub(crate) drop_capabilities: Vec<String>,
    pub(crate) default_mounts_file_path: Option<PathBuf>,
    pub(crate) iid_file: Option<PathBuf>,
    pub(crate) squash: bool,
    pub(crate) labels: Vec<String>,
    pub(crate) annotations: Vec<String>,
    pub(crate) layers: bool,
    pub(crate) use_cache: bool,
    pub(crate) remove_intermediate_ctrs: bool,
    pub(crate) force_rm_intermediate_ctrs: bool,
    pub(crate) blob_directory: Option<PathBuf>,
    /// Arena of started stages; the index map holds positions into it.
    pub(crate) stages: Vec<Stage>,
    /// Each stage is reachable by its name, its base image, and its decimal
    /// position; all three resolve to the same arena slot.
    pub(crate) stage_index: HashMap<String, usize>,
    /// Top layer of every image committed so far, across all stages. The
    /// layer cache requires candidates to sit on the last entry.
    pub(crate) top_layers: Vec<String>,
    /// Image ids committed for named stages, keyed by their `AS` alias.
    pub(crate) image_map: HashMap<String, String>,
    pub(crate) unused_args: BTreeSet<String>,
}

impl Executor {
    pub fn new(store: Arc<dyn Store>, options: BuildOptions) -> Result<Self> {
        let excludes = parse_dockerignore(&options.context_directory)?;
        let mut unused_args = BTreeSet::new();
        for name in options.args.keys() {
            if !BUILTIN_ALLOWED_BUILD_ARGS.contains(name.as_str()) {
                unused_args.insert(name.clone());
            }
        }
        let out = options.out.unwrap_or_else(stdout_sink);
        let err = options.err.unwrap_or_else(stderr_sink);
        let log = options
            .log
            .unwrap_or_else(|| BuildLog::to_sink(err.clone()));
        Ok(Self {
            store,
            context_dir: options.context_directory,
            excludes,
            pull_policy: options.pull_policy,
            registry: options.registry,
            ignore_unrecognized_instructions: options.ignore_unrecognized_instructions,
            quiet: options.quiet,
            isolation: options.isolation,
            runtime: options.runtime,
            runtime_args: options.runtime_args,
            transient_mounts: options.transient_mounts,
            compression: options.compression,
            build_args: options.args,
            output: options.output,
            output_format: options.output_format,
            additional_tags: options.additional_tags,
            log,
            input: options.input,
            out,
            err,
            signature_policy_path: options.signature_policy_path,
            report_writer: options.report_writer,
            namespace_options: options.namespace_options,
            configure_network: options.configure_network,
            cni_plugin_path: options.cni_plugin_path,
            cni_config_dir: options.cni_config_dir,
            id_mapping: options.id_mapping,
            add_capabilities: options.add_capabilities,
            drop_capabilities: options.drop_capabilities,
            default_mounts_file_path: options.default_mounts_file_path,
            iid_file: options.iid_file,
            squash: options.squash,
            labels: options.labels,
            annotations: options.annotations,
            layers: options.layers,
            use_cache: !options.no_cache,
            remove_intermediate_ctrs: options.remove_intermediate_ctrs,
            force_rm_intermediate_ctrs: options.force_rm_intermediate_ctrs,
            blob_directory: options.blob_directory,
            stages: Vec::new(),
            stage_index: HashMap::new(),
            top_layers: Vec::new(),
            image_map: HashMap::new(),
            unused_args,
        })
    }

    /// Mark a caller-supplied build arg as consumed by an `ARG` declaration.
    pub(crate) fn mark_arg_used(&mut self, name: &str) {
        self.unused_args.remove(name);
    }

    /// Register a stage in the arena, indexed under its name, its base
    /// image, and its decimal position.
    fn start_stage(&mut self, name: &str, position: usize, from: &str, output: &str) -> usize {
        let arena = self.stages.len();
        self.stages.push(Stage {
            index: position,
            name: name.to_string(),
            output: output.to_string(),
            builder: None,
            mountpoint: PathBuf::new(),
            volume_cache: VolumeCache::default(),
            copy_from: self.context_dir.clone(),
            container_ids: Vec::new(),
            config: ImageConfig::default(),
            args: BTreeMap::new(),
        });
        self.stage_index.insert(name.to_string(), arena);
        self.stage_index.insert(from.to_string(), arena);
        let position_key = position.to_string();
        if position_key != name {
            self.stage_index.insert(position_key, arena);
        }
        arena
    }

    /// Resolve an output name to a store reference; an empty name mints an
    /// anonymous id-addressed reference.
    pub(crate) fn resolve_name_to_image_ref(&self, output: &str) -> Result<ImageRef> {
        if !output.is_empty() {
            return self
                .store
                .parse_reference(output)
                .with_context(|| format!("parsing target image name {output:?}"));
        }
        self.store
            .parse_reference(&format!("@{}", random_image_id()))
            .context("parsing reference for image to be written")
    }

    pub(crate) fn write_out(&self, line: &str) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{line}");
        }
    }

    pub(crate) fn write_err(&self, line: &str) {
        if let Ok(mut err) = self.err.lock() {
            let _ = writeln!(err, "{line}");
        }
    }

    /// Run every stage in order and return the final image id and canonical
    /// reference. Cleanup runs on success, failure, and cancellation alike;
    /// a cleanup failure never masks a build failure.
    pub fn build(
        &mut self,
        cancel: &CancelToken,
        stage_nodes: &[BuildStage],
    ) -> Result<(String, Option<CanonicalRef>)> {
        if stage_nodes.is_empty() {
            return Err(BuildError::NoStages.into());
        }
        let mut cleanup_stages = BTreeSet::new();
        let mut cleanup_images = Vec::new();
        let result = self.build_stages(cancel, stage_nodes, &mut cleanup_stages, &mut cleanup_images);
        let cleanup_result = self.cleanup(&mut cleanup_stages, &mut cleanup_images);
        match result {
            Ok(built) => {
                cleanup_result?;
                Ok(built)
            }
            Err(err) => {
                if let Err(cleanup_err) = cleanup_result {
                    debug!("cleanup after failed build: {cleanup_err:#}");
                }
                Err(err)
            }
        }
    }

    fn build_stages(
        &mut self,
        cancel: &CancelToken,
        stage_nodes: &[BuildStage],
        cleanup_stages: &mut BTreeSet<usize>,
        cleanup_images: &mut Vec<String>,
    ) -> Result<(String, Option<CanonicalRef>)> {
        let total = stage_nodes.len();
        let mut image_id = String::new();
        let mut canonical: Option<CanonicalRef> = None;
        let mut last_arena = 0;

        for (at, stage_node) in stage_nodes.iter().enumerate() {
            cancel.check()?;
            // Only the last stage's image receives the requested output name.
            let output = if at == total - 1 {
                self.output.clone()
            } else {
                String::new()
            };
            let arena = self.start_stage(&stage_node.name, stage_node.position, &stage_node.from, &output);
            last_arena = arena;
            StageExecutor { executor: &mut *self, idx: arena }.prepare(cancel, stage_node, &stage_node.from)?;
            if self.force_rm_intermediate_ctrs || !self.layers {
                cleanup_stages.insert(arena);
            }
            let (built_id, built_ref) =
                StageExecutor { executor: &mut *self, idx: arena }.execute(cancel, stage_node)?;
            image_id = built_id;
            canonical = built_ref;
            if !self.force_rm_intermediate_ctrs && self.remove_intermediate_ctrs {
                cleanup_stages.insert(arena);
            }
            // Named intermediate stages get a metadata commit so later
            // stages can refer to them; the image is queued for deletion.
            if at < total - 1 && stage_node.has_alias() {
                let (named_id, named_ref) =
                    StageExecutor { executor: &mut *self, idx: arena }.commit(cancel, None, &output)?;
                image_id = named_id.clone();
                canonical = named_ref;
                self.image_map.insert(stage_node.name.clone(), named_id.clone());
                cleanup_images.push(named_id);
            }
        }

        if !self.unused_args.is_empty() {
            let unused: Vec<&str> = self.unused_args.iter().map(String::as_str).collect();
            self.write_err(&format!(
                "[Warning] one or more build args were not consumed: [{}]",
                unused.join(" ")
            ));
        }

        // A FROM-only Dockerfile has no steps to commit, and single-layer
        // builds defer their one commit until after the stage loop.
        let single_line = total < 2 && stage_nodes[0].children.is_empty();
        let ignore_layers = single_line || (!self.layers && self.use_cache);
        if ignore_layers {
            let output = self.output.clone();
            let (final_id, final_ref) =
                StageExecutor { executor: &mut *self, idx: last_arena }.commit(cancel, None, &output)?;
            image_id = final_id;
            canonical = final_ref;
            if single_line {
                let reference = canonical
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| image_id.clone());
                self.log.record(&format!("COMMIT {reference}"));
            }
        }

        Ok((image_id, canonical))
    }

    /// Tear down stage containers, swept intermediate containers, and queued
    /// intermediate images. Errors are logged as they happen; the last one
    /// is returned.
    fn cleanup(
        &mut self,
        cleanup_stages: &mut BTreeSet<usize>,
        cleanup_images: &mut Vec<String>,
    ) -> Result<()> {
        let mut last_error: Option<anyhow::Error> = None;
        for arena in std::mem::take(cleanup_stages) {
            if let Err(err) = self.stages[arena].delete() {
                debug!("failed to cleanup stage containers: {err:#}");
                last_error = Some(err);
            }
        }
        if self.remove_intermediate_ctrs {
            if let Err(err) = self.delete_successful_intermediate_ctrs() {
                debug!("failed to cleanup intermediate containers: {err:#}");
                last_error = Some(err);
            }
        }
        // Deletion order is the reverse of creation; an image still backing
        // a container is tolerated unless a forced sweep was requested.
        for image_id in std::mem::take(cleanup_images).iter().rev() {
            if let Err(err) = self.store.delete_image(image_id, true) {
                debug!("failed to remove intermediate image {image_id:?}: {err:#}");
                if self.force_rm_intermediate_ctrs || !is_image_in_use(&err) {
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delete the containers recorded by each stage while committing steps.
    /// Lists are drained as they are processed so a stage reachable under
    /// several keys is only swept once.
    fn delete_successful_intermediate_ctrs(&mut self) -> Result<()> {
        let Executor { stages, store, .. } = self;
        let mut last_error: Option<anyhow::Error> = None;
        for stage in stages.iter_mut() {
            for container_id in std::mem::take(&mut stage.container_ids) {
                if let Err(err) = store.delete_container(&container_id) {
                    error!("error deleting build container {container_id:?}: {err:#}");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn is_image_in_use(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::ImageInUse(_))
    )
}

/// A fresh 64-hex-digit image id for anonymous references.
fn random_image_id() -> String {
    let mut rng = rand::rng();
    (0..64)
        .map(|_| char::from_digit(rng.random_range(0..16u32), 16).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::random_image_id;

    #[test]
    fn test_random_image_id_shape() {
        let id = random_image_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_image_id());
    }
}
