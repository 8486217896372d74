//! Execution of one build stage.
//!
//! A stage owns a working container and walks its instruction list: each
//! instruction is resolved against the stage's build args and environment,
//! checked against the layer cache, dispatched, and committed as a new layer,
//! after which the stage re-bases onto the freshly committed image for the
//! next step.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::builder::{
    AddOptions, Builder, BuilderOptions, CommitOptions, ImageConfig, NetworkPolicy, RunOptions,
};
use crate::cancel::CancelToken;
use crate::error::BuildError;
use crate::image::cache::layer_lookup;
use crate::image::executor::Executor;
use crate::image::step::{
    created_by, parse_healthcheck, requires_start, resolve_step, BuildStage, Command, Step,
};
use crate::image::volume::{host_path, VolumeCache};
use crate::image::{BUILTIN_ALLOWED_BUILD_ARGS, NOPIVOT_ENV};
use crate::store::CanonicalRef;

/// Per-stage state held in the executor's stage arena.
pub(crate) struct Stage {
    /// Position in declaration order.
    pub index: usize,
    pub name: String,
    /// Name applied to the image committed on the final step.
    pub output: String,
    pub builder: Option<Box<dyn Builder>>,
    pub mountpoint: PathBuf,
    pub volume_cache: VolumeCache,
    /// Source root for the current COPY/ADD instruction.
    pub copy_from: PathBuf,
    /// Containers committed during the stage, swept during cleanup.
    pub container_ids: Vec<String>,
    /// The configuration the next commit will record, mutated by metadata
    /// instructions.
    pub config: ImageConfig,
    /// Values of args declared in this stage.
    pub args: BTreeMap<String, String>,
}

impl Stage {
    /// Delete the stage's working container, if it still has one. Idempotent.
    pub fn delete(&mut self) -> Result<()> {
        if let Some(mut builder) = self.builder.take() {
            builder.delete()?;
        }
        Ok(())
    }
}

/// Drives one stage against the executor that owns it.
pub(crate) struct StageExecutor<'a> {
    pub executor: &'a mut Executor,
    pub idx: usize,
}

/// The substitution environment for one step: allow-listed proxy args, then
/// declared stage args, with environment entries taking precedence.
fn step_vars(stage: &Stage, build_args: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for (name, value) in build_args {
        if BUILTIN_ALLOWED_BUILD_ARGS.contains(name.as_str()) {
            vars.insert(name.clone(), value.clone());
        }
    }
    for (name, value) in &stage.args {
        vars.insert(name.clone(), value.clone());
    }
    for entry in &stage.config.env {
        if let Some((name, value)) = entry.split_once('=') {
            vars.insert(name.to_string(), value.to_string());
        }
    }
    vars
}

fn split_key_value(spec: &str) -> (String, String) {
    match spec.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (spec.to_string(), String::new()),
    }
}

impl StageExecutor<'_> {
    fn stage(&self) -> &Stage {
        &self.executor.stages[self.idx]
    }

    fn stage_mut(&mut self) -> &mut Stage {
        &mut self.executor.stages[self.idx]
    }

    /// Create the stage's working container from `from` (or the image a
    /// previous stage committed under that name), snapshot the base
    /// configuration, and mount the root filesystem.
    pub fn prepare(
        &mut self,
        cancel: &CancelToken,
        stage_node: &BuildStage,
        from: &str,
    ) -> Result<()> {
        cancel.check()?;
        let display_from = if stage_node.has_alias() {
            format!("{from} AS {}", stage_node.name)
        } else {
            from.to_string()
        };
        debug!(from = %display_from, "FROM");
        if !self.executor.quiet {
            self.executor.log.record(&format!("FROM {display_from}"));
        }

        let from_image = match self.executor.image_map.get(from) {
            Some(mapped) => mapped.clone(),
            None => from.to_string(),
        };
        let options = BuilderOptions {
            from_image,
            pull_policy: self.executor.pull_policy,
            registry: self.executor.registry.clone(),
            blob_directory: self.executor.blob_directory.clone(),
            signature_policy_path: self.executor.signature_policy_path.clone(),
            report_writer: self.executor.report_writer.clone(),
            isolation: self.executor.isolation,
            namespace_options: self.executor.namespace_options.clone(),
            configure_network: self.executor.configure_network,
            cni_plugin_path: self.executor.cni_plugin_path.clone(),
            cni_config_dir: self.executor.cni_config_dir.clone(),
            id_mapping: self.executor.id_mapping.clone(),
            add_capabilities: self.executor.add_capabilities.clone(),
            drop_capabilities: self.executor.drop_capabilities.clone(),
            default_mounts_file_path: self.executor.default_mounts_file_path.clone(),
            format: self.executor.output_format,
            args: self.executor.build_args.clone(),
        };
        let mut builder = self
            .executor
            .store
            .new_builder(cancel, options)
            .context("creating build container")?;
        let config = builder.config().clone();
        let mountpoint = match builder.mount("") {
            Ok(mountpoint) => mountpoint,
            Err(err) => {
                if let Err(delete_err) = builder.delete() {
                    debug!("deleting container which we failed to mount: {delete_err:#}");
                }
                return Err(err).context("mounting new container");
            }
        };
        let top_layer = builder.top_layer().to_string();
        debug!(
            stage = self.stage().name.as_str(),
            container_id = builder.container_id(),
            "container created"
        );

        let stage = self.stage_mut();
        stage.builder = Some(builder);
        stage.mountpoint = mountpoint;
        stage.config = config;
        self.executor.top_layers.push(top_layer);
        Ok(())
    }

    /// Run each instruction of the stage in turn, committing layers and
    /// consulting the layer cache until the first divergence.
    pub fn execute(
        &mut self,
        cancel: &CancelToken,
        stage_node: &BuildStage,
    ) -> Result<(String, Option<CanonicalRef>)> {
        let children = &stage_node.children;
        let mut check_for_layers = true;
        let mut image_id = String::new();
        let mut canonical: Option<CanonicalRef> = None;

        for (i, node) in children.iter().enumerate() {
            cancel.check()?;
            let step = {
                let stage = self.stage();
                resolve_step(node, &step_vars(stage, &self.executor.build_args))
            };
            debug!(step = ?step.original, "parsed step");
            if !self.executor.quiet {
                self.executor.log.record(&step.original);
            }

            // An ARG declaration consumes the matching caller-supplied value.
            if step.command == Command::Arg {
                for spec in &step.args {
                    let name = spec.split('=').next().unwrap_or_default();
                    self.executor.unused_args.remove(name);
                }
            }

            self.resolve_copy_from(&step)?;

            let no_runs_remaining = if i < children.len() - 1 {
                !requires_start(&children[i + 1..])
            } else {
                false
            };

            // Single-layer build: dispatch and keep going, no per-step commit.
            if !self.executor.layers && self.executor.use_cache {
                self.dispatch(cancel, &step, no_runs_remaining)
                    .with_context(|| format!("building at step {:?}", step.original))?;
                continue;
            }

            // The committed tag always carries the build's output name, even
            // mid-stage; see DESIGN.md.
            let commit_name = self.executor.output.clone();

            let mut cache_id = None;
            if check_for_layers && self.executor.use_cache {
                let stage = self.stage();
                cache_id = layer_lookup(
                    self.executor.store.as_ref(),
                    &self.executor.top_layers,
                    node,
                    &children[..i],
                    &stage.copy_from,
                )
                .context("checking if cached image exists from a previous build")?;
            }
            if let Some(id) = &cache_id {
                self.executor.write_out(&format!("--> Using cache {id}"));
                // A hit on the last step means nothing in this stage changed;
                // tag a copy of the cached image instead of rebuilding it.
                if i == children.len() - 1 {
                    let (cached_id, cached_ref) =
                        self.copy_cached_image(cancel, id, &commit_name)?;
                    image_id = cached_id;
                    canonical = cached_ref;
                    break;
                }
            }

            match cache_id {
                None => {
                    // Diverged from the cache; never consult it again this
                    // stage.
                    check_for_layers = false;
                    self.dispatch(cancel, &step, no_runs_remaining)
                        .with_context(|| format!("building at step {:?}", step.original))?;
                    let (id, reference) = self
                        .commit(cancel, Some(&created_by(node)), &commit_name)
                        .with_context(|| {
                            format!("committing container for step {:?}", step.original)
                        })?;
                    image_id = id;
                    canonical = reference;
                    if i == children.len() - 1 {
                        self.executor.log.record(&format!("COMMIT {commit_name}"));
                    }
                }
                Some(id) => {
                    image_id = id;
                }
            }

            // Re-base the stage onto the image we just produced.
            if i < children.len() - 1 {
                let container_id = self
                    .stage()
                    .builder
                    .as_ref()
                    .context("no build container available")?
                    .container_id()
                    .to_string();
                self.stage_mut().container_ids.push(container_id);
                self.prepare(cancel, stage_node, &image_id)
                    .context("preparing container for next step")?;
            }
        }

        if self.executor.layers {
            self.executor.write_out(&format!("--> {image_id}"));
        }
        Ok((image_id, canonical))
    }

    /// Point `copy_from` at the context directory, or at the mountpoint of
    /// the stage a `--from` flag names.
    fn resolve_copy_from(&mut self, step: &Step) -> Result<()> {
        self.stage_mut().copy_from = self.executor.context_dir.clone();
        if !matches!(step.command, Command::Copy | Command::Add) {
            return Ok(());
        }
        for flag in &step.flags {
            if let Some(from_name) = flag.strip_prefix("--from=") {
                let Some(&other) = self.executor.stage_index.get(from_name) else {
                    return Err(BuildError::UnknownStage {
                        command: step.command.to_string(),
                        name: from_name.to_string(),
                    }
                    .into());
                };
                if self.executor.stages[other].index >= self.stage().index {
                    return Err(BuildError::StageNotBuilt(from_name.to_string()).into());
                }
                let mountpoint = self.executor.stages[other].mountpoint.clone();
                self.stage_mut().copy_from = mountpoint;
                break;
            }
        }
        Ok(())
    }

    /// Apply one instruction to the working container or the stage config.
    fn dispatch(&mut self, cancel: &CancelToken, step: &Step, no_runs_remaining: bool) -> Result<()> {
        match &step.command {
            Command::Run => self.do_run(cancel, step),
            Command::Copy => self.do_copy(step, false),
            Command::Add => self.do_copy(step, true),
            Command::Volume => self.do_volume(step, no_runs_remaining),
            Command::Env => {
                let config = &mut self.stage_mut().config;
                for pair in step.args.chunks(2) {
                    let value = pair.get(1).map(String::as_str).unwrap_or_default();
                    config.set_env(&pair[0], value);
                }
                Ok(())
            }
            Command::Label => {
                let config = &mut self.stage_mut().config;
                for pair in step.args.chunks(2) {
                    let value = pair.get(1).cloned().unwrap_or_default();
                    config.labels.insert(pair[0].clone(), value);
                }
                Ok(())
            }
            Command::User => {
                self.stage_mut().config.user =
                    step.args.first().cloned().unwrap_or_default();
                Ok(())
            }
            Command::Workdir => {
                let dir = step.args.first().cloned().unwrap_or_default();
                let current = &self.stage().config.workdir;
                let resolved = if dir.starts_with('/') || current.is_empty() {
                    dir
                } else {
                    format!("{}/{}", current.trim_end_matches('/'), dir)
                };
                self.ensure_container_path(&resolved)?;
                self.stage_mut().config.workdir = resolved;
                Ok(())
            }
            Command::Cmd => {
                self.stage_mut().config.cmd = shell_or_exec_args(step);
                Ok(())
            }
            Command::Entrypoint => {
                self.stage_mut().config.entrypoint = shell_or_exec_args(step);
                Ok(())
            }
            Command::Expose => {
                let config = &mut self.stage_mut().config;
                for port in &step.args {
                    config.exposed_ports.insert(port.clone());
                }
                Ok(())
            }
            Command::StopSignal => {
                self.stage_mut().config.stop_signal =
                    step.args.first().cloned().unwrap_or_default();
                Ok(())
            }
            Command::Healthcheck => {
                let healthcheck = parse_healthcheck(step)?;
                self.stage_mut().config.healthcheck = healthcheck;
                Ok(())
            }
            Command::Shell => {
                self.stage_mut().config.shell = step.args.clone();
                Ok(())
            }
            Command::Onbuild => {
                let trigger = step.raw_args.trim().to_string();
                self.stage_mut().config.onbuild.push(trigger);
                Ok(())
            }
            Command::Maintainer => {
                self.stage_mut().config.maintainer = step.raw_args.trim().to_string();
                Ok(())
            }
            Command::Arg => {
                let spec = step.args.first().cloned().unwrap_or_default();
                let (name, default) = match spec.split_once('=') {
                    Some((name, default)) => (name.to_string(), Some(default.to_string())),
                    None => (spec, None),
                };
                let value = self.executor.build_args.get(&name).cloned().or(default);
                if let Some(value) = value {
                    self.stage_mut().args.insert(name, value);
                }
                Ok(())
            }
            Command::From => bail!("unexpected FROM instruction inside a stage"),
            Command::Unknown(name) => {
                if self.executor.ignore_unrecognized_instructions {
                    debug!(instruction = name.as_str(), "ignoring unknown instruction");
                    return Ok(());
                }
                error!(instruction = name.as_str(), "unknown instruction");
                Err(BuildError::UnknownInstruction(name.clone()).into())
            }
        }
    }

    /// COPY/ADD: invalidate any volume caches under the destination, then
    /// hand the sources to the builder. `download` marks ADD.
    fn do_copy(&mut self, step: &Step, download: bool) -> Result<()> {
        let Some((dest, srcs)) = step.args.split_last() else {
            bail!("{} requires at least one source and a destination", step.command);
        };
        debug!(command = %step.command, dest = dest.as_str(), ?srcs);
        self.stage_mut().volume_cache.invalidate(dest)?;

        let copy_from = self.stage().copy_from.clone();
        let mut sources = Vec::with_capacity(srcs.len());
        for src in srcs {
            if src.starts_with("http://") || src.starts_with("https://") {
                sources.push(src.clone());
            } else {
                sources.push(copy_from.join(src).to_string_lossy().into_owned());
            }
        }
        let chown = step
            .flags
            .iter()
            .find_map(|flag| flag.strip_prefix("--chown=").map(str::to_string));
        let options = AddOptions {
            chown,
            context_dir: self.executor.context_dir.clone(),
            excludes: self.executor.excludes.clone(),
        };
        let builder = self
            .stage_mut()
            .builder
            .as_mut()
            .context("no build container available")?;
        builder.add(dest, download, options, &sources)
    }

    /// RUN: snapshot preserved volumes, invoke the runtime, restore the
    /// volumes. A restore failure is reported only if the RUN succeeded.
    fn do_run(&mut self, cancel: &CancelToken, step: &Step) -> Result<()> {
        let no_pivot = std::env::var_os(NOPIVOT_ENV).is_some();
        let Executor {
            stages,
            runtime,
            runtime_args,
            transient_mounts,
            namespace_options,
            input,
            out,
            err,
            quiet,
            ..
        } = &mut *self.executor;
        let Stage {
            builder,
            config,
            volume_cache,
            mountpoint,
            ..
        } = &mut stages[self.idx];
        let builder = builder.as_mut().context("no build container available")?;

        let options = RunOptions {
            hostname: config.hostname.clone(),
            runtime: runtime.clone(),
            runtime_args: runtime_args.clone(),
            no_pivot,
            mounts: transient_mounts.clone(),
            env: config.env.clone(),
            user: config.user.clone(),
            workdir: config.workdir.clone(),
            entrypoint: config.entrypoint.clone(),
            cmd: config.cmd.clone(),
            stdin: input.clone(),
            stdout: Some(out.clone()),
            stderr: Some(err.clone()),
            quiet: *quiet,
            configure_network: if config.network_disabled {
                NetworkPolicy::Disabled
            } else {
                NetworkPolicy::Enabled
            },
            namespace_options: namespace_options.clone(),
        };
        let args = if step.exec_form {
            step.args.clone()
        } else {
            let mut shell = vec!["/bin/sh".to_string(), "-c".to_string()];
            shell.extend(step.args.iter().cloned());
            shell
        };

        volume_cache.save(mountpoint)?;
        let run_result = builder.run(cancel, &args, options);
        let restore_result = volume_cache.restore(mountpoint);
        match run_result {
            Err(run_err) => Err(run_err),
            Ok(()) => restore_result,
        }
    }

    /// VOLUME: record the declaration and start preserving the directory,
    /// unless only metadata instructions remain in the stage.
    fn do_volume(&mut self, step: &Step, no_runs_remaining: bool) -> Result<()> {
        let cache_dir = {
            let stage = self.stage();
            let builder = stage
                .builder
                .as_ref()
                .context("no build container available")?;
            self.executor
                .store
                .container_directory(builder.container_id())
                .context("unable to locate temporary directory for container")?
        };
        let stage = self.stage_mut();
        for path in &step.args {
            stage.config.volumes.insert(path.clone());
            if !no_runs_remaining {
                let mountpoint = stage.mountpoint.clone();
                stage.volume_cache.preserve(&mountpoint, &cache_dir, path)?;
            }
        }
        Ok(())
    }

    fn ensure_container_path(&self, path: &str) -> Result<()> {
        let host = host_path(&self.stage().mountpoint, path);
        if !host.exists() {
            fs::create_dir_all(&host)
                .with_context(|| format!("ensuring container path {path:?}"))?;
        }
        Ok(())
    }

    /// Imprint the stage configuration onto the builder and commit the
    /// working container. An empty `output` mints an anonymous id-addressed
    /// reference.
    pub fn commit(
        &mut self,
        cancel: &CancelToken,
        created_by: Option<&str>,
        output: &str,
    ) -> Result<(String, Option<CanonicalRef>)> {
        let image_ref = self.executor.resolve_name_to_image_ref(output)?;
        let parent;
        {
            let Executor {
                stages,
                labels,
                annotations,
                ..
            } = &mut *self.executor;
            let stage = &mut stages[self.idx];
            let stage_config = stage.config.clone();
            let builder = stage
                .builder
                .as_mut()
                .context("no build container available")?;
            parent = builder.from_image_id().to_string();
            if let Some(created_by) = created_by {
                builder.set_created_by(created_by);
            }
            let config = builder.config_mut();
            if !stage_config.maintainer.is_empty() {
                config.maintainer = stage_config.maintainer.clone();
            }
            config.hostname = stage_config.hostname;
            config.domainname = stage_config.domainname;
            config.user = stage_config.user;
            config.exposed_ports = stage_config.exposed_ports;
            config.env = stage_config.env;
            config.cmd = stage_config.cmd;
            config.volumes = stage_config.volumes;
            config.onbuild = stage_config.onbuild;
            config.workdir = stage_config.workdir;
            config.entrypoint = stage_config.entrypoint;
            config.shell = stage_config.shell;
            config.stop_signal = stage_config.stop_signal;
            config.healthcheck = stage_config.healthcheck;
            config.labels = stage_config.labels;
            for spec in labels.iter() {
                let (key, value) = split_key_value(spec);
                config.labels.insert(key, value);
            }
            for spec in annotations.iter() {
                let (key, value) = split_key_value(spec);
                builder.set_annotation(&key, &value);
            }
        }

        let log_name = image_ref.to_string();
        debug!(name = %log_name, "COMMIT");
        if !self.executor.quiet && !self.executor.layers && self.executor.use_cache {
            self.executor.log.record(&format!("COMMIT {log_name}"));
        }
        let report_writer = if self.executor.layers || !self.executor.use_cache {
            None
        } else {
            self.executor.report_writer.clone()
        };
        let options = CommitOptions {
            compression: self.executor.compression,
            signature_policy_path: self.executor.signature_policy_path.clone(),
            additional_tags: self.executor.additional_tags.clone(),
            report_writer,
            preferred_format: self.executor.output_format,
            iid_file: self.executor.iid_file.clone(),
            squash: self.executor.squash,
            blob_directory: self.executor.blob_directory.clone(),
            parent: Some(parent),
        };
        let result = {
            let builder = self
                .stage_mut()
                .builder
                .as_mut()
                .context("no build container available")?;
            builder.commit(cancel, &image_ref, options)?
        };
        if self.executor.iid_file.is_none() && !result.image_id.is_empty() {
            self.executor.write_out(&format!("--> {}", result.image_id));
        }
        let canonical = image_ref.docker_reference().map(|name| CanonicalRef {
            name: name.to_string(),
            digest: result.manifest_digest.clone(),
        });
        Ok((result.image_id, canonical))
    }

    /// Copy a cache-hit image to the output name instead of rebuilding it.
    fn copy_cached_image(
        &mut self,
        cancel: &CancelToken,
        cache_id: &str,
        output: &str,
    ) -> Result<(String, Option<CanonicalRef>)> {
        let dest = self.executor.resolve_name_to_image_ref(output)?;
        let src = self
            .executor
            .store
            .parse_reference(&format!("@{cache_id}"))
            .with_context(|| format!("getting source image reference for {cache_id:?}"))?;
        let manifest = self
            .executor
            .store
            .copy_image(cancel, &dest, &src)
            .with_context(|| format!("copying image {cache_id:?}"))?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&manifest)));
        let image = self
            .executor
            .store
            .lookup_image(&dest)
            .with_context(|| format!("locating new copy of image {cache_id:?}"))?;
        let stage_output = self.stage().output.clone();
        self.executor.log.record(&format!("COMMIT {stage_output}"));
        let canonical = dest.docker_reference().map(|name| CanonicalRef {
            name: name.to_string(),
            digest,
        });
        Ok((image.id, canonical))
    }
}

/// CMD/ENTRYPOINT arguments: exec form passes through, shell form wraps in
/// `/bin/sh -c`.
fn shell_or_exec_args(step: &Step) -> Vec<String> {
    if step.exec_form {
        step.args.clone()
    } else if step.args.is_empty() || step.args.iter().all(|a| a.is_empty()) {
        Vec::new()
    } else {
        let mut args = vec!["/bin/sh".to_string(), "-c".to_string()];
        args.extend(step.args.iter().cloned());
        args
    }
}
