//! In-memory store and builder fakes backed by real temp directories.
//!
//! Working containers are plain directories: `mount` materializes the base
//! image's snapshot, `add` copies files in, `run` applies scripted filesystem
//! effects, and `commit` snapshots the tree back into the store. That keeps
//! volume preservation, cross-stage copies, and the layer cache observable
//! on disk without a container runtime.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use imageforge::builder::{
    AddOptions, Builder, BuilderOptions, CommitOptions, CommitResult, ImageConfig, RunOptions,
};
use imageforge::cancel::CancelToken;
use imageforge::error::BuildError;
use imageforge::store::{HistoryEntry, ImageRecord, ImageRef, LayerRecord, Store};

/// A filesystem effect a scripted RUN applies to the working tree.
#[derive(Clone, Debug)]
pub enum RunEffect {
    WriteFile { path: String, contents: String },
}

#[derive(Clone, Debug)]
pub struct StoredImage {
    pub id: String,
    pub top_layer: String,
    pub parent: String,
    pub config: ImageConfig,
    pub history: Vec<HistoryEntry>,
    pub rootfs: PathBuf,
}

#[derive(Default)]
pub struct StoreState {
    pub images: HashMap<String, StoredImage>,
    /// Layer id to parent layer id; base layers have an empty parent.
    pub layers: HashMap<String, String>,
    /// Container id to scratch directory.
    pub containers: HashMap<String, PathBuf>,
    /// Container id to the image id it was created from.
    pub container_images: HashMap<String, String>,
    /// Tag to image id.
    pub names: HashMap<String, String>,
    /// Shell command to the effects its RUN applies.
    pub run_effects: HashMap<String, Vec<RunEffect>>,
    /// Every RUN invocation, as the full argv joined with spaces.
    pub runs: Vec<String>,
    /// Every add invocation, as "sources -> dest".
    pub adds: Vec<String>,
    pub commits: usize,
    next: usize,
}

impl StoreState {
    fn fresh(&mut self, prefix: &str) -> String {
        self.next += 1;
        format!("{prefix}{:04}", self.next)
    }
}

struct Inner {
    root: TempDir,
    state: Mutex<StoreState>,
}

pub struct FakeStore {
    inner: Arc<Inner>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                root: TempDir::new().expect("store tempdir"),
                state: Mutex::new(StoreState::default()),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().expect("store lock")
    }

    pub fn add_base_image(&self, name: &str) -> String {
        self.add_base_image_with_files(name, &[])
    }

    /// Seed a pullable base image whose root filesystem holds `files`.
    pub fn add_base_image_with_files(&self, name: &str, files: &[(&str, &str)]) -> String {
        let mut state = self.lock();
        let id = state.fresh("img");
        let layer = state.fresh("layer");
        let rootfs = self.inner.root.path().join("images").join(&id);
        fs::create_dir_all(&rootfs).expect("image rootfs");
        for (path, contents) in files {
            let file = rootfs.join(path);
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent).expect("image file parent");
            }
            fs::write(&file, contents).expect("image file");
        }
        state.layers.insert(layer.clone(), String::new());
        state.images.insert(
            id.clone(),
            StoredImage {
                id: id.clone(),
                top_layer: layer,
                parent: String::new(),
                config: ImageConfig::default(),
                history: Vec::new(),
                rootfs,
            },
        );
        state.names.insert(name.to_string(), id.clone());
        id
    }

    /// Script the filesystem effects of one RUN shell command.
    pub fn on_run(&self, command: &str, effects: Vec<RunEffect>) {
        self.lock().run_effects.insert(command.to_string(), effects);
    }

    pub fn runs(&self) -> Vec<String> {
        self.lock().runs.clone()
    }

    pub fn adds(&self) -> Vec<String> {
        self.lock().adds.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn image_count(&self) -> usize {
        self.lock().images.len()
    }

    pub fn image_id_for(&self, name: &str) -> Option<String> {
        self.lock().names.get(name).cloned()
    }

    pub fn image_rootfs(&self, id: &str) -> Option<PathBuf> {
        self.lock().images.get(id).map(|image| image.rootfs.clone())
    }

    pub fn image_config(&self, id: &str) -> Option<ImageConfig> {
        self.lock().images.get(id).map(|image| image.config.clone())
    }
}

impl Store for FakeStore {
    fn images(&self) -> Result<Vec<ImageRecord>> {
        let state = self.lock();
        let mut records: Vec<ImageRecord> = state
            .images
            .values()
            .map(|image| ImageRecord {
                id: image.id.clone(),
                top_layer: image.top_layer.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn layer(&self, layer_id: &str) -> Result<LayerRecord> {
        let state = self.lock();
        let parent = state
            .layers
            .get(layer_id)
            .with_context(|| format!("layer {layer_id:?} not found"))?;
        Ok(LayerRecord {
            id: layer_id.to_string(),
            parent: parent.clone(),
        })
    }

    fn container_directory(&self, container_id: &str) -> Result<PathBuf> {
        let state = self.lock();
        state
            .containers
            .get(container_id)
            .cloned()
            .with_context(|| format!("container {container_id:?} not found"))
    }

    fn delete_image(&self, image_id: &str, _force: bool) -> Result<()> {
        let mut state = self.lock();
        if !state.images.contains_key(image_id) {
            bail!("image {image_id:?} not found");
        }
        if state.container_images.values().any(|id| id == image_id) {
            return Err(BuildError::ImageInUse(image_id.to_string()).into());
        }
        state.images.remove(image_id);
        state.names.retain(|_, id| id != image_id);
        Ok(())
    }

    fn delete_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.lock();
        let scratch = state
            .containers
            .remove(container_id)
            .with_context(|| format!("container {container_id:?} not found"))?;
        state.container_images.remove(container_id);
        drop(state);
        let _ = fs::remove_dir_all(scratch);
        Ok(())
    }

    fn image_history(&self, image_id: &str) -> Result<Vec<HistoryEntry>> {
        let state = self.lock();
        let image = state
            .images
            .get(image_id)
            .with_context(|| format!("image {image_id:?} not found"))?;
        Ok(image.history.clone())
    }

    fn parse_reference(&self, name: &str) -> Result<ImageRef> {
        if name.is_empty() {
            bail!("empty image reference");
        }
        match name.strip_prefix('@') {
            Some(id) => Ok(ImageRef {
                name: String::new(),
                id: id.to_string(),
            }),
            None => Ok(ImageRef {
                name: name.to_string(),
                id: String::new(),
            }),
        }
    }

    fn lookup_image(&self, image_ref: &ImageRef) -> Result<ImageRecord> {
        let state = self.lock();
        let id = if !image_ref.id.is_empty() {
            image_ref.id.clone()
        } else {
            state
                .names
                .get(&image_ref.name)
                .cloned()
                .with_context(|| format!("image {:?} not found", image_ref.name))?
        };
        let image = state
            .images
            .get(&id)
            .with_context(|| format!("image {id:?} not found"))?;
        Ok(ImageRecord {
            id: image.id.clone(),
            top_layer: image.top_layer.clone(),
        })
    }

    fn copy_image(
        &self,
        cancel: &CancelToken,
        dest: &ImageRef,
        src: &ImageRef,
    ) -> Result<Vec<u8>> {
        cancel.check()?;
        let mut state = self.lock();
        let src_id = if !src.id.is_empty() {
            src.id.clone()
        } else {
            state
                .names
                .get(&src.name)
                .cloned()
                .with_context(|| format!("image {:?} not found", src.name))?
        };
        if !state.images.contains_key(&src_id) {
            bail!("image {src_id:?} not found");
        }
        if let Some(name) = dest.docker_reference() {
            state.names.insert(name.to_string(), src_id.clone());
        }
        Ok(serde_json::to_vec(&serde_json::json!({ "copied": src_id }))?)
    }

    fn new_builder(
        &self,
        cancel: &CancelToken,
        options: BuilderOptions,
    ) -> Result<Box<dyn Builder>> {
        cancel.check()?;
        let mut state = self.lock();
        let resolved = state
            .images
            .get(&options.from_image)
            .cloned()
            .or_else(|| {
                let id = state.names.get(&options.from_image)?;
                state.images.get(id).cloned()
            });
        let image = match resolved {
            Some(image) => image,
            None => {
                // Simulate a pull: materialize an empty base image.
                let id = state.fresh("img");
                let layer = state.fresh("layer");
                let rootfs = self.inner.root.path().join("images").join(&id);
                fs::create_dir_all(&rootfs)?;
                state.layers.insert(layer.clone(), String::new());
                let image = StoredImage {
                    id: id.clone(),
                    top_layer: layer,
                    parent: String::new(),
                    config: ImageConfig::default(),
                    history: Vec::new(),
                    rootfs,
                };
                state.images.insert(id.clone(), image.clone());
                state.names.insert(options.from_image.clone(), id);
                image
            }
        };
        let container_id = state.fresh("ctr");
        let scratch = self.inner.root.path().join("containers").join(&container_id);
        fs::create_dir_all(&scratch)?;
        state.containers.insert(container_id.clone(), scratch);
        state
            .container_images
            .insert(container_id.clone(), image.id.clone());
        Ok(Box::new(FakeBuilder {
            inner: self.inner.clone(),
            container_id,
            from_image: options.from_image,
            from_image_id: image.id,
            top_layer: image.top_layer,
            config: image.config,
            created_by: String::new(),
            annotations: HashMap::new(),
            mountpoint: PathBuf::new(),
            deleted: false,
        }))
    }
}

pub struct FakeBuilder {
    inner: Arc<Inner>,
    container_id: String,
    from_image: String,
    from_image_id: String,
    top_layer: String,
    config: ImageConfig,
    created_by: String,
    annotations: HashMap<String, String>,
    mountpoint: PathBuf,
    deleted: bool,
}

impl Builder for FakeBuilder {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn from_image(&self) -> &str {
        &self.from_image
    }

    fn from_image_id(&self) -> &str {
        &self.from_image_id
    }

    fn top_layer(&self) -> &str {
        &self.top_layer
    }

    fn config(&self) -> &ImageConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut ImageConfig {
        &mut self.config
    }

    fn set_created_by(&mut self, created_by: &str) {
        self.created_by = created_by.to_string();
    }

    fn set_annotation(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
    }

    fn mount(&mut self, _label: &str) -> Result<PathBuf> {
        let mountpoint = self
            .inner
            .root
            .path()
            .join("mounts")
            .join(&self.container_id);
        if !mountpoint.exists() {
            fs::create_dir_all(&mountpoint)?;
            let rootfs = {
                let state = self.inner.state.lock().expect("store lock");
                state
                    .images
                    .get(&self.from_image_id)
                    .map(|image| image.rootfs.clone())
                    .with_context(|| format!("image {:?} not found", self.from_image_id))?
            };
            copy_dir_recursive(&rootfs, &mountpoint)?;
        }
        self.mountpoint = mountpoint.clone();
        Ok(mountpoint)
    }

    fn add(
        &mut self,
        dest: &str,
        _download: bool,
        _options: AddOptions,
        sources: &[String],
    ) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("store lock");
            state.adds.push(format!("{} -> {dest}", sources.join(" ")));
        }
        let dest_is_dir = dest.ends_with('/');
        let target = self.mountpoint.join(dest.trim_start_matches('/'));
        for source in sources {
            if source.starts_with("http://") || source.starts_with("https://") {
                bail!("fake builder cannot download {source:?}");
            }
            let mut matched = false;
            for entry in glob::glob(source)? {
                let path = entry?;
                matched = true;
                if path.is_dir() {
                    copy_dir_recursive(&path, &target)?;
                } else if dest_is_dir || target.is_dir() {
                    fs::create_dir_all(&target)?;
                    let file_name = path.file_name().context("source has no file name")?;
                    fs::copy(&path, target.join(file_name))?;
                } else {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(&path, &target)?;
                }
            }
            if !matched {
                bail!("source {source:?} not found");
            }
        }
        Ok(())
    }

    fn run(&mut self, cancel: &CancelToken, args: &[String], _options: RunOptions) -> Result<()> {
        cancel.check()?;
        let effects = {
            let mut state = self.inner.state.lock().expect("store lock");
            state.runs.push(args.join(" "));
            args.last()
                .and_then(|command| state.run_effects.get(command.as_str()).cloned())
        };
        if let Some(effects) = effects {
            for effect in effects {
                match effect {
                    RunEffect::WriteFile { path, contents } => {
                        let target = self.mountpoint.join(path.trim_start_matches('/'));
                        if let Some(parent) = target.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(target, contents)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        cancel: &CancelToken,
        image_ref: &ImageRef,
        options: CommitOptions,
    ) -> Result<CommitResult> {
        cancel.check()?;
        let mut state = self.inner.state.lock().expect("store lock");
        let id = state.fresh("img");
        let layer = state.fresh("layer");
        state.layers.insert(layer.clone(), self.top_layer.clone());
        let rootfs = self.inner.root.path().join("images").join(&id);
        copy_dir_recursive(&self.mountpoint, &rootfs)?;
        let mut history = state
            .images
            .get(&self.from_image_id)
            .map(|image| image.history.clone())
            .unwrap_or_default();
        history.push(HistoryEntry {
            created: Some(Utc::now()),
            created_by: self.created_by.clone(),
        });
        state.images.insert(
            id.clone(),
            StoredImage {
                id: id.clone(),
                top_layer: layer,
                parent: options.parent.clone().unwrap_or_default(),
                config: self.config.clone(),
                history,
                rootfs,
            },
        );
        if let Some(name) = image_ref.docker_reference() {
            state.names.insert(name.to_string(), id.clone());
        }
        state.commits += 1;
        if let Some(iid_file) = &options.iid_file {
            fs::write(iid_file, &id)?;
        }
        self.created_by.clear();
        let manifest_digest = format!("sha256:{}", hex::encode(Sha256::digest(id.as_bytes())));
        Ok(CommitResult {
            image_id: id,
            manifest_digest,
        })
    }

    fn delete(&mut self) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        self.deleted = true;
        let scratch = {
            let mut state = self.inner.state.lock().expect("store lock");
            state.container_images.remove(&self.container_id);
            state.containers.remove(&self.container_id)
        };
        if let Some(scratch) = scratch {
            let _ = fs::remove_dir_all(scratch);
        }
        let _ = fs::remove_dir_all(&self.mountpoint);
        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .with_context(|| format!("creating directory {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copying {}", src_path.display()))?;
        }
    }
    Ok(())
}
