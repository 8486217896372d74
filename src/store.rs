//! The image store surface the engine builds against.
//!
//! The engine never touches layer blobs or manifests directly; everything it
//! needs from a content-addressed store is expressed here. A production
//! backend wraps real container storage, the test suite supplies an
//! in-memory one.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::builder::{Builder, BuilderOptions};
use crate::cancel::CancelToken;

/// One image known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub top_layer: String,
}

/// One layer in the store's parent-chained layer graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    pub id: String,
    /// Empty for base layers.
    pub parent: String,
}

/// One entry of an image's OCI history, the cache's content-addressing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub created: Option<DateTime<Utc>>,
    pub created_by: String,
}

/// A parsed reference to an image in the store.
///
/// Either name-addressed (`name` set, possibly with a tag) or id-addressed
/// (`id` set, produced from an `@<id>` spelling).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub id: String,
}

impl ImageRef {
    /// The docker-style name of this reference, if it has one. Id-addressed
    /// references are anonymous and yield `None`.
    pub fn docker_reference(&self) -> Option<&str> {
        if self.name.is_empty() {
            None
        } else {
            Some(&self.name)
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "@{}", self.id)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// A name pinned to a manifest digest, as returned for committed images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRef {
    pub name: String,
    pub digest: String,
}

impl std::fmt::Display for CanonicalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.digest)
    }
}

/// Content-addressed access to images, layers, and container scratch space.
///
/// Store failures are fatal for the current stage; the engine does not retry.
/// `delete_image` reports a still-referenced image by embedding
/// [`crate::error::BuildError::ImageInUse`] in the returned error so the
/// orchestrator can decide whether to swallow it.
pub trait Store: Send + Sync {
    /// Every image currently in the store.
    fn images(&self) -> Result<Vec<ImageRecord>>;

    /// Look up one layer by id.
    fn layer(&self, layer_id: &str) -> Result<LayerRecord>;

    /// The scratch directory owned by a container. Volume snapshots are kept
    /// here so they are reclaimed with the container.
    fn container_directory(&self, container_id: &str) -> Result<PathBuf>;

    fn delete_image(&self, image_id: &str, force: bool) -> Result<()>;

    fn delete_container(&self, container_id: &str) -> Result<()>;

    /// The OCI history of an image, oldest entry first.
    fn image_history(&self, image_id: &str) -> Result<Vec<HistoryEntry>>;

    /// Parse a name or `@<id>` spelling into a store reference.
    fn parse_reference(&self, name: &str) -> Result<ImageRef>;

    /// Resolve a reference back to the image record it points at.
    fn lookup_image(&self, image_ref: &ImageRef) -> Result<ImageRecord>;

    /// Copy an image within the store (or across transports), returning the
    /// manifest bytes of the destination image.
    fn copy_image(&self, cancel: &CancelToken, dest: &ImageRef, src: &ImageRef)
        -> Result<Vec<u8>>;

    /// Create a working container from a base image, pulling it first if the
    /// pull policy requires. The returned builder owns the container.
    fn new_builder(&self, cancel: &CancelToken, options: BuilderOptions)
        -> Result<Box<dyn Builder>>;
}
