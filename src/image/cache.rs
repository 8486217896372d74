//! Layer cache resolution against prior builds.
//!
//! A candidate image is reusable for the current instruction when it sits
//! directly on top of the current base (its top layer's parent is the last
//! committed layer), its history matches the instructions processed so far,
//! and none of the files a COPY/ADD would pull in changed since the candidate
//! was committed.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;
use walkdir::WalkDir;

use crate::image::step::{strip_command_word, Command, Node};
use crate::store::{HistoryEntry, Store};

/// Find a cached image for `node`, given the instructions already processed
/// in this stage and the source root for COPY/ADD freshness checks. Returns
/// the first matching image id.
pub fn layer_lookup(
    store: &dyn Store,
    top_layers: &[String],
    node: &Node,
    prefix: &[Node],
    copy_from: &Path,
) -> Result<Option<String>> {
    let Some(required_parent) = top_layers.last() else {
        return Ok(None);
    };
    for image in store.images().context("getting image list from store")? {
        let layer = store
            .layer(&image.top_layer)
            .context("getting top layer info")?;
        if layer.parent != *required_parent {
            continue;
        }
        let history = store
            .image_history(&image.id)
            .with_context(|| format!("getting history of {:?}", image.id))?;
        if !history_matches(prefix, node, &history) {
            continue;
        }
        let history_time = history.last().and_then(|entry| entry.created);
        if copied_files_match(node, copy_from, history_time.as_ref())
            .context("checking if copied files match")?
        {
            return Ok(Some(image.id));
        }
    }
    Ok(None)
}

/// Whether `history` ends with entries recording `prefix` followed by `node`.
/// Matching is substring-based from the tail; RUN entries record only the
/// command, so the leading RUN token is stripped before comparing.
pub fn history_matches(prefix: &[Node], node: &Node, history: &[HistoryEntry]) -> bool {
    if history.len() < prefix.len() + 1 {
        return false;
    }
    let mut at = history.len();
    for child in std::iter::once(node).chain(prefix.iter().rev()) {
        at -= 1;
        let instruction = if child.command == Command::Run {
            strip_command_word(&child.original)
        } else {
            child.original.as_str()
        };
        if !history[at].created_by.contains(instruction) {
            return false;
        }
    }
    true
}

/// For COPY/ADD, whether every referenced source is unchanged since the
/// candidate image was committed. Non-copy instructions trivially match.
pub fn copied_files_match(
    node: &Node,
    copy_from: &Path,
    history_time: Option<&DateTime<Utc>>,
) -> Result<bool> {
    if node.command != Command::Copy && node.command != Command::Add {
        return Ok(true);
    }
    let Some(history_time) = history_time else {
        return Ok(false);
    };
    for item in files_to_copy(node, copy_from)? {
        if item.starts_with("http://") || item.starts_with("https://") {
            if url_content_modified(&item, history_time)? {
                return Ok(false);
            }
            continue;
        }
        if tree_modified_since(Path::new(&item), history_time)
            .with_context(|| format!("comparing modified times: {item:?}"))?
        {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Expand the instruction's sources against the copy root. URLs pass through
/// unexpanded; local patterns glob against `copy_from`.
fn files_to_copy(node: &Node, copy_from: &Path) -> Result<Vec<String>> {
    let mut sources = Vec::new();
    let Some((_dest, srcs)) = node.args.split_last() else {
        return Ok(sources);
    };
    for src in srcs {
        if src.starts_with("http://") || src.starts_with("https://") {
            sources.push(src.clone());
            continue;
        }
        let pattern = copy_from.join(src).to_string_lossy().into_owned();
        let matches =
            glob::glob(&pattern).with_context(|| format!("finding match for pattern {src:?}"))?;
        for entry in matches {
            let path = entry.with_context(|| format!("finding match for pattern {src:?}"))?;
            sources.push(path.to_string_lossy().into_owned());
        }
    }
    Ok(sources)
}

/// Whether any file under `root` has a modification time strictly after
/// `history_time`. Comparison happens at nanosecond resolution.
fn tree_modified_since(root: &Path, history_time: &DateTime<Utc>) -> Result<bool> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let metadata = entry
            .metadata()
            .with_context(|| format!("reading info about {}", entry.path().display()))?;
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if DateTime::<Utc>::from(modified) > *history_time {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Probe a URL's `Last-Modified` header. A missing header counts as modified.
fn url_content_modified(url: &str, history_time: &DateTime<Utc>) -> Result<bool> {
    let response = reqwest::blocking::get(url).with_context(|| format!("getting {url:?}"))?;
    match response.headers().get(reqwest::header::LAST_MODIFIED) {
        Some(value) => {
            let text = value
                .to_str()
                .with_context(|| format!("reading Last-Modified for {url:?}"))?;
            let last_modified = DateTime::parse_from_rfc2822(text)
                .with_context(|| format!("parsing time for {url:?}"))?;
            Ok(last_modified.with_timezone(&Utc) > *history_time)
        }
        None => {
            debug!(url, "response header did not have Last-Modified, will rebuild");
            Ok(true)
        }
    }
}
