//! Dockerfile preprocessing.
//!
//! Two passes run before parsing: `.in` files are piped through the C
//! preprocessor, and `COPY --from=X` references without a matching `FROM`
//! get a synthetic `FROM X` Dockerfile prepended so the reference resolves
//! to a stage. The synthesis is textual on purpose, matching the scan that
//! established this behavior.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::BuildError;

const CPP_PATH: &str = "/usr/bin/cpp";

static COPY_FROM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*COPY\s+--from=").unwrap());
static FROM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*FROM\s+").unwrap());
static AS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+as\s+").unwrap());

/// Run cpp in preprocess-only mode over `.in` Dockerfile contents, with the
/// context directory on the quoted include path.
pub fn preprocess_dockerfile_contents(content: &str, context_dir: &Path) -> Result<String> {
    if !Path::new(CPP_PATH).exists() {
        return Err(BuildError::PreprocessorUnavailable(CPP_PATH.to_string()).into());
    }
    let mut child = Command::new(CPP_PATH)
        .arg("-E")
        .arg("-iquote")
        .arg(context_dir)
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("starting cpp")?;
    child
        .stdin
        .take()
        .context("opening cpp stdin")?
        .write_all(content.as_bytes())
        .context("writing Dockerfile to cpp")?;
    let output = child.wait_with_output().context("waiting for cpp")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "pre-processing Dockerfile: {} ({})",
            output.status,
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Scan each Dockerfile for `COPY --from=X` and prepend a synthetic `FROM X`
/// Dockerfile for every X that is neither a stage number nor declared by a
/// `FROM` line or `AS` alias anywhere in the input.
pub fn process_copy_from(dockerfiles: Vec<String>) -> Vec<String> {
    let mut result = Vec::new();
    // Image names seen on FROM lines, and aliases following "FROM ... AS",
    // across all of the Dockerfiles.
    let mut from_names: HashSet<String> = HashSet::new();
    let mut as_names: HashSet<String> = HashSet::new();

    for dfile in dockerfiles {
        let synthesized = {
            let references: Vec<&str> = COPY_FROM_RE.split(&dfile).collect();
            if references.len() < 2 {
                None
            } else {
                for part in FROM_RE.split(&dfile) {
                    if let Some(token) = first_token(part) {
                        from_names.insert(token.to_string());
                    }
                }
                // The first split entry is everything before the first
                // " as "; it never names an alias.
                for part in AS_RE.split(&dfile).skip(1) {
                    if let Some(token) = first_token(part) {
                        as_names.insert(token.to_string());
                    }
                }
                debug!(?from_names, ?as_names, "cross-stage reference scan");
                let mut synthetic = Vec::new();
                for part in &references[1..] {
                    let Some(target) = first_token(part) else {
                        continue;
                    };
                    if target.parse::<usize>().is_ok() {
                        continue;
                    }
                    if from_names.contains(target) || as_names.contains(target) {
                        continue;
                    }
                    synthetic.push(format!("FROM {target}"));
                }
                Some(synthetic)
            }
        };
        match synthesized {
            None => result.push(dfile),
            Some(synthetic) => {
                result.extend(synthetic);
                result.push(dfile);
            }
        }
    }
    result
}

fn first_token(part: &str) -> Option<&str> {
    part.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::process_copy_from;
    use crate::error::BuildError;

    #[test]
    fn test_no_copy_from_passes_through() {
        let input = vec!["FROM busybox\nRUN echo hi\n".to_string()];
        assert_eq!(process_copy_from(input.clone()), input);
    }

    #[test]
    fn test_dangling_from_is_synthesized() {
        let input = vec!["FROM alpine\nCOPY --from=busybox /bin/sh /sh\n".to_string()];
        let result = process_copy_from(input);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], "FROM busybox");
        assert!(result[1].starts_with("FROM alpine"));
    }

    #[test]
    fn test_declared_alias_is_not_synthesized() {
        let input =
            vec!["FROM busybox AS src\nRUN echo hi\nFROM busybox\nCOPY --from=src /a /a\n"
                .to_string()];
        let result = process_copy_from(input);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_numeric_reference_is_not_synthesized() {
        let input = vec!["FROM a\nFROM b\nCOPY --from=0 /x /x\n".to_string()];
        let result = process_copy_from(input);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_from_image_name_is_not_synthesized() {
        let input = vec!["FROM busybox\nCOPY --from=busybox /bin/sh /sh\n".to_string()];
        let result = process_copy_from(input);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_preprocessor_unavailable_is_typed() {
        // Only meaningful on hosts without cpp; the error shape matters more
        // than the trigger here.
        let err: anyhow::Error = BuildError::PreprocessorUnavailable("/usr/bin/cpp".into()).into();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::PreprocessorUnavailable(_))
        ));
    }
}
