//! Error cases callers need to tell apart.
//!
//! The engine itself reports failures through `anyhow` with context strings;
//! this enum covers the conditions the orchestrator and callers must be able
//! to match on programmatically. It travels inside `anyhow::Error` and is
//! recovered with `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// A `COPY --from` or `ADD --from` named a stage that does not exist.
    #[error("{command} --from={name}: no stage found with that name")]
    UnknownStage { command: String, name: String },

    /// A `--from` named a stage that appears later in the Dockerfile.
    #[error("the stage {0:?} has not been built")]
    StageNotBuilt(String),

    /// An instruction the engine does not understand, in strict mode.
    #[error("unknown instruction: {0:?}")]
    UnknownInstruction(String),

    /// `--target` named a stage missing from the Dockerfile.
    #[error("the target {0:?} was not found in the provided Dockerfile")]
    TargetNotFound(String),

    /// A Dockerfile resolved to zero bytes of content.
    #[error("no contents in {0:?}")]
    EmptyDockerfile(String),

    /// No Dockerfile paths were supplied to the build.
    #[error("no dockerfiles specified")]
    NoDockerfiles,

    /// The parsed input contained no stages.
    #[error("no stages to build")]
    NoStages,

    /// `.in` preprocessing was requested but cpp is not installed.
    #[error("Dockerfile.in support requires {0} to be installed")]
    PreprocessorUnavailable(String),

    /// An image could not be deleted because a container still uses it.
    #[error("image {0:?} is in use by a container")]
    ImageInUse(String),

    /// The build was cancelled through its `CancelToken`.
    #[error("build cancelled")]
    Cancelled,
}
