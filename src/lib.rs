//! A multi-stage container image build engine.
//!
//! `imageforge` interprets a parsed Dockerfile instruction tree and, for each
//! stage, materializes a working root filesystem, executes instructions
//! against it, and commits the result as image layers in a content-addressed
//! store. Image storage, base-image pulling, and command execution inside the
//! working container are consumed through the narrow [`store::Store`] and
//! [`builder::Builder`] interfaces, so the engine itself stays independent of
//! any particular storage or runtime backend.

pub mod builder;
pub mod cancel;
pub mod error;
pub mod image;
pub mod store;

pub use builder::{Builder, BuilderOptions, ImageConfig};
pub use cancel::CancelToken;
pub use error::BuildError;
pub use image::{build_dockerfiles, BuildOptions, Executor};
pub use store::{CanonicalRef, ImageRef, Store};
