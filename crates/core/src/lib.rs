//! Shared, dependency-light types used by every crate in the workspace:
//! layered settings, run/record identifiers, and the small error types that
//! cross crate boundaries.

mod error;
mod ids;
pub mod settings;

pub use error::CoreError;
pub use ids::{RecordNumber, RunId};
pub use settings::{ConsoleCaptureMode, ResumeMode, RetryPolicy, Settings};
