use std::path::PathBuf;

/// Errors raised while loading or merging [`crate::Settings`].
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
  #[error("failed to read settings file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse settings file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("more than one of resume/fork_from/resume_from was set; exactly one is allowed")]
  AmbiguousRunBranch,
}
