use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("could not extract {archive:?}: {reason}")]
    Extraction { archive: PathBuf, reason: String },

    #[error("{action} {path:?}: {source}")]
    Io {
        action: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt state file {path:?}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("another deploy, restore or profile switch is running for {game_dir:?}")]
    Busy { game_dir: PathBuf },

    #[error("mod \"{name}\" is deployed in profile \"{profile}\"; restore first")]
    ModDeployed { name: String, profile: String },

    #[error("profile \"{name}\" is {reason}")]
    ProfileInUse { name: String, reason: &'static str },

    #[error("unknown {kind} \"{name}\"")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Sort(#[from] SortError),
}

/// Problems found in an install script or in the selections made against it.
/// Always raised before anything is copied into staging.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("install script is not valid XML: {0}")]
    Xml(String),

    #[error("install script is missing <{0}>")]
    MissingElement(&'static str),

    #[error("unknown group selection type \"{0}\"")]
    UnknownSelectionType(String),

    #[error("unknown condition operator \"{0}\"")]
    UnknownOperator(String),

    #[error("unknown condition element <{0}>")]
    UnknownCondition(String),

    #[error("unknown plugin type \"{0}\"")]
    UnknownPluginType(String),

    #[error("bad version string \"{0}\"")]
    BadVersion(String),

    #[error("{kind} \"{name}\" is referenced but not defined")]
    DanglingReference { kind: &'static str, name: String },

    #[error("group \"{group}\" in step \"{step}\": {rule} (got {count})")]
    SelectionViolation {
        step: String,
        group: String,
        rule: &'static str,
        count: usize,
    },

    #[error("plugin \"{plugin}\" in group \"{group}\" is not usable")]
    NotUsable { group: String, plugin: String },

    #[error("install script references missing source \"{0}\"")]
    MissingSource(String),

    #[error("step \"{0}\" is not the current step")]
    StepMismatch(String),

    #[error("no install step is pending")]
    NoPendingStep,

    #[error("install steps remain, next is \"{0}\"")]
    Incomplete(String),

    #[error("mod requirements not met: {0}")]
    UnmetRequirements(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SortError {
    #[error("plugin order has a cycle involving {0}")]
    Cyclic(String),
    #[error("plugin order constraints cannot be satisfied: {0}")]
    Unsatisfiable(String),
    #[error("plugin sorter unavailable: {0}")]
    Unavailable(String),
}

pub trait IoResultExt<T> {
    fn io_ctx(self, action: &str, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn io_ctx(self, action: &str, path: &Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            action: action.to_string(),
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_context_keeps_path_and_action() {
        let err = Err::<(), _>(io::Error::new(io::ErrorKind::NotFound, "gone"))
            .io_ctx("read", Path::new("/tmp/x"))
            .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("read \"/tmp/x\""), "{text}");
    }

    #[test]
    fn validation_errors_convert() {
        let err: Error = ValidationError::UnknownSelectionType("PickTwo".into()).into();
        assert!(err.is_validation());
    }
}
