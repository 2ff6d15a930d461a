//! The operator-maintained list of servers held out of supervision.
use std::{
    collections::BTreeSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

/// Names currently suppressed from restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionSet {
    names: BTreeSet<String>,
}

impl ExceptionSet {
    /// Parses whitespace-separated server names.
    pub fn parse(contents: &str) -> Self {
        Self {
            names: contents.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Reads the set from `path`; a missing or unreadable file is an empty set.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("Exceptions file {path:?} not present");
                Self::default()
            }
            Err(err) => {
                warn!("Failed to read exceptions file {path:?}: {err}");
                Self::default()
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl FromIterator<String> for ExceptionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

/// Tracks the exceptions file and the set last read from it.
#[derive(Debug, Clone, Default)]
pub struct ExceptionSource {
    path: Option<PathBuf>,
    current: ExceptionSet,
}

impl ExceptionSource {
    /// A source backed by `path`, loaded immediately.
    pub fn from_path(path: Option<PathBuf>) -> Self {
        let mut source = Self {
            path,
            current: ExceptionSet::default(),
        };
        source.reload();
        source
    }

    /// A fixed set with no backing file.
    pub fn fixed(set: ExceptionSet) -> Self {
        Self {
            path: None,
            current: set,
        }
    }

    /// Re-reads the backing file, logging membership changes.
    pub fn reload(&mut self) {
        let Some(path) = &self.path else {
            return;
        };

        let next = ExceptionSet::load(path);
        if next != self.current {
            info!(
                "Exception set changed: [{}]",
                next.iter().collect::<Vec<_>>().join(", ")
            );
        }
        self.current = next;
    }

    pub fn current(&self) -> &ExceptionSet {
        &self.current
    }
}
