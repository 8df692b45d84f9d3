//! Crash-recovery record of the OS defaults the engine overwrote.
//!
//! Written after the original defaults are captured and before they are
//! redirected, removed only by a clean shutdown. If the process dies while
//! routing, the next launch finds the file and puts the defaults back.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::audio::types::DeviceId;
use crate::error::{EngineError, Result};

/// Original default-output and default-system-output handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breadcrumb {
    pub output: DeviceId,
    pub system_output: DeviceId,
}

impl fmt::Display for Breadcrumb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.output, self.system_output)
    }
}

impl FromStr for Breadcrumb {
    type Err = String;

    /// `"<output>,<system_output>"`; a lone integer stands for both
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parse = |field: &str| {
            field
                .trim()
                .parse::<DeviceId>()
                .map_err(|e| format!("'{}': {}", field.trim(), e))
        };

        let mut fields = s.trim().split(',');
        let output = parse(fields.next().unwrap_or_default())?;
        let system_output = match fields.next() {
            Some(field) => parse(field)?,
            None => output,
        };
        if fields.next().is_some() {
            return Err(format!("too many fields in '{}'", s.trim()));
        }

        Ok(Self {
            output,
            system_output,
        })
    }
}

/// Result of looking for a breadcrumb left by a previous run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreadcrumbState {
    Absent,
    Found(Breadcrumb),
    /// File exists but does not parse
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct BreadcrumbStore {
    path: PathBuf,
}

impl BreadcrumbStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write atomically: a sibling temp file renamed over the target
    pub fn write(&self, breadcrumb: &Breadcrumb) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.error(e))?;
        }

        let temp = self.temp_path();
        fs::write(&temp, breadcrumb.to_string()).map_err(|e| self.error(e))?;
        fs::rename(&temp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            self.error(e)
        })?;

        debug!("Breadcrumb {} written to {:?}", breadcrumb, self.path);
        Ok(())
    }

    pub fn load(&self) -> Result<BreadcrumbState> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BreadcrumbState::Absent),
            Err(e) => return Err(self.error(e)),
        };

        Ok(match contents.parse::<Breadcrumb>() {
            Ok(breadcrumb) => BreadcrumbState::Found(breadcrumb),
            Err(reason) => BreadcrumbState::Corrupt(reason),
        })
    }

    /// Delete the breadcrumb. A missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(e)),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn error(&self, source: io::Error) -> EngineError {
        EngineError::Breadcrumb {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair_and_single() {
        assert_eq!(
            "73,91".parse::<Breadcrumb>().unwrap(),
            Breadcrumb {
                output: 73,
                system_output: 91
            }
        );
        assert_eq!(
            " 73\n".parse::<Breadcrumb>().unwrap(),
            Breadcrumb {
                output: 73,
                system_output: 73
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Breadcrumb>().is_err());
        assert!("abc".parse::<Breadcrumb>().is_err());
        assert!("1,2,3".parse::<Breadcrumb>().is_err());
        assert!("1,-2".parse::<Breadcrumb>().is_err());
    }

    #[test]
    fn test_write_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = BreadcrumbStore::new(dir.path().join("nested").join("relay.breadcrumb"));
        let crumb = Breadcrumb {
            output: 12,
            system_output: 14,
        };

        assert_eq!(store.load().unwrap(), BreadcrumbState::Absent);
        store.write(&crumb).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "12,14");
        assert_eq!(store.load().unwrap(), BreadcrumbState::Found(crumb));
        assert!(!store.temp_path().exists());

        store.remove().unwrap();
        store.remove().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = BreadcrumbStore::new(dir.path().join("relay.breadcrumb"));
        fs::write(store.path(), "not a device").unwrap();

        assert!(matches!(store.load().unwrap(), BreadcrumbState::Corrupt(_)));
    }
}
