use std::path::Path;

use crate::Error;

/// Name of the plain-text role file expected at the process root.
pub const ENVIRONMENT_FILE: &str = "ENVIRONMENT";

/// Contents of the `ENVIRONMENT` file: the first non-empty line is the
/// role descriptor, an optional second line overrides the advertised IP.
/// A missing file means the default `dev` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub descriptor: String,
    pub ip_override: Option<String>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            descriptor: "dev".to_string(),
            ip_override: None,
        }
    }
}

impl Environment {
    /// Read `ENVIRONMENT` from the current working directory.
    pub fn load_default() -> Result<Self, Error> {
        Self::load(Path::new(ENVIRONMENT_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(Error::Environment(err)),
        }
    }

    fn parse(text: &str) -> Self {
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        let Some(descriptor) = lines.next() else {
            return Self::default();
        };
        Self {
            descriptor: descriptor.to_string(),
            ip_override: lines.next().map(str::to_string),
        }
    }
}
