use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use models::{EnvironmentDescriptor, EnvironmentsResponse};

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentsError {
    #[error("failed to read environments file")]
    Io(#[from] std::io::Error),
    #[error("malformed environments file")]
    Parse(#[from] serde_json::Error),
}

#[derive(Default)]
struct State {
    revision: u64,
    environments: BTreeMap<String, EnvironmentDescriptor>,
}

/// Read-through cache of the environment directory: named environments
/// and their module lists and capacity hints, served over
/// request/response with a revision token broadcast on change.
#[derive(Default)]
pub struct EnvironmentDirectory {
    state: RwLock<State>,
}

impl EnvironmentDirectory {
    /// Load the backing JSON file. A missing file is an empty directory.
    pub fn load(path: &Path) -> Result<Self, EnvironmentsError> {
        let directory = Self::default();
        directory.reload(path)?;
        Ok(directory)
    }

    /// Re-read the backing file. Bumps the revision and returns it when
    /// the contents actually changed.
    pub fn reload(&self, path: &Path) -> Result<Option<u64>, EnvironmentsError> {
        let environments: BTreeMap<String, EnvironmentDescriptor> =
            match std::fs::read_to_string(path) {
                Ok(text) => serde_json::from_str(&text)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
                Err(err) => return Err(err.into()),
            };
        Ok(self.replace(environments))
    }

    /// Install a new directory; bumps the revision if it differs.
    pub fn replace(
        &self,
        environments: BTreeMap<String, EnvironmentDescriptor>,
    ) -> Option<u64> {
        let mut state = self.state.write().unwrap();
        if state.environments == environments {
            return None;
        }
        state.revision += 1;
        state.environments = environments;
        Some(state.revision)
    }

    pub fn response(&self) -> EnvironmentsResponse {
        let state = self.state.read().unwrap();
        EnvironmentsResponse {
            revision: state.revision,
            environments: state.environments.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_serves_the_backing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"lobby": {{"modules": ["chat", "menu"], "maxPlayers": 500}}}}"#
        )
        .unwrap();

        let directory = EnvironmentDirectory::load(file.path()).unwrap();
        let response = directory.response();
        assert_eq!(response.revision, 1);
        assert_eq!(response.environments["lobby"].max_players, 500);
        assert_eq!(response.environments["lobby"].modules, vec!["chat", "menu"]);
    }

    #[test]
    fn missing_file_is_an_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let directory = EnvironmentDirectory::load(&dir.path().join("environments.json")).unwrap();
        assert_eq!(directory.response().revision, 0);
        assert!(directory.response().environments.is_empty());
    }

    #[test]
    fn revision_bumps_only_on_change() {
        let directory = EnvironmentDirectory::default();
        let mut environments = BTreeMap::new();
        environments.insert(
            "lobby".to_string(),
            EnvironmentDescriptor {
                modules: vec![],
                max_players: 100,
            },
        );

        assert_eq!(directory.replace(environments.clone()), Some(1));
        assert_eq!(directory.replace(environments.clone()), None);

        environments.get_mut("lobby").unwrap().max_players = 200;
        assert_eq!(directory.replace(environments), Some(2));
    }
}
