//! Persisted desired state.
//!
//! One YAML document per cluster at `<state_dir>/<cluster>/Clusterfile`.
//! It is the only durable record: every invocation reloads it and it is
//! rewritten whenever the host lists change.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cluster::ClusterSpec;
use crate::{Error, Result, CLUSTERFILE_NAME};

/// Filesystem store for cluster documents.
#[derive(Clone, Debug)]
pub struct ClusterStore {
    root: PathBuf,
}

impl ClusterStore {
    /// Store rooted at a state directory (usually `~/.keel`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding everything local about one cluster.
    pub fn cluster_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Path of the persisted document.
    pub fn clusterfile_path(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(CLUSTERFILE_NAME)
    }

    /// Load the last saved document, `None` if the cluster was never applied.
    pub fn load(&self, name: &str) -> Result<Option<ClusterSpec>> {
        let path = self.clusterfile_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
        let spec: ClusterSpec = serde_yaml::from_str(&data)?;
        Ok(Some(spec))
    }

    /// Save a document, replacing the previous one atomically.
    pub fn save(&self, spec: &ClusterSpec) -> Result<PathBuf> {
        let dir = self.cluster_dir(spec.name());
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;

        let path = dir.join(CLUSTERFILE_NAME);
        let tmp = dir.join(format!(".{CLUSTERFILE_NAME}.tmp"));
        write_file(&tmp, &spec.to_yaml()?)?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::io(format!("rename {}", tmp.display()), e))?;

        debug!(cluster = %spec.name(), path = %path.display(), "saved cluster document");
        Ok(path)
    }

    /// Forget a cluster after teardown.
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.cluster_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| Error::io(format!("remove {}", dir.display()), e))?;
        }
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| Error::io(format!("write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ClusterSpec {
        ClusterSpec::new(
            "prod",
            "kubernetes:v1.22.15",
            vec!["10.0.0.1".parse().unwrap()],
            vec!["10.0.0.2".parse().unwrap()],
        )
    }

    #[test]
    fn never_applied_cluster_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStore::new(dir.path());
        assert!(store.load("prod").unwrap().is_none());
    }

    #[test]
    fn story_saved_intent_is_what_the_next_run_sees() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStore::new(dir.path());

        let mut spec = spec();
        store.save(&spec).unwrap();
        spec.spec.nodes.ip_list.push("10.0.0.3".parse().unwrap());
        store.save(&spec).unwrap();

        let loaded = store.load("prod").unwrap().unwrap();
        assert_eq!(loaded, spec);
        assert!(!dir.path().join("prod").join(".Clusterfile.tmp").exists());
    }

    #[test]
    fn remove_forgets_the_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStore::new(dir.path());
        store.save(&spec()).unwrap();
        store.remove("prod").unwrap();
        assert!(store.load("prod").unwrap().is_none());
        store.remove("prod").unwrap();
    }

    #[test]
    fn corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStore::new(dir.path());
        std::fs::create_dir_all(store.cluster_dir("prod")).unwrap();
        std::fs::write(store.clusterfile_path("prod"), "metadata: [").unwrap();
        assert!(matches!(
            store.load("prod"),
            Err(Error::Serialization { .. })
        ));
    }
}
