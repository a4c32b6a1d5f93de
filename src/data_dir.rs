use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use `root` as is, without creating it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The MANUALDEX_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/manualdex/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("MANUALDEX_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("manualdex")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_db(&self) -> PathBuf {
        self.root.join("catalog.redb")
    }

    /// Page index directory. Not created here: readers treat a missing
    /// directory as an unavailable store.
    pub fn pages_dir(&self) -> PathBuf {
        self.root.join("pages")
    }

    pub fn cards_dir(&self) -> PathBuf {
        self.root.join("cards")
    }
}
