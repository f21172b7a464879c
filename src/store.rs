use crate::config::PrinterIdentity;
use crate::errors::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STORE_VERSION: u32 = 1;

/// On-disk form of the identity set. Connection state is never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPrinters {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub printers: Vec<PrinterIdentity>,
    #[serde(default)]
    pub active_printer_id: Option<String>,
}

fn current_version() -> u32 {
    STORE_VERSION
}

/// JSON file holding the registered printers.
pub struct PrinterStore {
    path: PathBuf,
}

impl PrinterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored set. A missing file is an empty set.
    pub async fn load(&self) -> Result<StoredPrinters> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No printer store at {:?}; starting empty", self.path);
                return Ok(StoredPrinters {
                    version: STORE_VERSION,
                    ..StoredPrinters::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let stored: StoredPrinters = serde_json::from_str(&data)?;
        if stored.version > STORE_VERSION {
            return Err(BridgeError::Config(format!(
                "printer store {:?} was written by a newer version (format {})",
                self.path, stored.version
            )));
        }

        info!("Loaded {} printers from {:?}", stored.printers.len(), self.path);
        Ok(stored)
    }

    /// Write the set atomically: a temp file next to the store is written
    /// and then renamed over it, so readers never see a partial file.
    pub async fn save(&self, printers: Vec<PrinterIdentity>, active: Option<String>) -> Result<()> {
        let stored = StoredPrinters {
            version: STORE_VERSION,
            printers,
            active_printer_id: active,
        };
        let json = serde_json::to_vec_pretty(&stored)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!("Failed to replace printer store {:?}: {}", self.path, e);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Saved {} printers to {:?}", stored.printers.len(), self.path);
        Ok(())
    }
}
