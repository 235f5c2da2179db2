use atomicwrites::{AtomicFile, OverwriteBehavior};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{error, info, warn};

pub const CLIENT_SETTINGS_FILENAME: &str = "lodstream-client.ron";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// When false the client never handshakes and stays passive.
    pub receive_server_lods: bool,
    /// Requested radius in columns. 0 uses whatever the server advertises.
    pub view_distance: u32,
    pub resync_batch_size: u32,
    /// Columns already cached are re-validated this often.
    pub resync_interval_secs: u64,
    pub cache_dir: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            receive_server_lods: true,
            view_distance: 0,
            resync_batch_size: 32,
            resync_interval_secs: 300,
            cache_dir: PathBuf::from("lodstream/cache"),
        }
    }
}

impl ClientSettings {
    /// Loads settings from `path`, falling back to defaults when the file is
    /// unreadable. A missing file is created with the defaults.
    pub fn load(path: &Path) -> Self {
        let mut settings = if let Ok(file) = fs::File::open(path) {
            match ron::de::from_reader(file) {
                Ok(x) => x,
                Err(e) => {
                    warn!(?e, ?path, "Failed to parse client setting file! Fallback to default.");
                    Self::default()
                },
            }
        } else {
            let default_settings = Self::default();
            if let Err(e) = default_settings.save_to_file(path) {
                error!(?e, ?path, "Failed to create default client setting file!");
            } else {
                info!(?path, "Created default client settings file");
            }
            default_settings
        };
        settings.validate();
        settings
    }

    pub fn save_to_file(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let ron = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
            .write(|f| f.write_all(ron.as_bytes()))
            .map_err(|e| match e {
                atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => e,
            })
    }

    pub fn validate(&mut self) {
        self.view_distance = self.view_distance.min(512);
        self.resync_batch_size = self.resync_batch_size.clamp(1, 256);
        self.resync_interval_secs = self.resync_interval_secs.clamp(10, 86_400);
    }

    pub fn resync_interval(&self) -> Duration { Duration::from_secs(self.resync_interval_secs) }
}
