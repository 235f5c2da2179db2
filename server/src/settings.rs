use atomicwrites::{AtomicFile, OverwriteBehavior};
use common::consts::TICKS_PER_SECOND;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    path::Path,
};
use tracing::{error, info, warn};

pub const SETTINGS_FILENAME: &str = "lodstream-server.ron";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enabled: bool,
    /// Radius in columns within which requests are served.
    pub view_distance: u32,
    pub max_sections_per_tick_per_client: u32,
    pub max_bytes_per_second_per_client: u64,
    pub send_light_data: bool,
    pub enable_disk_reading: bool,
    pub max_concurrent_disk_reads: usize,
    pub disk_reader_threads: usize,
    pub max_send_queue_size: usize,
    pub max_bytes_per_second_global: u64,
    pub max_requests_per_batch: usize,
    pub max_pending_requests_per_client: usize,
    pub enable_generation: bool,
    pub generation_distance: u32,
    pub max_concurrent_generations: usize,
    pub max_concurrent_generations_per_client: usize,
    pub generation_timeout_secs: u64,
    pub dirty_broadcast_interval_secs: u64,
    /// Positions a single client may advance per tick.
    pub max_work_per_tick_per_client: usize,
    /// Sections serialized from resident columns per tick, across all clients.
    pub max_serializations_per_tick: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            view_distance: 128,
            max_sections_per_tick_per_client: 200,
            max_bytes_per_second_per_client: 2 * 1024 * 1024,
            send_light_data: true,
            enable_disk_reading: true,
            max_concurrent_disk_reads: 64,
            disk_reader_threads: 2,
            max_send_queue_size: 4800,
            max_bytes_per_second_global: 10 * 1024 * 1024,
            max_requests_per_batch: 256,
            max_pending_requests_per_client: 512,
            enable_generation: true,
            generation_distance: 64,
            max_concurrent_generations: 16,
            max_concurrent_generations_per_client: 8,
            generation_timeout_secs: 60,
            dirty_broadcast_interval_secs: 15,
            max_work_per_tick_per_client: 512,
            max_serializations_per_tick: 1000,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, falling back to defaults when the file is
    /// unreadable. A missing file is created with the defaults.
    pub fn load(path: &Path) -> Self {
        let mut settings = if let Ok(file) = fs::File::open(path) {
            match ron::de::from_reader(file) {
                Ok(x) => x,
                Err(e) => {
                    warn!(?e, ?path, "Failed to parse setting file! Fallback to default.");
                    Self::default()
                },
            }
        } else {
            let default_settings = Self::default();
            if let Err(e) = default_settings.save_to_file(path) {
                error!(?e, ?path, "Failed to create default setting file!");
            } else {
                info!(?path, "Created default settings file");
            }
            default_settings
        };
        settings.validate();
        settings
    }

    pub fn save_to_file(&self, path: &Path) -> io::Result<()> {
        let ron = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
            .write(|f| f.write_all(ron.as_bytes()))
            .map_err(|e| match e {
                atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => e,
            })
    }

    /// Clamps every numeric setting into its supported range.
    pub fn validate(&mut self) {
        self.view_distance = self.view_distance.clamp(1, 512);
        self.max_sections_per_tick_per_client = self.max_sections_per_tick_per_client.clamp(1, 10_000);
        self.max_bytes_per_second_per_client = self
            .max_bytes_per_second_per_client
            .clamp(1024, 100 * 1024 * 1024);
        self.max_concurrent_disk_reads = self.max_concurrent_disk_reads.clamp(1, 512);
        self.disk_reader_threads = self.disk_reader_threads.clamp(1, 64);
        self.max_send_queue_size = self.max_send_queue_size.clamp(1, 100_000);
        self.max_bytes_per_second_global = self
            .max_bytes_per_second_global
            .clamp(1024, 1024 * 1024 * 1024);
        self.max_requests_per_batch = self.max_requests_per_batch.clamp(1, 1024);
        self.max_pending_requests_per_client = self.max_pending_requests_per_client.clamp(1, 4096);
        self.generation_distance = self.generation_distance.clamp(1, 512);
        self.max_concurrent_generations = self.max_concurrent_generations.clamp(1, 256);
        self.max_concurrent_generations_per_client =
            self.max_concurrent_generations_per_client.clamp(1, 64);
        self.generation_timeout_secs = self.generation_timeout_secs.clamp(1, 600);
        self.dirty_broadcast_interval_secs = self.dirty_broadcast_interval_secs.clamp(1, 300);
        self.max_work_per_tick_per_client = self.max_work_per_tick_per_client.clamp(1, 65_536);
        self.max_serializations_per_tick = self.max_serializations_per_tick.clamp(1, 65_536);
    }

    /// Cap on columns a client may have queued or running in generation.
    pub fn generation_pending_cap(&self) -> usize { self.max_concurrent_generations_per_client * 2 }

    pub fn generation_timeout_ticks(&self) -> u64 { self.generation_timeout_secs * TICKS_PER_SECOND }

    pub fn dirty_broadcast_interval_ticks(&self) -> u64 {
        self.dirty_broadcast_interval_secs * TICKS_PER_SECOND
    }
}
