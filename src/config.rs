//! Configuration: the `KEY = VALUE` daemon config file plus the hdd folder
//! list. Both formats come from the C chunkserver and are re-read on SIGHUP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{format_err, Error};

use mfs_store::FolderConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mfschunkserver.cfg";

#[derive(Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    /// Read a config file. A missing file is not an error: every key has a
    /// default.
    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("config file {:?} not found, using defaults", path);
                Ok(Self::default())
            }
            Err(err) => Err(format_err!("unable to read {:?} - {}", path, err)),
        }
    }

    fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_owned(), value.trim().to_owned());
            }
        }
        Config { values }
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        match self.values.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!(
                    "config: invalid value '{}' for {}, using {}",
                    raw,
                    key,
                    default
                );
                default
            }),
            None => default,
        }
    }
}

/// Everything the daemon reads at startup (and again on reload).
#[derive(Clone, Debug)]
pub struct Settings {
    pub listen_host: String,
    pub listen_port: String,
    pub client_timeout: Duration,
    pub peer_timeout: Duration,
    pub master_host: String,
    pub master_port: String,
    pub master_timeout: Duration,
    pub reconnection_delay: Duration,
    pub hdd_conf: PathBuf,
    pub back_logs: u32,
    pub data_path: PathBuf,
    pub syslog_ident: String,
    pub workers: u8,
    pub job_queue_cap: usize,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        // the register frame encodes the timeout in 16 bits
        let master_timeout = cfg.get_u32("MASTER_TIMEOUT", 60).clamp(2, 65535);
        Settings {
            listen_host: cfg.get_str("CSSERV_LISTEN_HOST", "*"),
            listen_port: cfg.get_str("CSSERV_LISTEN_PORT", "9422"),
            client_timeout: Duration::from_secs(cfg.get_u32("CSSERV_TIMEOUT", 60) as u64),
            peer_timeout: Duration::from_secs(cfg.get_u32("CSTOCS_TIMEOUT", 60) as u64),
            master_host: cfg.get_str("MASTER_HOST", "mfsmaster"),
            master_port: cfg.get_str("MASTER_PORT", "9420"),
            master_timeout: Duration::from_secs(master_timeout as u64),
            reconnection_delay: Duration::from_secs(
                cfg.get_u32("MASTER_RECONNECTION_DELAY", 5).max(1) as u64,
            ),
            hdd_conf: PathBuf::from(cfg.get_str("HDD_CONF_FILENAME", "/etc/mfshdd.cfg")),
            back_logs: cfg.get_u32("BACK_LOGS", 50),
            data_path: PathBuf::from(cfg.get_str("DATA_PATH", ".")),
            syslog_ident: cfg.get_str("SYSLOG_IDENT", "mfschunkserver"),
            workers: cfg.get_u32("WORKERS", 10).clamp(1, 255) as u8,
            job_queue_cap: cfg.get_u32("JOB_QUEUE_CAP", 0) as usize,
        }
    }
}

/// Parse the hdd folder list: one path per line, `*` prefix marks a folder
/// draining, `#` starts a comment.
pub fn load_hdd_config(path: &Path) -> Result<Vec<FolderConfig>, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read hdd config {:?} - {}", path, err))?;
    let mut folders = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (to_delete, path) = match line.strip_prefix('*') {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };
        if path.is_empty() {
            continue;
        }
        folders.push(FolderConfig {
            path: PathBuf::from(path),
            to_delete,
        });
    }
    Ok(folders)
}
