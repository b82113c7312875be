//! Banned addresses
//!
//! Stored as one `address,name` pair per line. The name is only a
//! reminder of who was banned; matching is done on the address alone.

use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct BanList {
    path: Option<PathBuf>,
    entries: BTreeMap<IpAddr, String>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the list from `path`, which is also where changes are saved.
    pub fn load(path: &Path) -> Self {
        let mut list = BanList {
            path: Some(path.to_path_buf()),
            entries: BTreeMap::new(),
        };
        match fs::read_to_string(path) {
            Ok(text) => {
                for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    let (addr, name) = line.split_once(',').unwrap_or((line, ""));
                    match addr.trim().parse::<IpAddr>() {
                        Ok(ip) => {
                            list.entries.insert(ip, name.trim().to_string());
                        }
                        Err(_) => warn!("Ignoring invalid ban list entry '{}'", line),
                    }
                }
                info!("Loaded {} banned addresses", list.entries.len());
            }
            Err(e) => info!("No ban list at {}: {}", path.display(), e),
        }
        list
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.entries.contains_key(&ip)
    }

    pub fn add(&mut self, ip: IpAddr, name: &str) {
        self.entries.insert(ip, name.to_string());
        info!("Banned {} ({})", ip, name);
        self.save();
    }

    pub fn remove(&mut self, ip: IpAddr) -> bool {
        let removed = self.entries.remove(&ip).is_some();
        if removed {
            self.save();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let text: String = self
            .entries
            .iter()
            .map(|(ip, name)| format!("{},{}\n", ip, name))
            .collect();
        if let Err(e) = fs::write(path, text) {
            warn!("Could not save ban list to {}: {}", path.display(), e);
        }
    }
}
