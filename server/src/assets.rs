//! Map and ruleset loading
//!
//! Loading goes through an [`AssetCache`] so that a restarted match does not
//! hit the disk again. When memory runs out while loading, the cache is
//! cleared and the load retried once.

use crate::error::LoadError;
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOAD_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ruleset {
    pub name: String,
    pub weapons: Vec<String>,
}

impl Ruleset {
    pub fn weapon_count(&self) -> u8 {
        self.weapons.len().min(u8::MAX as usize) as u8
    }
}

/// What a match needs before weapon selection can start.
#[derive(Debug, Clone)]
pub struct LoadedGame {
    pub map: Arc<MapInfo>,
    pub ruleset: Arc<Ruleset>,
}

pub trait AssetSource: Send {
    fn load_map(&mut self, name: &str) -> Result<MapInfo, LoadError>;
    fn load_ruleset(&mut self, name: &str) -> Result<Ruleset, LoadError>;
}

/// Reads maps from the levels directory and rulesets from the mods
/// directory, where every ruleset is a folder with a `weapons.txt` listing
/// one weapon per line.
#[derive(Debug, Clone)]
pub struct FileAssets {
    levels_dir: PathBuf,
    mods_dir: PathBuf,
}

impl FileAssets {
    pub fn new(levels_dir: impl Into<PathBuf>, mods_dir: impl Into<PathBuf>) -> Self {
        Self {
            levels_dir: levels_dir.into(),
            mods_dir: mods_dir.into(),
        }
    }
}

fn load_error(name: &str, path: &Path, e: io::Error) -> LoadError {
    match e.kind() {
        io::ErrorKind::NotFound => LoadError::NotFound(path.display().to_string()),
        io::ErrorKind::OutOfMemory => LoadError::OutOfMemory(name.to_string()),
        _ => LoadError::Invalid(name.to_string(), e.to_string()),
    }
}

impl AssetSource for FileAssets {
    fn load_map(&mut self, name: &str) -> Result<MapInfo, LoadError> {
        let path = self.levels_dir.join(name);
        let data = fs::read(&path).map_err(|e| load_error(name, &path, e))?;
        if data.is_empty() {
            return Err(LoadError::Invalid(name.to_string(), "empty map file".into()));
        }
        Ok(MapInfo {
            name: name.to_string(),
            size: data.len(),
        })
    }

    fn load_ruleset(&mut self, name: &str) -> Result<Ruleset, LoadError> {
        let path = self.mods_dir.join(name).join("weapons.txt");
        let text = fs::read_to_string(&path).map_err(|e| load_error(name, &path, e))?;
        let weapons: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if weapons.is_empty() {
            return Err(LoadError::Invalid(name.to_string(), "no weapons".into()));
        }
        Ok(Ruleset {
            name: name.to_string(),
            weapons,
        })
    }
}

/// Assets held in memory, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    pub maps: HashMap<String, MapInfo>,
    pub rulesets: HashMap<String, Ruleset>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(mut self, name: &str, size: usize) -> Self {
        self.maps.insert(
            name.to_string(),
            MapInfo {
                name: name.to_string(),
                size,
            },
        );
        self
    }

    pub fn with_ruleset(mut self, name: &str, weapons: &[&str]) -> Self {
        self.rulesets.insert(
            name.to_string(),
            Ruleset {
                name: name.to_string(),
                weapons: weapons.iter().map(|w| w.to_string()).collect(),
            },
        );
        self
    }
}

impl AssetSource for MemoryAssets {
    fn load_map(&mut self, name: &str) -> Result<MapInfo, LoadError> {
        self.maps
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.to_string()))
    }

    fn load_ruleset(&mut self, name: &str) -> Result<Ruleset, LoadError> {
        self.rulesets
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.to_string()))
    }
}

pub struct AssetCache {
    source: Box<dyn AssetSource>,
    maps: HashMap<String, Arc<MapInfo>>,
    rulesets: HashMap<String, Arc<Ruleset>>,
}

impl AssetCache {
    pub fn new(source: Box<dyn AssetSource>) -> Self {
        Self {
            source,
            maps: HashMap::new(),
            rulesets: HashMap::new(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.maps.len() + self.rulesets.len()
    }

    pub fn clear(&mut self) {
        self.maps.clear();
        self.rulesets.clear();
    }

    /// Loads map and ruleset, retrying once with an empty cache if memory
    /// ran out.
    pub fn load_game(&mut self, map: &str, ruleset: &str) -> Result<LoadedGame, LoadError> {
        for _ in 1..LOAD_ATTEMPTS {
            match self.try_load_game(map, ruleset) {
                Err(LoadError::OutOfMemory(what)) if self.entry_count() > 0 => {
                    warn!(
                        "Out of memory while loading '{}', clearing {} cached assets",
                        what,
                        self.entry_count()
                    );
                    self.clear();
                }
                result => return result,
            }
        }
        self.try_load_game(map, ruleset)
    }

    fn try_load_game(&mut self, map: &str, ruleset: &str) -> Result<LoadedGame, LoadError> {
        let map = match self.maps.get(map) {
            Some(cached) => Arc::clone(cached),
            None => {
                let loaded = Arc::new(self.source.load_map(map)?);
                info!("Loaded map '{}' ({} bytes)", loaded.name, loaded.size);
                self.maps.insert(map.to_string(), Arc::clone(&loaded));
                loaded
            }
        };
        let ruleset = match self.rulesets.get(ruleset) {
            Some(cached) => Arc::clone(cached),
            None => {
                let loaded = Arc::new(self.source.load_ruleset(ruleset)?);
                info!(
                    "Loaded ruleset '{}' with {} weapons",
                    loaded.name,
                    loaded.weapons.len()
                );
                self.rulesets.insert(ruleset.to_string(), Arc::clone(&loaded));
                loaded
            }
        };
        Ok(LoadedGame { map, ruleset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reports out-of-memory for the first `failures` ruleset loads.
    struct Exhausted {
        inner: MemoryAssets,
        failures: usize,
        ruleset_loads: usize,
    }

    impl AssetSource for Exhausted {
        fn load_map(&mut self, name: &str) -> Result<MapInfo, LoadError> {
            self.inner.load_map(name)
        }

        fn load_ruleset(&mut self, name: &str) -> Result<Ruleset, LoadError> {
            self.ruleset_loads += 1;
            if self.ruleset_loads <= self.failures {
                return Err(LoadError::OutOfMemory(name.to_string()));
            }
            self.inner.load_ruleset(name)
        }
    }

    fn assets() -> MemoryAssets {
        MemoryAssets::new()
            .with_map("arena.lxl", 1024)
            .with_map("other.lxl", 10)
            .with_ruleset("Classic", &["Shotgun", "Minigun"])
    }

    #[test]
    fn test_load_and_cache() {
        let mut cache = AssetCache::new(Box::new(assets()));
        let game = cache.load_game("arena.lxl", "Classic").unwrap();
        assert_eq!(game.ruleset.weapon_count(), 2);
        assert_eq!(cache.entry_count(), 2);

        cache.load_game("arena.lxl", "Classic").unwrap();
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn test_missing_map() {
        let mut cache = AssetCache::new(Box::new(assets()));
        assert_eq!(
            cache.load_game("nowhere.lxl", "Classic").unwrap_err(),
            LoadError::NotFound("nowhere.lxl".into())
        );
    }

    #[test]
    fn test_out_of_memory_retries_once_after_clearing() {
        let source = Exhausted {
            inner: assets(),
            failures: 1,
            ruleset_loads: 0,
        };
        let mut cache = AssetCache::new(Box::new(source));
        // Warm the cache so there is something to clear
        cache.maps.insert(
            "other.lxl".into(),
            Arc::new(MapInfo {
                name: "other.lxl".into(),
                size: 10,
            }),
        );

        let game = cache.load_game("arena.lxl", "Classic").unwrap();
        assert_eq!(game.map.name, "arena.lxl");
        assert!(!cache.maps.contains_key("other.lxl"));
    }

    #[test]
    fn test_out_of_memory_gives_up_on_second_failure() {
        let source = Exhausted {
            inner: assets(),
            failures: 2,
            ruleset_loads: 0,
        };
        let mut cache = AssetCache::new(Box::new(source));
        assert!(matches!(
            cache.load_game("arena.lxl", "Classic"),
            Err(LoadError::OutOfMemory(_))
        ));
    }

    #[test]
    fn test_file_assets() {
        let dir = std::env::temp_dir().join(format!("assets-test-{}", std::process::id()));
        let levels = dir.join("levels");
        let mods = dir.join("mods");
        fs::create_dir_all(&levels).unwrap();
        fs::create_dir_all(mods.join("Classic")).unwrap();
        fs::write(levels.join("arena.lxl"), [1u8; 64]).unwrap();
        fs::write(mods.join("Classic").join("weapons.txt"), "Shotgun\n\nBazooka\n").unwrap();

        let mut source = FileAssets::new(&levels, &mods);
        assert_eq!(source.load_map("arena.lxl").unwrap().size, 64);
        assert_eq!(source.load_ruleset("Classic").unwrap().weapon_count(), 2);
        assert!(matches!(
            source.load_ruleset("Missing"),
            Err(LoadError::NotFound(_))
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
