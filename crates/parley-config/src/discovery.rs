//! Locating and layering `parley` config files.
//!
//! Two layers are read, lowest precedence first: the user file
//! (`$PARLEY_CONFIG_DIR/config.toml`, or `parley/config.toml` under the
//! platform config dir) and the project file `./parley.toml`. Command-line
//! overrides are applied by the binary on top of the result.

use std::path::{Path, PathBuf};

use crate::{ConfigError, ParleyConfig, Result};

const PROJECT_FILE: &str = "parley.toml";
const USER_FILE: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "PARLEY_CONFIG_DIR";

/// One candidate config file and whether it contributed to the result.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    pub loaded: bool,
}

/// Merged configuration plus a record of how it was assembled.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ParleyConfig,
    /// Every candidate file, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Files that exist but were skipped because they failed to load.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter_map(|s| s.loaded.then_some(s.path.as_path()))
            .collect()
    }
}

/// Discover and merge the user and project layers.
///
/// `project_dir` defaults to the working directory.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_from(project_dir, None)
}

/// Like [`load_config`], but with the user config directory given
/// explicitly instead of resolved from the environment.
pub fn load_config_from(project_dir: Option<&Path>, user_dir: Option<&Path>) -> Result<LoadedConfig> {
    let user_file = match user_dir {
        Some(dir) => Some(dir.join(USER_FILE)),
        None => xdg_config_path(),
    };
    let project_file = project_dir.map_or_else(|| PathBuf::from(PROJECT_FILE), |d| d.join(PROJECT_FILE));

    let mut loaded = LoadedConfig {
        config: ParleyConfig::new(),
        sources: Vec::new(),
        warnings: Vec::new(),
    };
    for path in user_file.into_iter().chain(std::iter::once(project_file)) {
        let applied = apply_layer(&mut loaded, &path);
        loaded.sources.push(ConfigSource {
            path,
            loaded: applied,
        });
    }
    Ok(loaded)
}

/// Merge the file at `path` into `loaded.config`. Returns whether it was applied.
fn apply_layer(loaded: &mut LoadedConfig, path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match load_config_file(path) {
        Ok(layer) => {
            loaded.config.merge(layer);
            true
        }
        Err(e) => {
            loaded
                .warnings
                .push(format!("Skipping {}: {}", path.display(), e));
            false
        }
    }
}

/// Parse a single config file.
pub fn load_config_file(path: &Path) -> Result<ParleyConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    ParleyConfig::from_toml(&raw)
}

/// Write `config` as TOML to `path`, creating missing directories.
pub fn save_config(config: &ParleyConfig, path: &Path) -> Result<()> {
    let write_err = |at: &Path, source: std::io::Error| ConfigError::WriteFile {
        path: at.display().to_string(),
        source,
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| write_err(dir, e))?;
    }
    std::fs::write(path, config.to_toml()?).map_err(|e| write_err(path, e))
}

/// The user config file, if a config directory can be determined.
pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|dir| dir.join(USER_FILE))
}

/// `$PARLEY_CONFIG_DIR` when set and non-empty, else `parley/` under the
/// platform config dir.
pub fn xdg_config_dir() -> Option<PathBuf> {
    std::env::var_os(CONFIG_DIR_ENV)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|dir| dir.join("parley")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    use crate::StoreBackend;

    fn dirs_pair() -> (TempDir, TempDir) {
        (TempDir::new().unwrap(), TempDir::new().unwrap())
    }

    #[test]
    fn test_reads_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[store]\nbackend = \"redis\"\nurl = \"redis://cache:6379\"\n").unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.store().backend, StoreBackend::Redis);
        assert_eq!(config.store().url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn test_missing_and_broken_files_are_errors() {
        let dir = TempDir::new().unwrap();
        let missing = load_config_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::ReadFile { .. }));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config_file(&broken).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_no_layers_gives_defaults() {
        let (project, user) = dirs_pair();

        let loaded = load_config_from(Some(project.path()), Some(user.path())).unwrap();
        assert_eq!(loaded.config, ParleyConfig::new());
        assert_eq!(loaded.sources.len(), 2);
        assert!(loaded.loaded_from().is_empty());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_project_layer_overrides_user_layer() {
        let (project, user) = dirs_pair();
        fs::write(
            user.path().join(USER_FILE),
            "[server]\nport = 8081\n\n[cache]\nsession_ttl_secs = 120\n",
        )
        .unwrap();
        fs::write(project.path().join(PROJECT_FILE), "[server]\nport = 4000\n").unwrap();

        let loaded = load_config_from(Some(project.path()), Some(user.path())).unwrap();
        assert_eq!(loaded.config.server().port, 4000);
        assert_eq!(loaded.config.cache().session_ttl_secs, 120);

        let from = loaded.loaded_from();
        assert_eq!(from.len(), 2);
        assert!(from[0].starts_with(user.path()));
        assert!(from[1].ends_with(PROJECT_FILE));
    }

    #[test]
    fn test_broken_layer_is_skipped_with_warning() {
        let (project, user) = dirs_pair();
        fs::write(user.path().join(USER_FILE), "[server]\nport = 9001\n").unwrap();
        fs::write(project.path().join(PROJECT_FILE), "port = = 1").unwrap();

        let loaded = load_config_from(Some(project.path()), Some(user.path())).unwrap();
        assert_eq!(loaded.config.server().port, 9001);
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].starts_with("Skipping"));
        assert!(!loaded.sources[1].loaded);
    }

    #[test]
    fn test_saved_config_reloads_identically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join(USER_FILE);
        let config = ParleyConfig::new().resolved();

        save_config(&config, &path).unwrap();
        assert_eq!(load_config_file(&path).unwrap(), config);
    }
}
