//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/hsm-egress/config.toml`
//! 3. User config: `~/.config/hsm-egress/config.toml`
//! 4. Additional config file (via `--config` flag)
//!
//! Scalars are **overridden**; routes, identities and key files are
//! **merged** by name.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/hsm-egress/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "hsm-egress";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Built-in defaults.
const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// One file in the configuration hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    System,
    User,
    /// Named with `--config`; must exist.
    Explicit,
}

/// Loads the configuration hierarchy.
///
/// The loader is kept for the life of the process so SIGHUP re-reads the
/// same files.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    system_path: PathBuf,
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Loader for `/etc/hsm-egress` and the user's config directory.
    #[must_use]
    pub fn new() -> Self {
        let user_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Loader reading the given system and user files instead.
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Merge every layer over the built-in defaults and validate the result.
    ///
    /// Absent system and user files are skipped; an absent `--config` file
    /// is [`ConfigError::MissingFile`].
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = parse(DEFAULT_CONFIG, Path::new("<built-in defaults>"))?;

        for (layer, path) in self.layers(cli) {
            match read_layer(&path)? {
                Some(overlay) => {
                    debug!(?layer, path = %path.display(), "Merging configuration layer");
                    config.merge(overlay);
                }
                None if layer == Layer::Explicit => return Err(ConfigError::MissingFile(path)),
                None => debug!(?layer, path = %path.display(), "Configuration layer absent"),
            }
        }

        config.validate()?;
        debug!(
            routes = config.routes.len(),
            identities = config.identities.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn layers(&self, cli: &Cli) -> Vec<(Layer, PathBuf)> {
        let mut layers = vec![
            (Layer::System, self.system_path.clone()),
            (Layer::User, self.user_path.clone()),
        ];
        if let Some(path) = &cli.config {
            layers.push((Layer::Explicit, path.clone()));
        }
        layers
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn read_layer(path: &Path) -> Result<Option<Config>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(contents) => parse(&contents, path).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn parse(contents: &str, path: &Path) -> Result<Config, ConfigError> {
    toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
