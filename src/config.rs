use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use crate::cache::Viewport;
use crate::sync::DEFAULT_CHANNEL;

// ---------------------------------------------------------------------------
// ConfigFile: deserialized from TOML (all fields optional)
// ---------------------------------------------------------------------------

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub channel: Option<String>,
    pub ppi: Option<f32>,
    pub viewport: ViewportConfigFile,
    pub render: RenderConfigFile,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ViewportConfigFile {
    pub width: Option<f64>,
    pub height: Option<f64>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct RenderConfigFile {
    pub prefetch: Option<bool>,
    pub poll_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Config: resolved (all fields concrete)
// ---------------------------------------------------------------------------

pub struct Config {
    pub channel: String,
    pub ppi: f32,
    pub viewport: Viewport,
    pub render: RenderConfig,
}

pub struct RenderConfig {
    pub prefetch: bool,
    pub poll_interval: Duration,
}

impl ConfigFile {
    /// Merge CLI values (overwrites non-None fields).
    pub fn merge_cli(
        &mut self,
        width: Option<f64>,
        height: Option<f64>,
        ppi: Option<f32>,
        no_prefetch: bool,
    ) {
        if let Some(v) = width {
            debug!("config: CLI override viewport.width={v}");
            self.viewport.width = width;
        }
        if let Some(v) = height {
            debug!("config: CLI override viewport.height={v}");
            self.viewport.height = height;
        }
        if let Some(v) = ppi {
            debug!("config: CLI override ppi={v}");
            self.ppi = ppi;
        }
        if no_prefetch {
            debug!("config: CLI override render.prefetch=false");
            self.render.prefetch = Some(false);
        }
    }

    /// Resolve to a Config by applying defaults to missing fields.
    pub fn resolve(self) -> Config {
        let config = Config {
            channel: self.channel.unwrap_or_else(|| DEFAULT_CHANNEL.into()),
            ppi: self.ppi.unwrap_or(144.0),
            viewport: Viewport::new(
                self.viewport.width.unwrap_or(1280.0),
                self.viewport.height.unwrap_or(720.0),
            ),
            render: RenderConfig {
                prefetch: self.render.prefetch.unwrap_or(true),
                poll_interval: Duration::from_millis(
                    self.render.poll_interval_ms.unwrap_or(16).max(1),
                ),
            },
        };
        info!(
            "config: resolved channel={}, ppi={}, viewport={}x{}, prefetch={}, \
             poll_interval={}ms",
            config.channel,
            config.ppi,
            config.viewport.width,
            config.viewport.height,
            config.render.prefetch,
            config.render.poll_interval.as_millis(),
        );
        config
    }
}

/// Resolve the XDG config path for tandem.
fn config_path() -> Option<PathBuf> {
    let config_dir = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(config_dir.join("tandem").join("config.toml"))
}

/// Load config file. Returns `ConfigFile::default()` if no file exists.
/// Returns an error if the file exists but cannot be parsed.
pub fn load_config() -> anyhow::Result<ConfigFile> {
    let path = match config_path() {
        Some(p) => p,
        None => {
            info!("config: no HOME or XDG_CONFIG_HOME set, using defaults");
            return Ok(ConfigFile::default());
        }
    };
    debug!("config: looking for {}", path.display());
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            info!("config: loaded from {}", path.display());
            let cfg: ConfigFile = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("config: {} not found, using defaults", path.display());
            Ok(ConfigFile::default())
        }
        Err(e) => Err(anyhow::anyhow!("failed to read {}: {e}", path.display())),
    }
}
