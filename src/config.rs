//! Server and client settings, paths under the per-user base directory.

use std::{
   path::PathBuf,
   sync::OnceLock,
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{Result, keep_alive::KeepAlive};

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Environment variables with this prefix override the config file,
/// e.g. `COMPILE_SERVER_KEEP_ALIVE_SECS=0`.
pub const ENV_PREFIX: &str = "COMPILE_SERVER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   /// Endpoint names are `<pipe_name_base><pid>`.
   pub pipe_name_base: String,
   /// Initial keep-alive: positive seconds idle, `0` single-shot, negative
   /// forever.
   pub keep_alive_secs: i64,

   pub connect_timeout_ms:  u64,
   pub response_timeout_ms: u64,

   pub csharp_compiler:       Option<PathBuf>,
   pub visual_basic_compiler: Option<PathBuf>,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         pipe_name_base:        "compile-server-".to_string(),
         keep_alive_secs:       600,
         connect_timeout_ms:    500,
         response_timeout_ms:   300_000,
         csharp_compiler:       None,
         visual_basic_compiler: None,
      }
   }
}

impl Config {
   /// Defaults, then the config file if present, then the environment.
   /// A malformed source is logged and the defaults are used.
   pub fn load() -> Self {
      Self::try_load()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   pub fn try_load() -> Result<Self> {
      Ok(Self::figment().extract()?)
   }

   fn figment() -> Figment {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));
      let path = config_file_path();
      if path.exists() {
         figment = figment.merge(Toml::file(path));
      }
      figment.merge(Env::prefixed(ENV_PREFIX).lowercase(true))
   }

   pub fn keep_alive(&self) -> KeepAlive {
      KeepAlive::from_secs(self.keep_alive_secs)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn response_timeout(&self) -> Duration {
      Duration::from_millis(self.response_timeout_ms)
   }
}

/// Returns the global configuration instance
pub fn get() -> &'static Config {
   CONFIG.get_or_init(Config::load)
}

/// Returns the base directory for server state and configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".compile-server"))
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| std::env::temp_dir().join(dir_name))
}

macro_rules! define_paths {
   ($($fn_name:ident: $path:literal),* $(,)?) => {
      $(
         pub fn $fn_name() -> &'static PathBuf {
            static ONCE: OnceLock<PathBuf> = OnceLock::new();
            ONCE.get_or_init(|| base_dir().join($path))
         }
      )*
   };
}

define_paths! {
   config_file_path: "config.toml",
   socket_dir: "sockets",
}
