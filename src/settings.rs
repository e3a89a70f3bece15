// ============================================================================
// Settings - key=value config file, .env file, environment overrides
// ============================================================================

use std::path::{Path, PathBuf};

use crate::error::MapResult;
use crate::log_info;

/// Adjustable range of the generate/inpaint caps, in pixels.
pub const CAP_MIN_PX: u32 = 64;
pub const CAP_MAX_PX: u32 = 1024;

/// Directory that numeric map ids resolve into.
pub const SAVED_MAPS_DIR: &str = "saved_maps";

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Credentials for the image service; empty means not configured.
    pub api_key: String,
    pub api_base: String,
    /// Largest edge, in pixels, accepted by generate.
    pub gen_max_px: u32,
    /// Largest edge, in pixels, accepted by inpaint.
    pub inp_max_px: u32,
    /// Defaults for new maps.
    pub tile_size: u32,
    pub grid_width: u32,
    pub grid_height: u32,
    /// Where the service keeps its document.
    pub state_path: PathBuf,
    /// Where generated patch images are written.
    pub patch_dir: PathBuf,
    pub prompt: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: String::new(),
            gen_max_px: 400,
            inp_max_px: 200,
            tile_size: 32,
            grid_width: 120,
            grid_height: 68,
            state_path: PathBuf::from(SAVED_MAPS_DIR).join("map_web.json"),
            patch_dir: PathBuf::from("generated"),
            prompt: "lush forest ruins top-down tiles".to_string(),
        }
    }
}

impl Settings {
    /// `<config dir>/pixelmap/pixelmap.cfg`
    pub(crate) fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("pixelmap").join("pixelmap.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("pixelmap")
                    .join("pixelmap.cfg"),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join("pixelmap").join("pixelmap.cfg"))
        }
    }

    /// Defaults, then the config file (`path` or the platform default), then
    /// `./.env`, then process environment variables.
    pub fn load(path: Option<&Path>) -> Self {
        let mut s = Self::default();
        let cfg = path.map(Path::to_path_buf).or_else(Self::settings_path);
        if let Some(cfg) = cfg
            && let Ok(content) = std::fs::read_to_string(&cfg)
        {
            s.apply_config_text(&content);
            log_info!("Settings: loaded {}", cfg.display());
        }
        if let Ok(content) = std::fs::read_to_string(".env") {
            s.apply_config_text(&content);
        }
        s.apply_env(|key| std::env::var(key).ok());
        s
    }

    /// Apply `key=value` lines. Blank lines, `#` comments and unknown keys are
    /// ignored; an optional leading `export ` and surrounding quotes are
    /// stripped so `.env` files parse too.
    pub fn apply_config_text(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim().trim_matches('"').trim_matches('\'');
            self.set(key.trim(), val);
        }
    }

    /// Apply the `PIXELAB_*` / `PIXELMAP_*` environment overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in [
            "PIXELAB_API_KEY",
            "PIXELAB_API_BASE",
            "PIXELAB_GEN_MAX_PX",
            "PIXELAB_INP_MAX_PX",
            "PIXELMAP_TILE_SIZE",
            "PIXELMAP_GRID_WIDTH",
            "PIXELMAP_GRID_HEIGHT",
            "PIXELMAP_STATE_PATH",
            "PIXELMAP_PATCH_DIR",
            "PIXELMAP_PROMPT",
        ] {
            if let Some(val) = lookup(key) {
                self.set(key, &val);
            }
        }
    }

    /// Set one value by config or environment name. Unparsable numbers leave
    /// the current value in place.
    pub fn set(&mut self, key: &str, val: &str) {
        let key = key.to_lowercase();
        let key = key
            .strip_prefix("pixelab_")
            .or_else(|| key.strip_prefix("pixelmap_"))
            .unwrap_or(&key);
        match key {
            "api_key" => self.api_key = val.to_string(),
            "api_base" => self.api_base = val.trim_end_matches('/').to_string(),
            "gen_max_px" => {
                if let Ok(v) = val.parse::<u32>() {
                    self.gen_max_px = v.clamp(CAP_MIN_PX, CAP_MAX_PX);
                }
            }
            "inp_max_px" => {
                if let Ok(v) = val.parse::<u32>() {
                    self.inp_max_px = v.clamp(CAP_MIN_PX, CAP_MAX_PX);
                }
            }
            "tile_size" => {
                if let Ok(v) = val.parse::<u32>()
                    && v > 0
                {
                    self.tile_size = v;
                }
            }
            "grid_width" => {
                if let Ok(v) = val.parse::<u32>()
                    && v > 0
                {
                    self.grid_width = v;
                }
            }
            "grid_height" => {
                if let Ok(v) = val.parse::<u32>()
                    && v > 0
                {
                    self.grid_height = v;
                }
            }
            "state_path" => self.state_path = PathBuf::from(val),
            "patch_dir" => self.patch_dir = PathBuf::from(val),
            "prompt" => self.prompt = val.to_string(),
            _ => {}
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Render as the `key=value` form read by [`Settings::apply_config_text`].
    /// The API key is left out.
    pub fn to_config_text(&self) -> String {
        format!(
            "api_base={}\n\
             gen_max_px={}\n\
             inp_max_px={}\n\
             tile_size={}\n\
             grid_width={}\n\
             grid_height={}\n\
             state_path={}\n\
             patch_dir={}\n\
             prompt={}\n",
            self.api_base,
            self.gen_max_px,
            self.inp_max_px,
            self.tile_size,
            self.grid_width,
            self.grid_height,
            self.state_path.display(),
            self.patch_dir.display(),
            self.prompt,
        )
    }

    pub fn save_to(&self, path: &Path) -> MapResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_text())?;
        Ok(())
    }
}

/// `saved_maps/map_NNNN.json` for a map name. All-digit names keep their last
/// four digits, zero-padded.
pub fn map_path(name: &str) -> PathBuf {
    map_id_path(name, 4)
}

/// `saved_maps/map_<id>.json` with all-digit ids cut or padded to `digits`.
/// Older maps were saved with two-digit ids.
pub fn map_id_path(name: &str, digits: usize) -> PathBuf {
    let name = if is_map_id(name) {
        let tail = &name[name.len().saturating_sub(digits)..];
        format!("{:0>width$}", tail, width = digits)
    } else {
        name.to_string()
    };
    PathBuf::from(SAVED_MAPS_DIR).join(format!("map_{}.json", name))
}

pub fn is_map_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.gen_max_px, 400);
        assert_eq!(s.inp_max_px, 200);
        assert_eq!((s.tile_size, s.grid_width, s.grid_height), (32, 120, 68));
        assert!(!s.is_configured());
    }

    #[test]
    fn test_config_text_and_dotenv_forms() {
        let mut s = Settings::default();
        s.apply_config_text(
            "# comment\n\
             tile_size=16\n\
             export PIXELAB_API_KEY=\"secret\"\n\
             PIXELAB_API_BASE=https://api.example/\n\
             gen_max_px=5000\n\
             inp_max_px=abc\n\
             unknown=1\n",
        );
        assert_eq!(s.tile_size, 16);
        assert_eq!(s.api_key, "secret");
        assert_eq!(s.api_base, "https://api.example");
        assert_eq!(s.gen_max_px, CAP_MAX_PX);
        assert_eq!(s.inp_max_px, 200);
        assert!(s.is_configured());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("PIXELAB_INP_MAX_PX", "128"), ("PIXELMAP_PROMPT", "desert")]
            .into_iter()
            .collect();
        let mut s = Settings::default();
        s.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.inp_max_px, 128);
        assert_eq!(s.prompt, "desert");
    }

    #[test]
    fn test_config_text_round_trip() {
        let mut s = Settings::default();
        s.tile_size = 24;
        s.prompt = "snowy pines".into();
        let mut back = Settings::default();
        back.apply_config_text(&s.to_config_text());
        assert_eq!(back, s);
    }

    #[test]
    fn test_map_path() {
        assert_eq!(map_path("1283"), PathBuf::from("saved_maps/map_1283.json"));
        assert_eq!(map_path("7"), PathBuf::from("saved_maps/map_0007.json"));
        assert_eq!(map_path("991283"), PathBuf::from("saved_maps/map_1283.json"));
        assert_eq!(map_path("web"), PathBuf::from("saved_maps/map_web.json"));
        assert_eq!(map_id_path("1283", 2), PathBuf::from("saved_maps/map_83.json"));
        assert_eq!(map_id_path("1", 2), PathBuf::from("saved_maps/map_01.json"));
    }
}
