// Config store: validated mutation, persistence and reload
//
// Readers take an Arc<Settings> snapshot; the single writer swaps the
// snapshot only after the file has been written and re-read.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Map, Value};

use super::{parse_bitrate_kbps, EnvFile, Settings};
use crate::error::{LapseError, Result};
use crate::logging::Logger;

/// Keys the UI historically sent before the extended settings form existed.
const LEGACY_ALIASES: [(&str, &str); 5] = [
    ("captureInterval", "captureIntervalSeconds"),
    ("videoBitrate", "videoBitrateKbps"),
    ("flipH", "flipHorizontal"),
    ("flipV", "flipVertical"),
    ("maxStorage", "maxStorageGb"),
];

pub struct ConfigStore {
    path: PathBuf,
    snapshot: RwLock<Arc<Settings>>,
    write_lock: Mutex<()>,
    log: Logger,
}

impl ConfigStore {
    /// Open the settings file, creating it from the bundled template
    /// (`<file>.example` next to it) or from defaults when missing.
    pub fn load_or_init(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let log = Logger::new("config");

        if !path.exists() {
            let template = template_path(&path);
            if template.is_file() {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                fs::copy(&template, &path)?;
                log.info("created settings from template", &[("path", &path.display())]);
            } else {
                let mut file = EnvFile::new();
                Settings::default().apply_to_env_file(&mut file);
                file.write(&path)?;
                log.info("created settings from defaults", &[("path", &path.display())]);
            }
        }

        let settings = Settings::from_env_file(&EnvFile::read(&path)?)?;
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(settings)),
            write_lock: Mutex::new(()),
            log,
        })
    }

    /// Store that never touches disk until the first update (tests, CLI overrides).
    pub fn in_memory(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(Arc::new(settings)),
            write_lock: Mutex::new(()),
            log: Logger::new("config"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read the file and swap the snapshot.
    pub fn reload(&self) -> Result<Arc<Settings>> {
        let settings = Arc::new(Settings::from_env_file(&EnvFile::read(&self.path)?)?);
        self.swap(Arc::clone(&settings));
        Ok(settings)
    }

    /// Merge a camelCase JSON patch over the current snapshot, validate,
    /// persist and reload.
    pub fn update(&self, patch: &Map<String, Value>) -> Result<Arc<Settings>> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| LapseError::State("config writer poisoned".into()))?;

        let current = self.snapshot();
        let merged = merge_patch(&current, patch)?;
        merged.validate()?;
        self.persist(&merged)?;
        let reloaded = self.reload()?;
        self.log.info("settings saved", &[("keys", &patch.len())]);
        Ok(reloaded)
    }

    /// Apply one `KEY=VALUE` record as it would appear in the file.
    pub fn set_record(&self, key: &str, raw: &str) -> Result<Arc<Settings>> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| LapseError::State("config writer poisoned".into()))?;

        let mut next = (*self.snapshot()).clone();
        if !next.set_key(key, raw)? {
            return Err(LapseError::Validation(format!("unknown setting '{}'", key)));
        }
        next.validate()?;
        self.persist(&next)?;
        let reloaded = self.reload()?;
        self.log.info("setting saved", &[("key", &key)]);
        Ok(reloaded)
    }

    pub fn reset_to_defaults(&self) -> Result<Arc<Settings>> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| LapseError::State("config writer poisoned".into()))?;

        // Deployment keys stay where the operator put them.
        let current = self.snapshot();
        let mut defaults = Settings::default();
        defaults.port = current.port;
        defaults.captures_dir = current.captures_dir.clone();
        defaults.videos_dir = current.videos_dir.clone();
        defaults.temp_dir = current.temp_dir.clone();
        defaults.ui_dir = current.ui_dir.clone();
        defaults.mock_camera = current.mock_camera;

        self.persist(&defaults)?;
        let reloaded = self.reload()?;
        self.log.info("settings reset to defaults", &[]);
        Ok(reloaded)
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        let mut file = if self.path.exists() {
            EnvFile::read(&self.path)?
        } else {
            EnvFile::new()
        };
        settings.apply_to_env_file(&mut file);
        file.write(&self.path)
    }

    fn swap(&self, settings: Arc<Settings>) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}

fn template_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".example");
    path.with_file_name(name)
}

/// Apply `patch` to a JSON view of `current` and deserialize back.
pub fn merge_patch(current: &Settings, patch: &Map<String, Value>) -> Result<Settings> {
    let mut view = match serde_json::to_value(current)? {
        Value::Object(map) => map,
        _ => return Err(LapseError::Other("settings did not serialize to an object".into())),
    };

    for (raw_key, raw_value) in patch {
        let key = LEGACY_ALIASES
            .iter()
            .find(|(legacy, _)| legacy == raw_key)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(raw_key.as_str());

        let existing = view
            .get(key)
            .ok_or_else(|| LapseError::Validation(format!("unknown setting '{}'", raw_key)))?;
        let value = coerce(key, existing, raw_value)?;
        view.insert(key.to_string(), value);
    }

    serde_json::from_value(Value::Object(view))
        .map_err(|e| LapseError::Validation(format!("invalid settings: {}", e)))
}

/// Form fields arrive as strings; bring them to the JSON type of the field.
fn coerce(key: &str, existing: &Value, incoming: &Value) -> Result<Value> {
    if key == "videoBitrateKbps" {
        return match incoming {
            Value::Null => Ok(Value::Null),
            Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
            Value::String(s) => Ok(Value::from(parse_bitrate_kbps(s)?)),
            Value::Number(n) => Ok(Value::from(parse_bitrate_kbps(&n.to_string())?)),
            _ => Err(LapseError::Validation("videoBitrateKbps must be a number or string".into())),
        };
    }

    let Value::String(s) = incoming else {
        return Ok(incoming.clone());
    };
    match existing {
        Value::Bool(_) => Ok(Value::Bool(super::parse_bool(s)?)),
        Value::Number(n) if n.is_f64() => s
            .trim()
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| LapseError::Validation(format!("{}: not a number ('{}')", key, s))),
        Value::Number(_) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| LapseError::Validation(format!("{}: not an integer ('{}')", key, s))),
        _ => Ok(incoming.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_set_record_validates_and_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.env");
        let store = ConfigStore::load_or_init(&path).unwrap();

        let updated = store.set_record("CAPTURE_INTERVAL", "45").unwrap();
        assert_eq!(updated.capture_interval_seconds, 45);
        assert!(std::fs::read_to_string(&path).unwrap().contains("CAPTURE_INTERVAL=45"));

        assert!(store.set_record("ROTATION", "45").is_err());
        assert!(store.set_record("NOT_A_KEY", "1").is_err());
        assert_eq!(store.snapshot().rotation, 0);
    }

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_creates_file_from_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".env");
        let store = ConfigStore::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(*store.snapshot(), Settings::default());
    }

    #[test]
    fn test_creates_file_from_template() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".env");
        fs::write(tmp.path().join(".env.example"), "CAPTURE_INTERVAL=15\n").unwrap();
        let store = ConfigStore::load_or_init(&path).unwrap();
        assert_eq!(store.snapshot().capture_interval_seconds, 15);
    }

    #[test]
    fn test_update_persists_and_preserves_unknown_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".env");
        fs::write(&path, "# comment\nCUSTOM_FLAG=yes\nCAPTURE_INTERVAL=30\n").unwrap();
        let store = ConfigStore::load_or_init(&path).unwrap();

        let updated = store
            .update(&patch(json!({"captureIntervalSeconds": "5", "videoBitrate": "5m", "flipH": true})))
            .unwrap();
        assert_eq!(updated.capture_interval_seconds, 5);
        assert_eq!(updated.video_bitrate_kbps, Some(5000));
        assert!(updated.flip_horizontal);

        let on_disk = EnvFile::read(&path).unwrap();
        assert_eq!(on_disk.get("CUSTOM_FLAG"), Some("yes"));
        assert_eq!(on_disk.get("CAPTURE_INTERVAL"), Some("5"));
        assert_eq!(*store.reload().unwrap(), *updated);
    }

    #[test]
    fn test_update_rejects_invalid_without_writing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".env");
        let store = ConfigStore::load_or_init(&path).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        assert!(store.update(&patch(json!({"captureIntervalSeconds": 0}))).is_err());
        assert!(store.update(&patch(json!({"videoFps": 500}))).is_err());
        assert!(store.update(&patch(json!({"videoCodec": "vp9"}))).is_err());
        assert!(store.update(&patch(json!({"noSuchKey": 1}))).is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(*store.snapshot(), Settings::default());
    }

    #[test]
    fn test_reset_keeps_deployment_paths() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".env");
        fs::write(&path, "CAPTURES_DIR=/data/caps\nCAPTURE_INTERVAL=7\n").unwrap();
        let store = ConfigStore::load_or_init(&path).unwrap();

        let reset = store.reset_to_defaults().unwrap();
        assert_eq!(reset.capture_interval_seconds, Settings::default().capture_interval_seconds);
        assert_eq!(reset.captures_dir, PathBuf::from("/data/caps"));
    }
}
