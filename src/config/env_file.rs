// KEY=VALUE file reader/writer
//
// Records keep their original order; keys the typed layer does not know
// survive a rewrite untouched. Comments and blank lines are accepted on read
// and dropped on write.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{LapseError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvFile {
    entries: Vec<(String, String)>,
}

impl EnvFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut file = EnvFile::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=').ok_or_else(|| {
                LapseError::Config(format!("line {}: expected KEY=VALUE", lineno + 1))
            })?;
            let key = key.trim();
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(LapseError::Config(format!("line {}: invalid key '{}'", lineno + 1, key)));
            }
            file.set(key, unquote(value.trim()));
        }
        Ok(file)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(self.render().as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            LapseError::Io(e)
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(&quote_if_needed(value));
            out.push('\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace in place when present, append otherwise.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

fn quote_if_needed(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace() || c == '#') {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let file = EnvFile::parse("# header\n\nPORT=3000\n  # indented\nMOCK_CAMERA=true\n").unwrap();
        assert_eq!(file.len(), 2);
        assert_eq!(file.get("PORT"), Some("3000"));
        assert_eq!(file.get("MOCK_CAMERA"), Some("true"));
    }

    #[test]
    fn test_parse_strips_quotes_and_export() {
        let file = EnvFile::parse("export A=\"hello world\"\nB='x'\nC=a=b\n").unwrap();
        assert_eq!(file.get("A"), Some("hello world"));
        assert_eq!(file.get("B"), Some("x"));
        assert_eq!(file.get("C"), Some("a=b"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(EnvFile::parse("NOT A RECORD\n").is_err());
        assert!(EnvFile::parse("BAD KEY=1\n").is_err());
    }

    #[test]
    fn test_set_preserves_order_and_unknown_keys() {
        let mut file = EnvFile::parse("CUSTOM_THING=42\nPORT=3000\n").unwrap();
        file.set("PORT", "4000");
        file.set("NEW_KEY", "v");
        assert_eq!(file.render(), "CUSTOM_THING=42\nPORT=4000\nNEW_KEY=v\n");
    }

    #[test]
    fn test_write_then_read() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("sub").join(".env");
        let mut file = EnvFile::new();
        file.set("STREAM_READY_SIGNAL", "HTTP TCP port");
        file.set("PORT", "3000");
        file.write(&path).unwrap();

        let back = EnvFile::read(&path).unwrap();
        assert_eq!(back, file);
        assert!(!path.with_extension("tmp").exists());
    }
}
