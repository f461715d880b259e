use crate::error::AppError;
use crate::tags::normalize_tags;
use chrono::{Local, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Keys that may name the preview file, in priority order.
const PREVIEW_KEYS: &[&str] = &["thumbnail", "cover", "image", "preview"];

/// The user-editable JSON document stored inside a project folder.
///
/// Keys this crate does not understand are kept and written back untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sidecar {
    document: Map<String, Value>,
}

fn parse_rating(value: &Value) -> Option<u8> {
    let rating = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    u8::try_from(rating).ok().filter(|r| *r <= 5)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Sidecar {
    pub fn from_document(document: Map<String, Value>) -> Self {
        Self { document }
    }

    pub fn raw_tags(&self) -> Option<&Value> {
        self.document.get("tags")
    }

    /// Tags after normalization; empty when the key is absent or unusable.
    pub fn tags(&self) -> Vec<String> {
        self.raw_tags().map(normalize_tags).unwrap_or_default()
    }

    /// `rating`, falling back to the legacy `note` key when `rating` is absent.
    pub fn rating(&self) -> Option<u8> {
        match self.document.get("rating") {
            Some(Value::Null) | None => self.document.get("note").and_then(parse_rating),
            Some(value) => parse_rating(value),
        }
    }

    pub fn preview_name(&self) -> Option<&str> {
        PREVIEW_KEYS
            .iter()
            .find_map(|key| non_empty_str(self.document.get(*key)))
    }

    pub fn added_at(&self) -> Option<&str> {
        non_empty_str(self.document.get("added_at"))
    }

    pub fn modified_at(&self) -> Option<&str> {
        non_empty_str(self.document.get("modified_at"))
    }

    pub fn set_tags(&mut self, tags: &[String]) {
        let values = tags.iter().cloned().map(Value::String).collect();
        self.document.insert("tags".into(), Value::Array(values));
    }

    pub fn set_rating(&mut self, rating: u8) {
        self.document.insert("rating".into(), Value::from(rating));
    }

    pub fn touch(&mut self) {
        self.document.insert("modified_at".into(), Value::String(now_iso()));
    }
}

/// Reads and writes sidecar documents named `file_name` inside project folders.
#[derive(Debug, Clone)]
pub struct SidecarStore {
    file_name: String,
}

impl SidecarStore {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path_in(&self, folder: &Path) -> PathBuf {
        folder.join(&self.file_name)
    }

    /// Loads the sidecar of `folder`. Missing or malformed documents yield `None`.
    pub fn read(&self, folder: &Path) -> Option<Sidecar> {
        self.read_file(&self.path_in(folder))
    }

    pub fn read_file(&self, path: &Path) -> Option<Sidecar> {
        if !path.is_file() {
            return None;
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Cannot read sidecar {:?}: {}", path, e);
                return None;
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(document)) => Some(Sidecar::from_document(document)),
            Ok(_) => {
                log::warn!("Ignoring sidecar {:?}: not a JSON object", path);
                None
            }
            Err(e) => {
                log::warn!("Ignoring malformed sidecar {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn write(&self, folder: &Path, sidecar: &Sidecar) -> Result<(), AppError> {
        self.write_file(&self.path_in(folder), sidecar)
    }

    /// Backs up the current file, then replaces it through a temp file in the same folder.
    pub fn write_file(&self, path: &Path, sidecar: &Sidecar) -> Result<(), AppError> {
        let parent = path
            .parent()
            .ok_or_else(|| AppError::InvalidInput(format!("{:?} has no parent", path)))?;

        if path.exists() {
            let backup = backup_file(path)?;
            log::debug!("Backed up {:?} to {:?}", path, backup);
        }

        let mut body = serde_json::to_string_pretty(&sidecar.document)?;
        body.push('\n');

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;

        log::debug!("Wrote sidecar {:?}", path);
        Ok(())
    }
}

/// Copies `path` to `<name>.bak`, or to `<name>.<timestamp>.bak` when that exists.
fn backup_file(path: &Path) -> Result<PathBuf, AppError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut backup = path.with_file_name(format!("{}.bak", name));
    if backup.exists() {
        let ts = Local::now().format("%Y%m%d-%H%M%S");
        backup = path.with_file_name(format!("{}.{}.bak", name, ts));
    }

    fs::copy(path, &backup)?;
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NAME: &str = ".stl_collect.json";

    fn sidecar(value: Value) -> Sidecar {
        match value {
            Value::Object(map) => Sidecar::from_document(map),
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn reads_fields_and_legacy_aliases() {
        let meta = sidecar(json!({
            "tags": "red, blue",
            "note": "4",
            "cover": "front.png",
            "preview": "ignored.png",
            "added_at": "2024-01-02T03:04:05Z",
        }));
        assert_eq!(meta.tags(), vec!["red".to_string(), "blue".to_string()]);
        assert_eq!(meta.rating(), Some(4));
        assert_eq!(meta.preview_name(), Some("front.png"));
        assert_eq!(meta.added_at(), Some("2024-01-02T03:04:05Z"));
        assert_eq!(meta.modified_at(), None);
    }

    #[test]
    fn rating_takes_precedence_over_note_and_is_range_checked() {
        assert_eq!(sidecar(json!({"rating": 2, "note": 5})).rating(), Some(2));
        assert_eq!(sidecar(json!({"rating": null, "note": 5})).rating(), Some(5));
        assert_eq!(sidecar(json!({"rating": 4.0})).rating(), Some(4));
        assert_eq!(sidecar(json!({"rating": 9})).rating(), None);
        assert_eq!(sidecar(json!({"rating": -1})).rating(), None);
        assert_eq!(sidecar(json!({"rating": "great"})).rating(), None);
    }

    #[test]
    fn empty_preview_values_are_skipped() {
        let meta = sidecar(json!({"thumbnail": "", "cover": 3, "image": "pic.jpg"}));
        assert_eq!(meta.preview_name(), Some("pic.jpg"));
    }

    #[test]
    fn missing_and_malformed_sidecars_read_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SidecarStore::new(NAME);
        assert!(store.read(tmp.path()).is_none());

        fs::write(tmp.path().join(NAME), "{ not json").unwrap();
        assert!(store.read(tmp.path()).is_none());

        fs::write(tmp.path().join(NAME), "[1, 2]").unwrap();
        assert!(store.read(tmp.path()).is_none());
    }

    #[test]
    fn write_preserves_unknown_keys_and_backs_up() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SidecarStore::new(NAME);
        let original = r#"{"tags": "a,b", "source": "printables"}"#;
        fs::write(tmp.path().join(NAME), original).unwrap();

        let mut meta = store.read(tmp.path()).unwrap();
        meta.set_tags(&meta.tags());
        meta.set_rating(3);
        store.write(tmp.path(), &meta).unwrap();

        let backup = fs::read_to_string(tmp.path().join(format!("{}.bak", NAME))).unwrap();
        assert_eq!(backup, original);

        let reread = store.read(tmp.path()).unwrap();
        assert_eq!(reread.raw_tags(), Some(&json!(["a", "b"])));
        assert_eq!(reread.rating(), Some(3));
        assert_eq!(reread.document.get("source"), Some(&json!("printables")));
    }

    #[test]
    fn second_write_keeps_first_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SidecarStore::new(NAME);
        fs::write(tmp.path().join(NAME), r#"{"rating": 1}"#).unwrap();

        let mut meta = store.read(tmp.path()).unwrap();
        meta.set_rating(2);
        store.write(tmp.path(), &meta).unwrap();
        meta.set_rating(3);
        store.write(tmp.path(), &meta).unwrap();

        let first = fs::read_to_string(tmp.path().join(format!("{}.bak", NAME))).unwrap();
        assert_eq!(first, r#"{"rating": 1}"#);

        let stamped = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with(NAME) && name.ends_with(".bak") && name != format!("{}.bak", NAME)
            })
            .count();
        assert_eq!(stamped, 1);
    }

    #[test]
    fn writing_a_new_sidecar_needs_no_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SidecarStore::new(NAME);
        let mut meta = Sidecar::default();
        meta.set_rating(5);
        meta.touch();
        store.write(tmp.path(), &meta).unwrap();

        assert!(!tmp.path().join(format!("{}.bak", NAME)).exists());
        let reread = store.read(tmp.path()).unwrap();
        assert_eq!(reread.rating(), Some(5));
        assert!(reread.modified_at().is_some());
    }
}
