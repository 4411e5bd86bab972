//! File-backed `PersistenceStore`.
//!
//! Values are staged in memory by `set` and written as one TOML table by
//! `flush`, through a temp file that is synced and renamed over the target.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use mmu_traits::{HwResult, PersistenceStore, StoredValue};

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("new");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp, path)
}

fn from_toml(v: &toml::Value) -> Option<StoredValue> {
    match v {
        toml::Value::Integer(i) => Some(StoredValue::Int(*i)),
        toml::Value::Float(f) => Some(StoredValue::Float(*f)),
        toml::Value::Array(items) => items
            .iter()
            .map(|x| match x {
                toml::Value::Float(f) => Some(*f),
                #[allow(clippy::cast_precision_loss)]
                toml::Value::Integer(i) => Some(*i as f64),
                _ => None,
            })
            .collect::<Option<Vec<f64>>>()
            .map(StoredValue::List),
        _ => None,
    }
}

fn to_toml(v: &StoredValue) -> toml::Value {
    match v {
        StoredValue::Int(i) => toml::Value::Integer(*i),
        StoredValue::Float(f) => toml::Value::Float(*f),
        StoredValue::List(items) => {
            toml::Value::Array(items.iter().map(|f| toml::Value::Float(*f)).collect())
        }
    }
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, StoredValue>,
    dirty: bool,
}

impl FileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> eyre::Result<Self> {
        let path = path.into();
        let mut values = BTreeMap::new();
        if path.exists() {
            let text = fs::read_to_string(&path)
                .map_err(|e| eyre::eyre!("read state file {:?}: {}", path, e))?;
            let table: toml::Table = toml::from_str(&text)
                .map_err(|e| eyre::eyre!("parse state file {:?}: {}", path, e))?;
            for (k, v) in &table {
                match from_toml(v) {
                    Some(sv) => {
                        values.insert(k.clone(), sv);
                    }
                    None => eyre::bail!("state file {:?}: unsupported value for key '{}'", path, k),
                }
            }
        }
        Ok(Self {
            path,
            values,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when staged values have not been flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl PersistenceStore for FileStore {
    fn get(&self, key: &str, default: StoredValue) -> StoredValue {
        self.values.get(key).cloned().unwrap_or(default)
    }

    fn set(&mut self, key: &str, value: StoredValue) {
        if self.values.get(key) != Some(&value) {
            self.values.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    fn flush(&mut self) -> HwResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let table: toml::Table = self.values.iter().map(|(k, v)| (k.clone(), to_toml(v))).collect();
        let text = toml::to_string(&table)?;
        write_atomic(&self.path, text.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}
