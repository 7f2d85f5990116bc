//! Records flowing through one pipeline run

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::loader::FileFormat;

/// Dotted path from an item payload to its array of entity references,
/// e.g. `track.album.artists`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPath(Vec<String>);

impl RefPath {
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Entity references found at this path. Missing intermediate objects,
    /// non-array targets and elements without a string `id` yield nothing.
    pub fn extract(&self, payload: &Value) -> Vec<EntityRef> {
        let mut node = payload;
        for segment in &self.0 {
            match node.get(segment) {
                Some(next) => node = next,
                None => return Vec::new(),
            }
        }

        node.as_array()
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| {
                        let id = r.get("id")?.as_str()?;
                        let name = r.get("name").and_then(Value::as_str).map(str::to_string);
                        Some(EntityRef::new(id, name))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for RefPath {
    fn default() -> Self {
        Self::parse("track.album.artists")
    }
}

impl std::fmt::Display for RefPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// One primary record from the paginated source
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Raw record as returned by the API
    pub payload: Value,
    /// Entity references found in the payload, in payload order
    pub refs: Vec<EntityRef>,
}

impl Item {
    pub fn from_payload(payload: Value, path: &RefPath) -> Self {
        let refs = path.extract(&payload);
        Self { payload, refs }
    }
}

/// Pointer to a secondary entity. Equality and hashing use `id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    pub name: Option<String>,
}

impl EntityRef {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Detail record returned by the entity lookup endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityDetail {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "genres")]
    pub tags: Vec<String>,
}

/// Secondary record produced once per unique entity id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedEntity {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "genres")]
    pub tags: Vec<String>,
}

impl EnrichedEntity {
    pub fn resolved(id: impl Into<String>, detail: EntityDetail) -> Self {
        Self {
            id: id.into(),
            name: detail.name,
            tags: detail.tags,
        }
    }

    /// Placeholder for a lookup that failed
    pub fn unresolved(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            tags: Vec::new(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.name.is_none() && self.tags.is_empty()
    }
}

/// Named record set destined for one warehouse table
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub file_name: String,
    pub records: Vec<Value>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, file_name: impl Into<String>, records: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            records,
        }
    }

    /// Build a dataset from any serializable rows
    pub fn from_rows<T: Serialize>(
        name: impl Into<String>,
        file_name: impl Into<String>,
        rows: &[T],
    ) -> serde_json::Result<Self> {
        let records = rows
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?;
        Ok(Self::new(name, file_name, records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize into `dir/<file_name>`, replacing any previous file.
    ///
    /// `Auto` writes a JSON array.
    pub fn write_to(&self, dir: &Path, format: FileFormat) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&self.file_name);
        let mut writer = std::io::BufWriter::new(std::fs::File::create(&path)?);

        match format {
            FileFormat::Ndjson => {
                for record in &self.records {
                    serde_json::to_writer(&mut writer, record)?;
                    writer.write_all(b"\n")?;
                }
            },
            FileFormat::JsonArray | FileFormat::Auto => {
                serde_json::to_writer_pretty(&mut writer, &self.records)?;
            },
        }

        writer.flush()?;
        Ok(path)
    }
}
