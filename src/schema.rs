/* Schema loading (component F support): parses YAML schema files into `SchemaDesc`s. Mirrors
 * `schema_parse`/`parse` in original_source/src/core/parse/schema.c, but as a pure function
 * file -> Vec<SchemaDesc> over serde_yaml instead of hand-rolled libyaml event walking. */
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::{HoundError, Result};
use crate::record::{DataFmt, DataId, FieldType, Unit};

/// One schema entry as written in YAML: `{ id, name, fmt: [...] }`.
#[derive(Debug, Clone, Deserialize)]
struct RawDoc {
    id: DataId,
    name: String,
    fmt: Vec<RawFmt>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFmt {
    name: String,
    unit: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    size: usize,
    #[serde(rename = "type")]
    ty: String,
}

/// A schema entry describing one `data_id`'s payload layout. Parsed from
/// YAML once per driver at `driver_init` time.
#[derive(Debug, Clone)]
pub struct SchemaDesc {
    pub data_id: DataId,
    pub name: String,
    pub fmts: Vec<DataFmt>,
}

fn convert_doc(raw: RawDoc) -> Result<SchemaDesc> {
    let mut fmts = Vec::with_capacity(raw.fmt.len());
    for f in raw.fmt {
        let unit = Unit::from_str(&f.unit)
            .ok_or_else(|| HoundError::InvalidValue(format!("unknown unit '{}'", f.unit)))?;
        let ty = FieldType::from_str(&f.ty)
            .ok_or_else(|| HoundError::InvalidValue(format!("unknown type '{}'", f.ty)))?;
        fmts.push(DataFmt {
            name: f.name,
            unit,
            offset: f.offset,
            size: f.size,
            ty,
        });
    }

    Ok(SchemaDesc {
        data_id: raw.id,
        name: raw.name,
        fmts,
    })
}

/// Join `schema_base` and `schema` the way `norm_path` does in the original
/// C schema loader: a relative `schema` is resolved against the base
/// directory; an absolute one is used as-is.
pub fn resolve_path(schema_base: &Path, schema: &str) -> PathBuf {
    let schema_path = Path::new(schema);
    if schema_path.is_absolute() {
        schema_path.to_path_buf()
    } else {
        schema_base.join(schema_path)
    }
}

/// Parse a YAML schema file (a stream of one or more YAML documents, each a
/// mapping with `id`/`name`/`fmt` keys) into schema descriptors.
pub fn load(schema_base: &Path, schema: &str) -> Result<Vec<SchemaDesc>> {
    let path = resolve_path(schema_base, schema);
    let contents = std::fs::read_to_string(&path)?;
    parse_str(&contents)
}

/// Parse schema YAML from an in-memory string. Exposed separately from
/// [`load`] so tests and callers embedding schemas don't need a filesystem.
pub fn parse_str(contents: &str) -> Result<Vec<SchemaDesc>> {
    let mut descs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let raw = RawDoc::deserialize(document)?;
        let desc = convert_doc(raw)?;
        descs.push(desc);
    }
    Ok(descs)
}

/// Load every `*.yaml` schema under a directory, skipping (and logging) any
/// file that fails to parse rather than aborting the whole scan. Same
/// resilience policy `device_database::load_device_database` uses for
/// `.device` files.
pub fn load_dir(dir: &Path) -> Vec<(PathBuf, SchemaDesc)> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) => {
            warn!("failed to read schema directory {:?}: {}", dir, err);
            return out;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        match std::fs::read_to_string(&path).map_err(HoundError::from).and_then(|s| parse_str(&s)) {
            Ok(descs) => {
                for desc in descs {
                    out.push((path.clone(), desc));
                }
            }
            Err(err) => warn!("failed to parse schema {:?}: {}", path, err),
        }
    }

    out
}
