//! Manifest loading.
//!
//! Turns Deployment-style YAML manifests (and native JSON specs) into
//! [`ResourceSpec`]s ready for submission. Directories are read
//! non-recursively in file-name order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_core::format::{from_json, from_yaml_documents, read_file};
use keel_core::{Error, Result};
use keel_reconciler::{DesiredAttributes, ResourceId, ResourceKind, ResourceLimits, ResourceSpec};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_NAMESPACE: &str = "default";
const BYTES_PER_MIB: u64 = 1_048_576;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    kind: String,
    metadata: Metadata,
    spec: ManifestSpec,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestSpec {
    #[serde(default = "default_replicas")]
    replicas: u32,
    image: String,
    #[serde(default)]
    resources: Resources,
    #[serde(default)]
    poll_interval_seconds: Option<u64>,
}

const fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
struct Resources {
    #[serde(default)]
    limits: Limits,
}

#[derive(Debug, Default, Deserialize)]
struct Limits {
    cpu: Option<Quantity>,
    memory: Option<Quantity>,
}

/// YAML lets quantities be written bare (`cpu: 2`) or quoted (`cpu: "500m"`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Quantity {
    Integer(u64),
    Float(f64),
    Text(String),
}

impl Quantity {
    fn as_text(&self) -> String {
        match self {
            Self::Integer(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonDocument {
    Many(Vec<ResourceSpec>),
    One(ResourceSpec),
}

impl Manifest {
    fn into_spec(self) -> Result<ResourceSpec> {
        let kind: ResourceKind = self
            .kind
            .parse()
            .map_err(|_| Error::invalid_record(format!("unsupported kind '{}'", self.kind)))?;

        let limits = ResourceLimits {
            cpu_millis: self
                .spec
                .resources
                .limits
                .cpu
                .map(|q| parse_cpu(&q.as_text()))
                .transpose()?,
            memory_mib: self
                .spec
                .resources
                .limits
                .memory
                .map(|q| parse_memory(&q.as_text()))
                .transpose()?,
        };

        let namespace = self
            .metadata
            .namespace
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let attributes = DesiredAttributes {
            replicas: self.spec.replicas,
            image: self.spec.image,
            limits,
            labels: self.metadata.labels,
        };

        let spec = ResourceSpec::new(
            ResourceId::new(namespace, kind, self.metadata.name),
            attributes,
        );
        Ok(match self.spec.poll_interval_seconds {
            Some(secs) => spec.with_poll_interval(Duration::from_secs(secs)),
            None => spec,
        })
    }
}

/// Parse a multi-document YAML manifest stream.
///
/// # Errors
///
/// Returns [`Error::YamlParseFailed`] for malformed YAML and
/// [`Error::InvalidRecord`] for unknown kinds or malformed quantities.
pub fn parse_manifests(input: &str) -> Result<Vec<ResourceSpec>> {
    from_yaml_documents::<Manifest>(input)?
        .into_iter()
        .map(Manifest::into_spec)
        .collect()
}

/// Load specs from every path, in argument order.
///
/// # Errors
///
/// Fails on the first path that cannot be read or parsed.
pub fn load_paths(paths: &[PathBuf]) -> Result<Vec<ResourceSpec>> {
    paths.iter().try_fold(Vec::new(), |mut specs, path| {
        specs.extend(load_path(path)?);
        Ok(specs)
    })
}

/// Load specs from a single file or a directory of manifests.
///
/// # Errors
///
/// Returns [`Error::PathNotFound`] when `path` does not exist, otherwise any
/// read or parse error of the files involved.
pub fn load_path(path: &Path) -> Result<Vec<ResourceSpec>> {
    if !path.exists() {
        return Err(Error::path_not_found(path));
    }
    if path.is_dir() {
        manifest_files(path)?
            .iter()
            .try_fold(Vec::new(), |mut specs, file| {
                specs.extend(load_file(file)?);
                Ok(specs)
            })
    } else {
        load_file(path)
    }
}

fn load_file(path: &Path) -> Result<Vec<ResourceSpec>> {
    let raw = read_file(path)?;
    let specs = if has_extension(path, &["json"]) {
        match from_json::<JsonDocument>(&raw)? {
            JsonDocument::Many(specs) => specs,
            JsonDocument::One(spec) => vec![spec],
        }
    } else {
        parse_manifests(&raw)?
    };
    debug!(path = %path.display(), count = specs.len(), "Loaded manifest file");
    Ok(specs)
}

fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|p| p.is_file() && has_extension(p, &["yaml", "yml", "json"]))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

fn invalid_quantity(dimension: &str, raw: &str) -> Error {
    Error::invalid_record(format!("malformed {dimension} quantity '{raw}'"))
}

/// Parse a CPU quantity into millicores: `500m`, `2`, `1.5`.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] for anything else, including more than
/// three fractional digits.
pub fn parse_cpu(raw: &str) -> Result<u32> {
    if let Some(millis) = raw.strip_suffix('m') {
        return millis
            .parse::<u32>()
            .map_err(|_| invalid_quantity("cpu", raw));
    }

    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    if fraction.len() > 3 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid_quantity("cpu", raw));
    }
    let whole = match whole {
        "" if !fraction.is_empty() => 0,
        digits => digits
            .parse::<u32>()
            .map_err(|_| invalid_quantity("cpu", raw))?,
    };
    let fraction = match fraction {
        "" => 0,
        digits => format!("{digits:0<3}")
            .parse::<u32>()
            .map_err(|_| invalid_quantity("cpu", raw))?,
    };

    whole
        .checked_mul(1000)
        .and_then(|millis| millis.checked_add(fraction))
        .ok_or_else(|| invalid_quantity("cpu", raw))
}

/// Parse a memory quantity into MiB: `256Mi`, `1Gi`, `512Ki` or bytes.
/// Anything smaller than a MiB rounds up.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] for unknown suffixes, non-integers or
/// values that overflow.
pub fn parse_memory(raw: &str) -> Result<u32> {
    let (digits, unit): (&str, u64) = [("Gi", 1_073_741_824), ("Mi", BYTES_PER_MIB), ("Ki", 1024)]
        .into_iter()
        .find_map(|(suffix, unit)| raw.strip_suffix(suffix).map(|d| (d, unit)))
        .unwrap_or((raw, 1));

    let bytes = digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(unit))
        .ok_or_else(|| invalid_quantity("memory", raw))?;

    u32::try_from(bytes.div_ceil(BYTES_PER_MIB)).map_err(|_| invalid_quantity("memory", raw))
}
