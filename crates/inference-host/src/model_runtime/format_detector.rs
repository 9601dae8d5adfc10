//! Format detection from file signatures and directory layout.
//!
//! Every classifier inspects content (magic bytes, headers, manifests); the
//! extension only decides whether a failed signature means "not this format"
//! or "this format, but corrupt". Detection never loads anything.

use bytes::Buf;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::format::ModelFormat;
use super::quantization::Quantization;
use crate::error::{Error, Result};

const GGUF_MAGIC: &[u8] = b"GGUF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const PICKLE_PROTO: u8 = 0x80;
const MAX_SAFETENSORS_HEADER: u64 = 100 * 1024 * 1024;
const MAX_GGUF_COUNT: u64 = 1 << 20;

/// How strongly a classifier's evidence identifies the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specificity {
    /// Matched because suitable files are present in a directory.
    Listing,
    /// Matched a file signature.
    Signature,
    /// Matched a dedicated index or manifest file.
    Manifest,
}

/// A successful classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub format: ModelFormat,
    pub specificity: Specificity,
    /// File or directory the loader should open.
    pub entry: PathBuf,
    /// Exact parameter count when the headers declare it.
    pub parameter_count: Option<u64>,
    pub native_quantization: Quantization,
}

impl Detection {
    fn new(format: ModelFormat, specificity: Specificity, entry: &Path) -> Self {
        Self {
            format,
            specificity,
            entry: entry.to_path_buf(),
            parameter_count: None,
            native_quantization: format.default_quantization(),
        }
    }

    fn with_tensors(mut self, summary: TensorSummary) -> Self {
        self.parameter_count = Some(summary.parameters);
        self.native_quantization = summary.quantization;
        self
    }
}

#[derive(Debug)]
enum Verdict {
    NoMatch,
    Match(Detection),
    Corrupt(String),
}

pub struct FormatDetector;

impl FormatDetector {
    /// Classifies the artifact at `path`.
    ///
    /// `requested` wins when it is among the valid matches; otherwise the
    /// most specific match wins, with [`ModelFormat`] order breaking ties.
    pub fn detect(path: &Path, requested: Option<ModelFormat>) -> Result<Detection> {
        let metadata = fs::metadata(path)?;
        let mut matches = Vec::new();
        let mut corrupt = Vec::new();

        for format in ModelFormat::ALL {
            match Self::classify(format, path, metadata.is_dir())? {
                Verdict::Match(detection) => {
                    debug!(format = %format, specificity = ?detection.specificity, "Classifier matched");
                    matches.push(detection);
                }
                Verdict::Corrupt(reason) => {
                    debug!(format = %format, %reason, "Classifier rejected corrupt artifact");
                    corrupt.push((format, reason));
                }
                Verdict::NoMatch => {}
            }
        }

        if let Some(wanted) = requested {
            if let Some(pos) = matches.iter().position(|d| d.format == wanted) {
                let detection = matches.swap_remove(pos);
                info!("Detected model format: {} (requested) for: {}", wanted, path.display());
                return Ok(detection);
            }
            if let Some((format, reason)) = corrupt.iter().find(|(f, _)| *f == wanted) {
                return Err(Error::corrupt(path, format, reason.clone()));
            }
            warn!(
                "Requested format {} does not match artifact at {}, using detected format",
                wanted,
                path.display()
            );
        }

        let best = matches.into_iter().max_by(|a, b| {
            a.specificity
                .cmp(&b.specificity)
                .then_with(|| b.format.cmp(&a.format))
        });

        match (best, corrupt.into_iter().next()) {
            (Some(detection), _) => {
                info!("Detected model format: {} for: {}", detection.format, path.display());
                Ok(detection)
            }
            (None, Some((format, reason))) => Err(Error::corrupt(path, format, reason)),
            (None, None) => Err(Error::UnrecognizedFormat {
                path: path.display().to_string(),
            }),
        }
    }

    pub fn supported_extensions() -> Vec<&'static str> {
        ModelFormat::ALL
            .iter()
            .flat_map(|format| format.extensions().iter().copied())
            .collect()
    }

    fn classify(format: ModelFormat, path: &Path, is_dir: bool) -> io::Result<Verdict> {
        match (format, is_dir) {
            (ModelFormat::Gguf, false) => classify_gguf_file(path),
            (ModelFormat::Gguf, true) => classify_first_file(path, &["gguf"], classify_gguf_file),
            (ModelFormat::Safetensors, false) => classify_safetensors_file(path),
            (ModelFormat::Safetensors, true) => classify_safetensors_dir(path),
            (ModelFormat::Mlx, false) => classify_npz_file(path),
            (ModelFormat::Mlx, true) => classify_mlx_dir(path),
            (ModelFormat::CoreMl, false) => classify_mlmodel_file(path),
            (ModelFormat::CoreMl, true) => classify_coreml_dir(path),
            (ModelFormat::Onnx, false) => classify_onnx_file(path),
            (ModelFormat::Onnx, true) => classify_first_file(path, &["onnx"], classify_onnx_file),
            (ModelFormat::Checkpoint, false) => classify_checkpoint_file(path),
            (ModelFormat::Checkpoint, true) => classify_checkpoint_dir(path),
        }
    }
}

// ----- GGUF -----

fn classify_gguf_file(path: &Path) -> io::Result<Verdict> {
    let head = read_prefix(path, 24)?;
    if !head.starts_with(GGUF_MAGIC) {
        return Ok(Verdict::NoMatch);
    }
    if head.len() < 16 {
        return Ok(Verdict::Corrupt("truncated GGUF header".into()));
    }

    let mut buf = &head[4..];
    let version = buf.get_u32_le();
    let (tensors, kvs) = match version {
        1 => (buf.get_u32_le() as u64, buf.get_u32_le() as u64),
        2 | 3 if buf.remaining() >= 16 => (buf.get_u64_le(), buf.get_u64_le()),
        2 | 3 => return Ok(Verdict::Corrupt("truncated GGUF header".into())),
        other => return Ok(Verdict::Corrupt(format!("unsupported GGUF version {}", other))),
    };

    if tensors == 0 {
        return Ok(Verdict::Corrupt("GGUF header declares no tensors".into()));
    }
    if tensors > MAX_GGUF_COUNT || kvs > MAX_GGUF_COUNT {
        return Ok(Verdict::Corrupt(format!(
            "implausible GGUF header counts ({} tensors, {} metadata keys)",
            tensors, kvs
        )));
    }
    Ok(Verdict::Match(Detection::new(ModelFormat::Gguf, Specificity::Signature, path)))
}

// ----- Safetensors -----

#[derive(Debug, Clone, Copy, PartialEq)]
struct TensorSummary {
    parameters: u64,
    quantization: Quantization,
}

impl TensorSummary {
    fn merge(summaries: &[TensorSummary]) -> Option<TensorSummary> {
        let dominant = summaries.iter().max_by_key(|s| s.parameters)?;
        Some(TensorSummary {
            parameters: summaries.iter().map(|s| s.parameters).sum(),
            quantization: dominant.quantization,
        })
    }
}

/// `Ok(None)` when the bytes do not look like a safetensors file at all.
fn read_safetensors_header(path: &Path) -> io::Result<Option<std::result::Result<TensorSummary, String>>> {
    let file_len = fs::metadata(path)?.len();
    let head = read_prefix(path, 9)?;
    if head.len() < 9 {
        return Ok(None);
    }
    let header_len = (&head[..8]).get_u64_le();
    if header_len < 2
        || header_len > MAX_SAFETENSORS_HEADER
        || header_len > file_len.saturating_sub(8)
        || head[8] != b'{'
    {
        return Ok(None);
    }

    let mut file = File::open(path)?;
    let mut header = vec![0u8; 8 + header_len as usize];
    file.read_exact(&mut header)?;
    let parsed: serde_json::Map<String, Value> = match serde_json::from_slice(&header[8..]) {
        Ok(map) => map,
        Err(e) => return Ok(Some(Err(format!("invalid safetensors header: {}", e)))),
    };
    Ok(Some(summarize_tensors(&parsed)))
}

fn summarize_tensors(header: &serde_json::Map<String, Value>) -> std::result::Result<TensorSummary, String> {
    let mut parameters = 0u64;
    let mut by_dtype: Vec<(String, u64)> = Vec::new();

    for (name, info) in header.iter().filter(|(name, _)| name.as_str() != "__metadata__") {
        let dtype = info
            .get("dtype")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("tensor {} has no dtype", name))?;
        let shape = info
            .get("shape")
            .and_then(Value::as_array)
            .ok_or_else(|| format!("tensor {} has no shape", name))?;
        let mut elements = 1u64;
        for dim in shape {
            let dim = dim
                .as_u64()
                .ok_or_else(|| format!("tensor {} has a non-integer dimension", name))?;
            elements = elements.saturating_mul(dim);
        }
        // MLX packs eight 4-bit weights into each U32 element.
        if dtype == "U32" && name.ends_with(".weight") {
            elements = elements.saturating_mul(8);
        }
        parameters = parameters.saturating_add(elements);
        match by_dtype.iter_mut().find(|(d, _)| d == dtype) {
            Some((_, count)) => *count += elements,
            None => by_dtype.push((dtype.to_string(), elements)),
        }
    }

    if parameters == 0 {
        return Err("safetensors header lists no tensors".into());
    }
    let dominant = by_dtype
        .iter()
        .max_by_key(|(_, count)| *count)
        .map(|(dtype, _)| dtype.as_str())
        .unwrap_or("F16");
    let quantization = match dominant {
        "F64" | "F32" => Quantization::F32,
        "I8" | "U8" | "F8_E4M3" | "F8_E5M2" => Quantization::Q8_0,
        "U32" | "I32" => Quantization::Q4KM,
        _ => Quantization::F16,
    };
    Ok(TensorSummary { parameters, quantization })
}

fn classify_safetensors_file(path: &Path) -> io::Result<Verdict> {
    let claims = has_extension(path, &["safetensors"]);
    Ok(match read_safetensors_header(path)? {
        Some(Ok(summary)) => Verdict::Match(
            Detection::new(ModelFormat::Safetensors, Specificity::Signature, path).with_tensors(summary),
        ),
        Some(Err(reason)) => Verdict::Corrupt(reason),
        None if claims => Verdict::Corrupt("missing safetensors header".into()),
        None => Verdict::NoMatch,
    })
}

fn summarize_shards(shards: &[PathBuf]) -> io::Result<std::result::Result<TensorSummary, String>> {
    let mut summaries = Vec::with_capacity(shards.len());
    for shard in shards {
        match read_safetensors_header(shard)? {
            Some(Ok(summary)) => summaries.push(summary),
            Some(Err(reason)) => return Ok(Err(format!("{}: {}", shard.display(), reason))),
            None => return Ok(Err(format!("{}: missing safetensors header", shard.display()))),
        }
    }
    Ok(TensorSummary::merge(&summaries).ok_or_else(|| "no safetensors shards".to_string()))
}

fn classify_safetensors_dir(dir: &Path) -> io::Result<Verdict> {
    let index = dir.join("model.safetensors.index.json");
    if index.is_file() {
        let shards = match manifest_shards(&index, dir) {
            Ok(shards) => shards,
            Err(reason) => return Ok(Verdict::Corrupt(reason)),
        };
        return Ok(match summarize_shards(&shards)? {
            Ok(summary) => Verdict::Match(
                Detection::new(ModelFormat::Safetensors, Specificity::Manifest, dir).with_tensors(summary),
            ),
            Err(reason) => Verdict::Corrupt(reason),
        });
    }

    let shards = files_with_extension(dir, &["safetensors"])?;
    if shards.is_empty() {
        return Ok(Verdict::NoMatch);
    }
    Ok(match summarize_shards(&shards)? {
        Ok(summary) => Verdict::Match(
            Detection::new(ModelFormat::Safetensors, Specificity::Listing, dir).with_tensors(summary),
        ),
        Err(reason) => Verdict::Corrupt(reason),
    })
}

/// Reads a Hugging Face style `weight_map` index and checks every shard exists.
fn manifest_shards(index: &Path, dir: &Path) -> std::result::Result<Vec<PathBuf>, String> {
    let raw = fs::read(index).map_err(|e| format!("unreadable index {}: {}", index.display(), e))?;
    let parsed: Value =
        serde_json::from_slice(&raw).map_err(|e| format!("invalid index {}: {}", index.display(), e))?;
    let weight_map = parsed
        .get("weight_map")
        .and_then(Value::as_object)
        .ok_or_else(|| format!("index {} has no weight_map", index.display()))?;

    let mut shards: Vec<PathBuf> = weight_map
        .values()
        .filter_map(Value::as_str)
        .map(|name| dir.join(name))
        .collect();
    shards.sort();
    shards.dedup();
    if shards.is_empty() {
        return Err(format!("index {} references no shards", index.display()));
    }
    if let Some(missing) = shards.iter().find(|s| !s.is_file()) {
        return Err(format!("missing shard {}", missing.display()));
    }
    Ok(shards)
}

// ----- MLX -----

fn classify_npz_file(path: &Path) -> io::Result<Verdict> {
    let claims = has_extension(path, &["npz"]);
    let head = read_prefix(path, 4)?;
    if !head.starts_with(ZIP_MAGIC) {
        return Ok(if claims {
            Verdict::Corrupt("npz file is not a zip archive".into())
        } else {
            Verdict::NoMatch
        });
    }
    Ok(match zip_entry_names(path) {
        Ok(names) if names.iter().any(|n| n.ends_with(".npy")) => {
            Verdict::Match(Detection::new(ModelFormat::Mlx, Specificity::Signature, path))
        }
        Ok(_) if claims => Verdict::Corrupt("npz archive holds no .npy arrays".into()),
        Err(reason) if claims => Verdict::Corrupt(reason),
        _ => Verdict::NoMatch,
    })
}

fn classify_mlx_dir(dir: &Path) -> io::Result<Verdict> {
    let npz = dir.join("weights.npz");
    let config = read_json(&dir.join("config.json"));
    let quantization = config
        .as_ref()
        .and_then(|c| c.get("quantization"))
        .and_then(Value::as_object)
        .map(|q| match q.get("bits").and_then(Value::as_u64) {
            Some(2) => Quantization::Q2K,
            Some(3) => Quantization::Q3KM,
            Some(4) => Quantization::Q4KM,
            Some(6) => Quantization::Q6K,
            Some(8) => Quantization::Q8_0,
            _ => Quantization::F16,
        });

    if let Some(quantization) = quantization {
        let shards = files_with_extension(dir, &["safetensors"])?;
        if !shards.is_empty() {
            return Ok(match summarize_shards(&shards)? {
                Ok(summary) => Verdict::Match(
                    Detection::new(ModelFormat::Mlx, Specificity::Manifest, dir).with_tensors(TensorSummary {
                        parameters: summary.parameters,
                        quantization,
                    }),
                ),
                Err(reason) => Verdict::Corrupt(reason),
            });
        }
        if npz.is_file() {
            return Ok(match classify_npz_file(&npz)? {
                Verdict::Match(d) => Verdict::Match(Detection {
                    specificity: Specificity::Manifest,
                    entry: dir.to_path_buf(),
                    native_quantization: quantization,
                    ..d
                }),
                other => other,
            });
        }
        return Ok(Verdict::Corrupt("config declares MLX quantization but no weights are present".into()));
    }

    if npz.is_file() {
        return Ok(match classify_npz_file(&npz)? {
            Verdict::Match(d) => Verdict::Match(Detection {
                entry: dir.to_path_buf(),
                ..d
            }),
            other => other,
        });
    }
    Ok(Verdict::NoMatch)
}

// ----- Core ML -----

fn classify_mlmodel_file(path: &Path) -> io::Result<Verdict> {
    if !has_extension(path, &["mlmodel"]) {
        return Ok(Verdict::NoMatch);
    }
    // Field 1 (specificationVersion) as a varint.
    let head = read_prefix(path, 1)?;
    Ok(if head.first() == Some(&0x08) {
        Verdict::Match(Detection::new(ModelFormat::CoreMl, Specificity::Signature, path))
    } else {
        Verdict::Corrupt("mlmodel does not start with a specification version".into())
    })
}

fn classify_coreml_dir(dir: &Path) -> io::Result<Verdict> {
    if has_extension(dir, &["mlmodelc"]) {
        return Ok(if dir.join("coremldata.bin").is_file() {
            Verdict::Match(Detection::new(ModelFormat::CoreMl, Specificity::Signature, dir))
        } else {
            Verdict::Corrupt("compiled model is missing coremldata.bin".into())
        });
    }

    let is_package = has_extension(dir, &["mlpackage"]);
    let manifest = dir.join("Manifest.json");
    if !manifest.is_file() {
        return Ok(if is_package {
            Verdict::Corrupt("mlpackage is missing Manifest.json".into())
        } else {
            Verdict::NoMatch
        });
    }

    match read_json(&manifest) {
        Some(m) if m.get("itemInfoEntries").map_or(false, Value::is_object) => Ok(Verdict::Match(
            Detection::new(ModelFormat::CoreMl, Specificity::Manifest, dir),
        )),
        _ if is_package => Ok(Verdict::Corrupt("Manifest.json has no itemInfoEntries".into())),
        _ => Ok(Verdict::NoMatch),
    }
}

// ----- ONNX -----

fn classify_onnx_file(path: &Path) -> io::Result<Verdict> {
    if !has_extension(path, &["onnx"]) {
        return Ok(Verdict::NoMatch);
    }
    // ModelProto field 1 is ir_version, a small varint.
    let head = read_prefix(path, 2)?;
    Ok(match head.as_slice() {
        [0x08, version, ..] if (1..=20).contains(version) => {
            Verdict::Match(Detection::new(ModelFormat::Onnx, Specificity::Signature, path))
        }
        _ => Verdict::Corrupt("ONNX graph has no ir_version field".into()),
    })
}

// ----- PyTorch checkpoints -----

fn classify_checkpoint_file(path: &Path) -> io::Result<Verdict> {
    if !has_extension(path, &["pt", "pth", "bin", "ckpt"]) {
        return Ok(Verdict::NoMatch);
    }
    let head = read_prefix(path, 4)?;
    if head.starts_with(ZIP_MAGIC) {
        return Ok(match zip_entry_names(path) {
            Ok(names) if names.iter().any(|n| n.ends_with("data.pkl")) => {
                Verdict::Match(Detection::new(ModelFormat::Checkpoint, Specificity::Signature, path))
            }
            Ok(_) => Verdict::Corrupt("checkpoint archive has no data.pkl record".into()),
            Err(reason) => Verdict::Corrupt(reason),
        });
    }
    if let [PICKLE_PROTO, proto, ..] = head.as_slice() {
        if (2..=5).contains(proto) {
            return Ok(Verdict::Match(Detection::new(
                ModelFormat::Checkpoint,
                Specificity::Signature,
                path,
            )));
        }
    }
    // `.bin` is too generic to claim on its own.
    Ok(if has_extension(path, &["bin"]) {
        Verdict::NoMatch
    } else {
        Verdict::Corrupt("checkpoint is neither a zip archive nor a pickle stream".into())
    })
}

fn classify_checkpoint_dir(dir: &Path) -> io::Result<Verdict> {
    let index = dir.join("pytorch_model.bin.index.json");
    if index.is_file() {
        let shards = match manifest_shards(&index, dir) {
            Ok(shards) => shards,
            Err(reason) => return Ok(Verdict::Corrupt(reason)),
        };
        for shard in &shards {
            if let Verdict::Corrupt(reason) = classify_checkpoint_file(shard)? {
                return Ok(Verdict::Corrupt(format!("{}: {}", shard.display(), reason)));
            }
        }
        return Ok(Verdict::Match(Detection::new(ModelFormat::Checkpoint, Specificity::Manifest, dir)));
    }

    let weights = dir.join("pytorch_model.bin");
    let candidate = if weights.is_file() {
        Some(weights)
    } else {
        files_with_extension(dir, &["pt", "pth", "ckpt"])?.into_iter().next()
    };
    let Some(candidate) = candidate else {
        return Ok(Verdict::NoMatch);
    };
    Ok(match classify_checkpoint_file(&candidate)? {
        Verdict::Match(_) => Verdict::Match(Detection::new(ModelFormat::Checkpoint, Specificity::Listing, dir)),
        Verdict::NoMatch => Verdict::Corrupt(format!(
            "{} is neither a zip archive nor a pickle stream",
            candidate.display()
        )),
        corrupt => corrupt,
    })
}

// ----- helpers -----

fn classify_first_file(
    dir: &Path,
    extensions: &[&str],
    classify: fn(&Path) -> io::Result<Verdict>,
) -> io::Result<Verdict> {
    let Some(first) = files_with_extension(dir, extensions)?.into_iter().next() else {
        return Ok(Verdict::NoMatch);
    };
    Ok(match classify(&first)? {
        Verdict::Match(d) => Verdict::Match(Detection {
            specificity: Specificity::Listing,
            ..d
        }),
        other => other,
    })
}

fn read_prefix(path: &Path, len: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len as usize);
    File::open(path)?.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .map_or(false, |e| extensions.contains(&e.as_str()))
}

/// Regular files directly inside `dir` with one of `extensions`, sorted by name.
fn files_with_extension(dir: &Path, extensions: &[&str]) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_extension(p, extensions))
        .collect();
    files.sort();
    Ok(files)
}

fn zip_entry_names(path: &Path) -> std::result::Result<Vec<String>, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let archive = zip::ZipArchive::new(file).map_err(|e| format!("unreadable zip archive: {}", e))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Total size of a file, or of every file below a directory. Links to files
/// count at their target size; links to directories are not followed, so a
/// link cycle cannot recurse forever.
pub fn artifact_size(path: &Path) -> io::Result<u64> {
    let metadata = fs::metadata(path)?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    directory_size(path)
}

fn directory_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let metadata = fs::symlink_metadata(&path)?;
        if metadata.is_dir() {
            total += directory_size(&path)?;
        } else if metadata.is_symlink() {
            match fs::metadata(&path) {
                Ok(target) if target.is_file() => total += target.len(),
                Ok(_) => debug!(path = %path.display(), "Skipping linked directory"),
                Err(e) => warn!(path = %path.display(), "Skipping dangling link: {}", e),
            }
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}
