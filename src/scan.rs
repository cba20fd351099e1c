//! Input walking and per-class transformation.
//!
//! This is the host-driver side of the instrumenter: it finds class files in
//! directories, single files, or JARs, feeds each through the synthesizer,
//! verifies the rewritten bytes parse again, and writes the result tree.
//! Instrumented output is always an exploded directory of `.class` files,
//! also for JAR inputs.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::classfile::{CLASS_MAGIC, PoolEditor, read_u16, read_u32};
use crate::instrument::{InstrumentOptions, instrument_class};

/// One scan invocation's configuration.
pub(crate) struct ScanOptions {
    pub(crate) instrument: InstrumentOptions,
    /// Internal-name prefix selecting which classes are transformed.
    pub(crate) prefix: String,
    pub(crate) output: PathBuf,
    /// Optional diagnostic copy of every rewritten class.
    pub(crate) dump_dir: Option<PathBuf>,
}

/// Counters reported after a scan.
#[derive(Debug, Default, Serialize)]
pub(crate) struct ScanSummary {
    pub(crate) classes_seen: usize,
    pub(crate) classes_instrumented: usize,
    pub(crate) classes_copied: usize,
    pub(crate) methods_instrumented: usize,
    pub(crate) methods_skipped: usize,
}

/// Transform every class reachable from `input` and write the output tree.
pub(crate) fn scan_input(input: &Path, options: &ScanOptions) -> Result<ScanSummary> {
    let entries = collect_entries(input)?;
    info!(classes = entries.len(), "transforming");

    let results: Vec<ClassResult> = entries
        .into_par_iter()
        .map(|entry| process_class(entry, options))
        .collect::<Result<Vec<_>>>()?;

    let mut summary = ScanSummary::default();
    for result in &results {
        summary.classes_seen += 1;
        if result.instrumented {
            summary.classes_instrumented += 1;
        } else {
            summary.classes_copied += 1;
        }
        summary.methods_instrumented += result.methods_instrumented;
        summary.methods_skipped += result.methods_skipped;
    }

    for result in results {
        let target = options.output.join(&result.relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output directory {}", parent.display()))?;
        }
        fs::write(&target, &result.bytes)
            .with_context(|| format!("write {}", target.display()))?;
    }
    Ok(summary)
}

/// A class file queued for transformation, keyed by its output-relative path.
struct ClassEntry {
    relative_path: String,
    data: Vec<u8>,
}

struct ClassResult {
    relative_path: String,
    bytes: Vec<u8>,
    instrumented: bool,
    methods_instrumented: usize,
    methods_skipped: usize,
}

fn collect_entries(input: &Path) -> Result<Vec<ClassEntry>> {
    if input.is_dir() {
        let mut entries = Vec::new();
        collect_dir(input, input, &mut entries)?;
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        return Ok(entries);
    }
    let extension = input.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" => {
            let data =
                fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
            let file_name = input
                .file_name()
                .context("input has no file name")?
                .to_string_lossy()
                .to_string();
            Ok(vec![ClassEntry {
                relative_path: file_name,
                data,
            }])
        }
        "jar" => collect_jar(input),
        _ => anyhow::bail!("unsupported input file: {}", input.display()),
    }
}

fn collect_dir(root: &Path, dir: &Path, entries: &mut Vec<ClassEntry>) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_dir(root, &path, entries)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("class") {
            let data =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let relative_path = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            entries.push(ClassEntry {
                relative_path,
                data,
            });
        }
    }
    Ok(())
}

fn collect_jar(path: &Path) -> Result<Vec<ClassEntry>> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class")
            && !name.ends_with("module-info.class")
            && !name.starts_with("META-INF/versions/")
        {
            entry_names.push(name);
        }
    }
    entry_names.sort();

    let mut entries = Vec::with_capacity(entry_names.len());
    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        entries.push(ClassEntry {
            relative_path: name,
            data,
        });
    }
    Ok(entries)
}

fn process_class(entry: ClassEntry, options: &ScanOptions) -> Result<ClassResult> {
    let name = peek_class_name(&entry.data)
        .with_context(|| format!("read class name of {}", entry.relative_path))?;
    if !name.starts_with(&options.prefix) {
        return Ok(ClassResult {
            relative_path: entry.relative_path,
            bytes: entry.data,
            instrumented: false,
            methods_instrumented: 0,
            methods_skipped: 0,
        });
    }

    let outcome = instrument_class(&entry.data, &options.instrument)
        .with_context(|| format!("transform {name}"))?;
    let class_name = outcome.class_name;
    let Some(bytes) = outcome.bytes else {
        return Ok(ClassResult {
            relative_path: entry.relative_path,
            bytes: entry.data,
            instrumented: false,
            methods_instrumented: 0,
            methods_skipped: outcome.methods_skipped,
        });
    };

    // The rewritten container must still parse; a class that does not is a
    // fatal error rather than a best-effort emit.
    class_file::parse(&bytes).with_context(|| {
        format!("rewritten class {class_name} failed structural verification")
    })?;

    if let Some(dump_dir) = &options.dump_dir {
        if let Err(error) = dump_class(dump_dir, &entry.relative_path, &bytes) {
            warn!(class = %class_name, error = %error, "failed to dump rewritten class");
        }
    }

    Ok(ClassResult {
        relative_path: entry.relative_path,
        bytes,
        instrumented: true,
        methods_instrumented: outcome.methods_instrumented,
        methods_skipped: outcome.methods_skipped,
    })
}

fn dump_class(dump_dir: &Path, relative_path: &str, bytes: &[u8]) -> Result<()> {
    let target = dump_dir.join(relative_path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dump directory {}", parent.display()))?;
    }
    fs::write(&target, bytes).with_context(|| format!("write {}", target.display()))
}

/// Read just enough of a class file to learn its internal name.
fn peek_class_name(data: &[u8]) -> Result<String> {
    let mut offset = 0usize;
    if read_u32(data, &mut offset)? != CLASS_MAGIC {
        anyhow::bail!("invalid class file magic");
    }
    read_u16(data, &mut offset)?;
    read_u16(data, &mut offset)?;
    let pool = PoolEditor::parse(data, &mut offset).context("parse constant pool")?;
    let _access_flags = read_u16(data, &mut offset)?;
    let this_class = read_u16(data, &mut offset)?;
    pool.class_name_at(this_class)
        .context("resolve this_class name")
}
