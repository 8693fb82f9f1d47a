//! Result bundle assembly.
//!
//! A finished job leaves its artifacts in a per-job result directory. This
//! module walks that directory into an in-memory ZIP, optionally rewriting
//! the `.mmd` markdown-variant extension the inference process emits into a
//! conventional one. Content is never transformed, only the file name.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("result directory contains no files: {0}")]
    Empty(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

/// How `.mmd` result files are presented in the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// Keep the raw `.mmd` extension.
    #[default]
    Mmd,
    /// Rename `.mmd` to `.md`.
    Md,
    /// Rename `.mmd` to `.txt`.
    Txt,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mmd => "mmd",
            Self::Md => "md",
            Self::Txt => "txt",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mmd" => Ok(Self::Mmd),
            "md" | "markdown" => Ok(Self::Md),
            "txt" | "text" => Ok(Self::Txt),
            other => Err(format!("unknown export format: {other}")),
        }
    }
}

/// Suggested download file name for a job's bundle.
pub fn bundle_file_name(job_id: &str) -> String {
    format!("ocr_results_{job_id}.zip")
}

/// Zip every file under `result_dir` (recursively, relative paths preserved)
/// into an in-memory archive.
pub fn bundle(result_dir: &Path, format: ExportFormat) -> Result<Vec<u8>, PackageError> {
    let mut files = Vec::new();
    collect_files(result_dir, result_dir, &mut files)?;
    if files.is_empty() {
        return Err(PackageError::Empty(result_dir.to_path_buf()));
    }
    // Deterministic entry order regardless of directory iteration order.
    files.sort();

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for relative in &files {
        let entry_name = entry_name(relative, format);
        writer.start_file(entry_name, options)?;
        writer.write_all(&std::fs::read(result_dir.join(relative))?)?;
    }

    Ok(writer.finish()?.into_inner())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file()
            && let Ok(relative) = path.strip_prefix(root)
        {
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}

/// Archive entry name: forward slashes, `.mmd` rewritten per the requested
/// format.
fn entry_name(relative: &Path, format: ExportFormat) -> String {
    let mut path = relative.to_path_buf();
    if format != ExportFormat::Mmd
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mmd"))
    {
        path.set_extension(format.as_str());
    }
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
