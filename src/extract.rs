use crate::error::{Error, IoResultExt, Result};
use filetime::{set_file_mtime, FileTime};
use flate2::read::GzDecoder;
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use walkdir::WalkDir;

/// Removes a scratch directory on drop unless disarmed.
pub struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// The unpacked tree of one archive. Temporary trees are deleted when this is
/// dropped; plain directories handed in as "archives" are left alone.
pub struct ExtractedArchive {
    root: PathBuf,
    label: String,
    _guard: Option<StagingGuard>,
}

impl ExtractedArchive {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File stem of the archive, before any name cleaning.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn borrowed(root: PathBuf) -> Self {
        let label = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            root,
            label,
            _guard: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractProgress {
    pub archive: PathBuf,
    pub files: usize,
}

pub type ExtractProgressCallback = Arc<dyn Fn(ExtractProgress) + Send + Sync>;

/// Unpacks a mod archive into a temporary tree.
pub trait Extractor: Send + Sync {
    fn extract(&self, archive: &Path) -> Result<ExtractedArchive>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    SevenZip,
    Rar,
    Tar,
    TarGz,
    Directory,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(ArchiveKind::Directory);
        }
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Some(ArchiveKind::TarGz);
        }
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "zip" => Some(ArchiveKind::Zip),
            "7z" => Some(ArchiveKind::SevenZip),
            "rar" => Some(ArchiveKind::Rar),
            "tar" => Some(ArchiveKind::Tar),
            _ => None,
        }
    }
}

/// Default extractor: zip, tar and tar.gz in-process, 7z through the external
/// `7z` tool when installed with an in-process fallback, rar only through `7z`.
pub struct ArchiveExtractor {
    tmp_root: PathBuf,
    use_external: bool,
    progress: Option<ExtractProgressCallback>,
}

impl ArchiveExtractor {
    pub fn new(tmp_root: PathBuf) -> Self {
        Self {
            tmp_root,
            use_external: true,
            progress: None,
        }
    }

    pub fn without_external_tool(mut self) -> Self {
        self.use_external = false;
        self
    }

    pub fn with_progress(mut self, progress: ExtractProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, archive: &Path, files: usize) {
        if let Some(progress) = &self.progress {
            progress(ExtractProgress {
                archive: archive.to_path_buf(),
                files,
            });
        }
    }
}

impl Extractor for ArchiveExtractor {
    fn extract(&self, archive: &Path) -> Result<ExtractedArchive> {
        let kind = ArchiveKind::detect(archive).ok_or_else(|| Error::Extraction {
            archive: archive.to_path_buf(),
            reason: "unsupported archive type".to_string(),
        })?;
        if kind == ArchiveKind::Directory {
            return Ok(ExtractedArchive::borrowed(archive.to_path_buf()));
        }
        if !archive.is_file() {
            return Err(Error::Extraction {
                archive: archive.to_path_buf(),
                reason: "archive not found".to_string(),
            });
        }

        let dest = make_temp_dir(&self.tmp_root, "extract")?;
        let guard = StagingGuard::new(dest.clone());
        tracing::info!(archive = %archive.display(), ?kind, "extracting");

        match kind {
            ArchiveKind::Zip => self.extract_zip(archive, &dest)?,
            ArchiveKind::SevenZip => {
                if !self.use_external || extract_with_7z(archive, &dest)?.is_none() {
                    sevenz_rust::decompress_file(archive, &dest).map_err(|err| {
                        Error::Extraction {
                            archive: archive.to_path_buf(),
                            reason: err.to_string(),
                        }
                    })?;
                }
            }
            ArchiveKind::Rar => {
                if !self.use_external || extract_with_7z(archive, &dest)?.is_none() {
                    return Err(Error::Extraction {
                        archive: archive.to_path_buf(),
                        reason: "rar archives need the external 7z tool".to_string(),
                    });
                }
            }
            ArchiveKind::Tar => {
                let file = fs::File::open(archive).io_ctx("open archive", archive)?;
                unpack_tar(archive, tar::Archive::new(file), &dest)?;
            }
            ArchiveKind::TarGz => {
                let file = fs::File::open(archive).io_ctx("open archive", archive)?;
                unpack_tar(archive, tar::Archive::new(GzDecoder::new(file)), &dest)?;
            }
            ArchiveKind::Directory => {}
        }

        let files = count_files(&dest);
        self.report(archive, files);
        tracing::debug!(archive = %archive.display(), files, "extracted");

        let label = archive_stem(archive);
        Ok(ExtractedArchive {
            root: dest,
            label,
            _guard: Some(guard),
        })
    }
}

impl ArchiveExtractor {
    fn extract_zip(&self, path: &Path, dest: &Path) -> Result<()> {
        let corrupt = |reason: String| Error::Extraction {
            archive: path.to_path_buf(),
            reason,
        };
        let file = fs::File::open(path).io_ctx("open archive", path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|err| corrupt(err.to_string()))?;

        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|err| corrupt(err.to_string()))?;
            let Some(out_path) = file.enclosed_name() else {
                tracing::warn!(entry = file.name(), "skipping zip entry outside archive root");
                continue;
            };

            let out_path = dest.join(out_path);
            if file.is_dir() {
                fs::create_dir_all(&out_path).io_ctx("create dir", &out_path)?;
                continue;
            }

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).io_ctx("create dir", parent)?;
            }

            let mut out_file = fs::File::create(&out_path).io_ctx("create", &out_path)?;
            io::copy(&mut file, &mut out_file).map_err(|err| corrupt(err.to_string()))?;
            if let Some(mtime) = file.last_modified().and_then(zip_time_to_unix) {
                let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
            }
        }
        Ok(())
    }
}

fn unpack_tar<R: io::Read>(path: &Path, mut archive: tar::Archive<R>, dest: &Path) -> Result<()> {
    archive.set_preserve_mtime(true);
    archive.unpack(dest).map_err(|err| Error::Extraction {
        archive: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
}

/// Runs `7z x`. `Ok(None)` means the tool is not installed.
fn extract_with_7z(path: &Path, dest: &Path) -> Result<Option<()>> {
    let output = Command::new("7z")
        .arg("x")
        .arg("-y")
        .arg("-mmt=on")
        .arg(format!("-o{}", dest.display()))
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).io_ctx("launch 7z for", path),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Extraction {
            archive: path.to_path_buf(),
            reason: format!("7z failed: {}", stderr.trim()),
        });
    }
    Ok(Some(()))
}

fn count_files(root: &Path) -> usize {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

pub fn archive_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = name.to_lowercase();
    for suffix in [".tar.gz", ".tgz", ".zip", ".7z", ".rar", ".tar"] {
        if lower.ends_with(suffix) {
            return name[..name.len() - suffix.len()].to_string();
        }
    }
    name
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn make_temp_dir(tmp_root: &Path, suffix: &str) -> Result<PathBuf> {
    fs::create_dir_all(tmp_root).io_ctx("create temp root", tmp_root)?;

    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = tmp_root.join(format!("{suffix}-{nanos}-{counter}"));
    fs::create_dir_all(&dir).io_ctx("create temp dir", &dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn zip_extracts_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("Cool Mod-1234-1-0.zip");
        write_zip(
            &archive,
            &[("textures/a.dds", b"aaa"), ("meshes/b.nif", b"bb")],
        );

        let extractor = ArchiveExtractor::new(temp.path().join("tmp")).without_external_tool();
        let root = {
            let extracted = extractor.extract(&archive).unwrap();
            assert_eq!(extracted.label(), "Cool Mod-1234-1-0");
            assert_eq!(
                fs::read(extracted.root().join("textures/a.dds")).unwrap(),
                b"aaa"
            );
            extracted.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn tar_gz_extracts() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("m.tar.gz");
        {
            let file = fs::File::create(&archive).unwrap();
            let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(enc);
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "Data/readme.txt", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let extractor = ArchiveExtractor::new(temp.path().join("tmp"));
        let extracted = extractor.extract(&archive).unwrap();
        assert_eq!(
            fs::read(extracted.root().join("Data/readme.txt")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn corrupt_zip_is_extraction_error() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("bad.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();
        let extractor = ArchiveExtractor::new(temp.path().join("tmp")).without_external_tool();
        let err = extractor.extract(&archive).err().unwrap();
        assert!(matches!(err, Error::Extraction { .. }));
    }

    #[test]
    fn unknown_extension_rejected() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("mod.exe");
        fs::write(&archive, b"MZ").unwrap();
        let extractor = ArchiveExtractor::new(temp.path().join("tmp"));
        assert!(matches!(
            extractor.extract(&archive),
            Err(Error::Extraction { .. })
        ));
    }

    #[test]
    fn directories_are_borrowed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("loose");
        fs::create_dir_all(&dir).unwrap();
        let extractor = ArchiveExtractor::new(temp.path().join("tmp"));
        drop(extractor.extract(&dir).unwrap());
        assert!(dir.exists());
    }
}
