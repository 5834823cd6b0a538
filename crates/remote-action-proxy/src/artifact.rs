// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local artifact handling: extraction, compilation and packaging.
//!
//! Every init extracts the action into a fresh numbered directory under the
//! action base directory:
//!
//! ```text
//! <base>/<n>/src/exec      extracted payload (or unpacked zip contents)
//! <base>/<n>/bin/exec      runnable artifact after compile or rename
//! <base>/<n>/bin/action.zip  archive shipped to the remote node
//! ```

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Name of the runnable file inside `src/` and `bin/`.
pub const EXEC_NAME: &str = "exec";

/// Name of the archive shipped to the remote node.
pub const ARCHIVE_NAME: &str = "action.zip";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Errors from extracting, compiling or packaging an action.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArtifactError {
    /// The payload could not be written or unpacked.
    #[error("cannot extract action: {0}")]
    Extraction(String),

    /// Extraction produced no file name.
    #[error("empty filename")]
    EmptyArtifact,

    /// The compiler ran and reported failure.
    #[error("{0}")]
    CompileFailed(String),

    /// The compiler claimed success but the expected executable is missing.
    #[error("cannot compile: {} was not produced", .0.display())]
    CompileOutputMissing(PathBuf),

    /// The artifact tree could not be archived.
    #[error("cannot package action: {0}")]
    Package(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for artifact operations.
pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Writes a raw code payload to disk.
pub trait Extractor: Send + Sync {
    /// Extract `payload` into a fresh directory named `target` and return the
    /// path of the extracted entry file.
    fn extract(&self, payload: &[u8], target: &str) -> Result<PathBuf>;
}

/// Compiles an extracted source tree into `bin/exec`.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile `main` from `src_dir` into `bin_dir`.
    async fn compile(&self, main: &str, src_dir: &Path, bin_dir: &Path) -> Result<()>;
}

/// [`Extractor`] writing into numbered directories under a base directory.
#[derive(Debug)]
pub struct ActionExtractor {
    base_dir: PathBuf,
    current_dir: AtomicU32,
}

impl ActionExtractor {
    /// Create an extractor, continuing after the highest numbered directory
    /// already present in `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let highest = highest_numbered_dir(&base_dir);
        Self {
            base_dir,
            current_dir: AtomicU32::new(highest),
        }
    }

    /// The base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Number of the most recently allocated directory (0 before the first).
    pub fn current_dir(&self) -> u32 {
        self.current_dir.load(Ordering::SeqCst)
    }
}

impl Extractor for ActionExtractor {
    fn extract(&self, payload: &[u8], target: &str) -> Result<PathBuf> {
        let n = self.current_dir.fetch_add(1, Ordering::SeqCst) + 1;
        let dir = self.base_dir.join(n.to_string()).join(target);
        fs::create_dir_all(&dir)?;
        let file = dir.join(EXEC_NAME);

        if payload.starts_with(ZIP_MAGIC) {
            debug!(dir = %dir.display(), "Extracting zip payload");
            let mut archive = ZipArchive::new(Cursor::new(payload))
                .map_err(|e| ArtifactError::Extraction(format!("invalid zip: {}", e)))?;
            archive
                .extract(&dir)
                .map_err(|e| ArtifactError::Extraction(format!("cannot unzip: {}", e)))?;
        } else {
            debug!(file = %file.display(), bytes = payload.len(), "Writing plain payload");
            fs::write(&file, payload)?;
            set_mode(&file, 0o755)?;
        }

        Ok(file)
    }
}

/// [`Compiler`] running an external program as `<program> <main> <src> <bin>`.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: String,
}

impl CommandCompiler {
    /// Create a compiler invoking `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn compile(&self, main: &str, src_dir: &Path, bin_dir: &Path) -> Result<()> {
        info!(compiler = %self.program, main = %main, src = %src_dir.display(), "Compiling action");

        let output = tokio::process::Command::new(&self.program)
            .arg(main)
            .arg(src_dir)
            .arg(bin_dir)
            .output()
            .await
            .map_err(|e| {
                ArtifactError::CompileFailed(format!("cannot run compiler {}: {}", self.program, e))
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();
        if !combined.is_empty() {
            debug!(output = %combined, "Compiler output");
        }

        if output.status.success() {
            Ok(())
        } else if combined.is_empty() {
            Err(ArtifactError::CompileFailed(format!(
                "compiler exited with {}",
                output.status
            )))
        } else {
            Err(ArtifactError::CompileFailed(combined))
        }
    }
}

/// Directory layout of one extracted action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    /// `<base>/<n>`
    pub root: PathBuf,
    /// `<base>/<n>/src`
    pub src_dir: PathBuf,
    /// `<base>/<n>/bin`
    pub bin_dir: PathBuf,
    /// `<base>/<n>/bin/exec`
    pub binary: PathBuf,
}

impl ArtifactLayout {
    /// Derive the layout from the extracted entry file (`<root>/src/exec`).
    pub fn from_extracted(file: &Path) -> Result<Self> {
        let root = file
            .parent()
            .and_then(Path::parent)
            .ok_or(ArtifactError::EmptyArtifact)?;
        Ok(Self::at_root(root))
    }

    /// Derive the layout from the runnable artifact (`<root>/bin/exec`).
    pub fn from_binary(binary: &Path) -> Result<Self> {
        Self::from_extracted(binary)
    }

    fn at_root(root: &Path) -> Self {
        let bin_dir = root.join("bin");
        Self {
            root: root.to_path_buf(),
            src_dir: root.join("src"),
            binary: bin_dir.join(EXEC_NAME),
            bin_dir,
        }
    }

    /// Local path of the archive shipped to the node.
    pub fn archive_path(&self) -> PathBuf {
        self.bin_dir.join(ARCHIVE_NAME)
    }

    /// The last two components of the root (`<base name>/<n>`), used as the
    /// remote directory relative to the remote user's home.
    pub fn remote_root(&self) -> Result<String> {
        let mut components = self
            .root
            .components()
            .rev()
            .filter_map(|c| match c {
                std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            });
        let leaf = components.next();
        let parent = components.next();
        match (parent, leaf) {
            (Some(parent), Some(leaf)) => Ok(format!("{}/{}", parent, leaf)),
            _ => Err(ArtifactError::Package(format!(
                "artifact root {} has fewer than two path components",
                self.root.display()
            ))),
        }
    }
}

/// Turn a code payload into a runnable artifact and return `bin/exec`.
///
/// Without a compiler, or when the payload is already a native executable,
/// `src` is renamed to `bin`. Otherwise the compiler runs and the presence of
/// `bin/exec` is checked independently of what the compiler reported.
pub async fn extract_and_compile(
    extractor: Arc<dyn Extractor>,
    compiler: Option<Arc<dyn Compiler>>,
    payload: Vec<u8>,
    main: &str,
) -> Result<PathBuf> {
    let file = tokio::task::spawn_blocking(move || extractor.extract(&payload, "src"))
        .await
        .map_err(|e| ArtifactError::Extraction(format!("extraction task failed: {}", e)))??;

    if file.as_os_str().is_empty() {
        return Err(ArtifactError::EmptyArtifact);
    }

    let layout = ArtifactLayout::from_extracted(&file)?;

    let compiler = match compiler {
        Some(compiler) if !is_native_executable(&file) => compiler,
        _ => {
            debug!(src = %layout.src_dir.display(), "No compilation needed, moving src to bin");
            fs::rename(&layout.src_dir, &layout.bin_dir)?;
            return Ok(layout.binary);
        }
    };

    fs::create_dir_all(&layout.bin_dir)?;
    compiler
        .compile(main, &layout.src_dir, &layout.bin_dir)
        .await?;

    if !layout.binary.is_file() {
        return Err(ArtifactError::CompileOutputMissing(layout.binary));
    }
    Ok(layout.binary)
}

/// Whether `path` starts with an ELF, Mach-O or PE magic number.
pub fn is_native_executable(path: &Path) -> bool {
    let mut header = [0u8; 4];
    let read = fs::File::open(path).and_then(|mut f| f.read_exact(&mut header));
    if read.is_err() {
        return false;
    }
    matches!(
        header,
        [0x7f, b'E', b'L', b'F']
            | [0xfe, 0xed, 0xfa, 0xce]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xcf, 0xfa, 0xed, 0xfe]
            | [0xca, 0xfe, 0xba, 0xbe]
    ) || header.starts_with(b"MZ")
}

/// Archive the whole artifact root into [`ArtifactLayout::archive_path`].
///
/// The archive is built in memory first so it never contains itself; unix
/// permissions are kept so `bin/exec` stays executable after unpacking.
/// Returns the archive size in bytes.
pub fn package_archive(layout: &ArtifactLayout) -> Result<u64> {
    let archive_path = layout.archive_path();
    let mut entries = Vec::new();
    collect_entries(&layout.root, &layout.root, &archive_path, &mut entries)?;
    entries.sort();

    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        for relative in &entries {
            let full = layout.root.join(relative);
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(file_mode(&full)?);

            if full.is_dir() {
                zip.add_directory(name, options)
                    .map_err(|e| ArtifactError::Package(e.to_string()))?;
            } else {
                zip.start_file(name, options)
                    .map_err(|e| ArtifactError::Package(e.to_string()))?;
                zip.write_all(&fs::read(&full)?)?;
            }
        }
        zip.finish()
            .map_err(|e| ArtifactError::Package(e.to_string()))?;
    }

    let bytes = buffer.into_inner();
    fs::write(&archive_path, &bytes)?;
    debug!(archive = %archive_path.display(), bytes = bytes.len(), entries = entries.len(), "Packaged action");
    Ok(bytes.len() as u64)
}

fn collect_entries(root: &Path, dir: &Path, skip: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path == skip {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map_err(|e| ArtifactError::Package(e.to_string()))?
            .to_path_buf();
        let is_dir = path.is_dir();
        out.push(relative);
        if is_dir {
            collect_entries(root, &path, skip, out)?;
        }
    }
    Ok(())
}

fn highest_numbered_dir(base_dir: &Path) -> u32 {
    fs::read_dir(base_dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_dir())
                .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(path: &Path) -> io::Result<u32> {
    Ok(if path.is_dir() { 0o755 } else { 0o644 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buffer);
            for (name, content) in files {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(content).unwrap();
            }
            zip.finish().unwrap();
        }
        buffer.into_inner()
    }

    struct FakeCompiler {
        produce: bool,
        fail: Option<&'static str>,
        called: AtomicBool,
    }

    impl FakeCompiler {
        fn new(produce: bool, fail: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                produce,
                fail,
                called: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Compiler for FakeCompiler {
        async fn compile(&self, main: &str, src_dir: &Path, bin_dir: &Path) -> Result<()> {
            self.called.store(true, Ordering::SeqCst);
            assert_eq!(main, "main");
            assert!(src_dir.join(EXEC_NAME).exists());
            if let Some(message) = self.fail {
                return Err(ArtifactError::CompileFailed(message.to_string()));
            }
            if self.produce {
                fs::write(bin_dir.join(EXEC_NAME), b"#!/bin/sh\necho '{}'\n").unwrap();
            }
            Ok(())
        }
    }

    #[test]
    fn test_plain_payload_is_written_executable() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = ActionExtractor::new(temp.path());

        let file = extractor.extract(b"print('hi')", "src").unwrap();

        assert_eq!(file, temp.path().join("1").join("src").join(EXEC_NAME));
        assert_eq!(fs::read(&file).unwrap(), b"print('hi')");
        #[cfg(unix)]
        assert_eq!(file_mode(&file).unwrap(), 0o755);
    }

    #[test]
    fn test_each_extraction_gets_a_new_directory() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("7")).unwrap();
        let extractor = ActionExtractor::new(temp.path());
        assert_eq!(extractor.current_dir(), 7);

        let first = extractor.extract(b"a", "src").unwrap();
        let second = extractor.extract(b"b", "src").unwrap();

        assert!(first.starts_with(temp.path().join("8")));
        assert!(second.starts_with(temp.path().join("9")));
        assert_eq!(extractor.current_dir(), 9);
    }

    #[test]
    fn test_zip_payload_is_unpacked() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = ActionExtractor::new(temp.path());
        let payload = zip_bytes(&[("exec", b"#!/bin/sh\n"), ("lib/util.py", b"x = 1\n")]);

        let file = extractor.extract(&payload, "src").unwrap();

        assert_eq!(fs::read(&file).unwrap(), b"#!/bin/sh\n");
        assert!(file.parent().unwrap().join("lib/util.py").is_file());
    }

    #[test]
    fn test_corrupt_zip_is_extraction_error() {
        let temp = tempfile::tempdir().unwrap();
        let extractor = ActionExtractor::new(temp.path());
        let err = extractor.extract(b"PK\x03\x04garbage", "src").unwrap_err();
        assert!(matches!(err, ArtifactError::Extraction(_)));
    }

    #[test]
    fn test_zip_entries_cannot_escape_target() {
        let temp = tempfile::tempdir().unwrap();
        let base = temp.path().join("action");
        let extractor = ActionExtractor::new(&base);
        let payload = zip_bytes(&[
            ("exec", b"#!/bin/sh\n"),
            ("../evil", b"outside src"),
            ("../../../evil", b"outside base"),
        ]);

        let _ = extractor.extract(&payload, "src");

        assert!(!base.join("1/evil").exists());
        assert!(!base.join("evil").exists());
        assert!(!temp.path().join("evil").exists());
    }

    #[cfg(unix)]
    fn script_compiler(dir: &Path, body: &str) -> CommandCompiler {
        let path = dir.join("compile.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        set_mode(&path, 0o755).unwrap();
        CommandCompiler::new(path.to_string_lossy().into_owned())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_compiler_builds_binary() {
        let tools = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let extractor: Arc<dyn Extractor> = Arc::new(ActionExtractor::new(temp.path()));
        let compiler = script_compiler(
            tools.path(),
            r#"printf '%s' "$1" > "$3/entry" && cp "$2/exec" "$3/exec""#,
        );

        let binary = extract_and_compile(
            extractor,
            Some(Arc::new(compiler)),
            b"package main".to_vec(),
            "main",
        )
        .await
        .unwrap();

        assert_eq!(binary, temp.path().join("1/bin/exec"));
        assert_eq!(fs::read(&binary).unwrap(), b"package main");
        assert_eq!(fs::read(temp.path().join("1/bin/entry")).unwrap(), b"main");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_compiler_failure_carries_output() {
        let tools = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let compiler = script_compiler(
            tools.path(),
            "echo 'building'; echo 'main.go:3: syntax error: unexpected }' >&2; exit 1",
        );

        let err = compiler
            .compile("main", temp.path(), temp.path())
            .await
            .unwrap_err();

        match err {
            ArtifactError::CompileFailed(message) => {
                assert!(message.contains("building"));
                assert!(message.contains("main.go:3: syntax error: unexpected }"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_compiler_failure_reports_status() {
        let tools = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let compiler = script_compiler(tools.path(), "exit 3");

        let err = compiler
            .compile("main", temp.path(), temp.path())
            .await
            .unwrap_err();

        assert!(matches!(err, ArtifactError::CompileFailed(_)));
        assert!(err.to_string().starts_with("compiler exited with"));
        assert!(err.to_string().contains('3'));
    }

    #[tokio::test]
    async fn test_missing_compiler_program() {
        let temp = tempfile::tempdir().unwrap();
        let program = temp.path().join("no-such-compiler");
        let compiler = CommandCompiler::new(program.to_string_lossy().into_owned());

        let err = compiler
            .compile("main", temp.path(), temp.path())
            .await
            .unwrap_err();

        assert!(matches!(err, ArtifactError::CompileFailed(_)));
        assert!(
            err.to_string()
                .starts_with(&format!("cannot run compiler {}: ", program.display()))
        );
    }

    #[test]
    fn test_native_executable_detection() {
        let temp = tempfile::tempdir().unwrap();
        let elf = temp.path().join("elf");
        fs::write(&elf, b"\x7fELF\x02\x01\x01").unwrap();
        let script = temp.path().join("script");
        fs::write(&script, b"#!/usr/bin/env python3\n").unwrap();
        let short = temp.path().join("short");
        fs::write(&short, b"MZ").unwrap();

        assert!(is_native_executable(&elf));
        assert!(!is_native_executable(&script));
        assert!(!is_native_executable(&short));
        assert!(!is_native_executable(&temp.path().join("missing")));
    }

    #[tokio::test]
    async fn test_without_compiler_src_becomes_bin() {
        let temp = tempfile::tempdir().unwrap();
        let extractor: Arc<dyn Extractor> = Arc::new(ActionExtractor::new(temp.path()));

        let binary = extract_and_compile(extractor, None, b"print(1)".to_vec(), "main")
            .await
            .unwrap();

        assert_eq!(binary, temp.path().join("1/bin/exec"));
        assert!(binary.is_file());
        assert!(!temp.path().join("1/src").exists());
    }

    #[tokio::test]
    async fn test_native_payload_skips_compiler() {
        let temp = tempfile::tempdir().unwrap();
        let extractor: Arc<dyn Extractor> = Arc::new(ActionExtractor::new(temp.path()));
        let compiler = FakeCompiler::new(true, None);

        let binary = extract_and_compile(
            extractor,
            Some(compiler.clone()),
            b"\x7fELF\x02\x01\x01\x00".to_vec(),
            "main",
        )
        .await
        .unwrap();

        assert!(binary.is_file());
        assert!(!compiler.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_compiler_output_is_verified() {
        let temp = tempfile::tempdir().unwrap();
        let extractor: Arc<dyn Extractor> = Arc::new(ActionExtractor::new(temp.path()));

        let err = extract_and_compile(
            extractor,
            Some(FakeCompiler::new(false, None)),
            b"package main".to_vec(),
            "main",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ArtifactError::CompileOutputMissing(_)));
    }

    #[tokio::test]
    async fn test_compiler_failure_propagates() {
        let temp = tempfile::tempdir().unwrap();
        let extractor: Arc<dyn Extractor> = Arc::new(ActionExtractor::new(temp.path()));

        let err = extract_and_compile(
            extractor,
            Some(FakeCompiler::new(true, Some("syntax error on line 3"))),
            b"package main".to_vec(),
            "main",
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "syntax error on line 3");
    }

    #[tokio::test]
    async fn test_compiled_artifact_is_returned() {
        let temp = tempfile::tempdir().unwrap();
        let extractor: Arc<dyn Extractor> = Arc::new(ActionExtractor::new(temp.path()));

        let binary = extract_and_compile(
            extractor,
            Some(FakeCompiler::new(true, None)),
            b"package main".to_vec(),
            "main",
        )
        .await
        .unwrap();

        assert_eq!(binary, temp.path().join("1/bin/exec"));
        assert!(temp.path().join("1/src/exec").is_file());
    }

    #[test]
    fn test_layout_and_remote_root() {
        let layout = ArtifactLayout::from_binary(Path::new("/srv/action/3/bin/exec")).unwrap();
        assert_eq!(layout.root, PathBuf::from("/srv/action/3"));
        assert_eq!(layout.archive_path(), PathBuf::from("/srv/action/3/bin/action.zip"));
        assert_eq!(layout.remote_root().unwrap(), "action/3");

        let relative = ArtifactLayout::from_binary(Path::new("./action/1/bin/exec")).unwrap();
        assert_eq!(relative.remote_root().unwrap(), "action/1");

        let shallow = ArtifactLayout::from_binary(Path::new("1/bin/exec")).unwrap();
        assert!(shallow.remote_root().is_err());
    }

    #[test]
    fn test_package_archive_contains_tree_but_not_itself() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("action/1");
        fs::create_dir_all(root.join("bin/lib")).unwrap();
        fs::write(root.join("bin/exec"), b"#!/bin/sh\n").unwrap();
        set_mode(&root.join("bin/exec"), 0o755).unwrap();
        fs::write(root.join("bin/lib/data.txt"), b"data").unwrap();
        let layout = ArtifactLayout::from_binary(&root.join("bin/exec")).unwrap();

        // a stale archive from an earlier packaging run must not be nested
        fs::write(layout.archive_path(), b"stale").unwrap();
        let size = package_archive(&layout).unwrap();

        let bytes = fs::read(layout.archive_path()).unwrap();
        assert_eq!(bytes.len() as u64, size);
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"bin/exec".to_string()));
        assert!(names.contains(&"bin/lib/data.txt".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(ARCHIVE_NAME)));

        let exec = archive.by_name("bin/exec").unwrap();
        #[cfg(unix)]
        assert_eq!(exec.unix_mode().map(|m| m & 0o777), Some(0o755));
    }
}
