//! Build-time merging of a sanitizer runtime with the engine's no-main runtime.
//!
//! Both runtimes ship as static archives owned by the toolchain. Linking them
//! naively into one shared object duplicates the sanitizer's pre-init
//! constructors, which then initialize the sanitizer twice once the object is
//! preloaded next to the engine. The composer edits a scratch copy of the
//! sanitizer archive to drop those members and relinks it with the whole
//! no-main archive. It holds no runtime state and never touches the originals.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error, info};

pub const FUZZER_NO_MAIN_ENV: &str = "FUZZER_NO_MAIN_LIB";
const FUZZER_NO_MAIN_STEM: &str = "fuzzer_no_main";

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error(
        "Could not find {archive} using {cc:?} or in {env}. \
         Please include {cc:?} in your PATH or set the {env} environment variable."
    )]
    ArchiveNotFound {
        archive: String,
        cc: PathBuf,
        env: &'static str,
    },
    #[error("Failed to run {tool:?}: {source}")]
    ToolSpawn {
        tool: PathBuf,
        source: std::io::Error,
    },
    #[error("{tool:?} failed ({status}): {stderr}")]
    ToolFailed {
        tool: PathBuf,
        status: String,
        stderr: String,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
    #[error("Unknown sanitizer flavor '{0}' (expected 'asan' or 'ubsan')")]
    UnknownFlavor(String),
}

/// A sanitizer runtime that can be merged with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SanitizerFlavor {
    #[serde(alias = "asan")]
    Address,
    #[serde(alias = "ubsan")]
    UndefinedBehavior,
}

impl SanitizerFlavor {
    pub const ALL: [SanitizerFlavor; 2] = [SanitizerFlavor::Address, SanitizerFlavor::UndefinedBehavior];

    pub fn short_name(self) -> &'static str {
        match self {
            SanitizerFlavor::Address => "asan",
            SanitizerFlavor::UndefinedBehavior => "ubsan",
        }
    }

    fn archive_stem(self) -> &'static str {
        match self {
            SanitizerFlavor::Address => "asan",
            SanitizerFlavor::UndefinedBehavior => "ubsan_standalone",
        }
    }

    /// Environment variable holding a pre-located archive path.
    pub fn env_override(self) -> &'static str {
        match self {
            SanitizerFlavor::Address => "ASAN_LIB",
            SanitizerFlavor::UndefinedBehavior => "UBSAN_LIB",
        }
    }

    /// Archive members carrying the sanitizer's pre-init constructors.
    /// Older toolchains name them `.cc.o`, newer ones `.cpp.o`.
    pub fn preinit_members(self) -> &'static [&'static str] {
        match self {
            SanitizerFlavor::Address => &["asan_preinit.cc.o", "asan_preinit.cpp.o"],
            SanitizerFlavor::UndefinedBehavior => &[
                "ubsan_init_standalone_preinit.cc.o",
                "ubsan_init_standalone_preinit.cpp.o",
            ],
        }
    }

    pub fn output_name(self) -> String {
        format!("{}_with_fuzzer.so", self.short_name())
    }
}

impl fmt::Display for SanitizerFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for SanitizerFlavor {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asan" | "address" => Ok(SanitizerFlavor::Address),
            "ubsan" | "undefined" | "undefined-behavior" => Ok(SanitizerFlavor::UndefinedBehavior),
            _ => Err(ComposeError::UnknownFlavor(s.to_string())),
        }
    }
}

/// File names a compiler-rt archive may have: per-target runtime directories
/// drop the architecture suffix, the older layout keeps it.
pub fn archive_candidates(stem: &str) -> Vec<String> {
    vec![
        format!("libclang_rt.{stem}.a"),
        format!("libclang_rt.{stem}-{}.a", std::env::consts::ARCH),
    ]
}

/// The compiler driver and archiver used for discovery and surgery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub cc: PathBuf,
    pub ar: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            cc: PathBuf::from("clang"),
            ar: PathBuf::from("ar"),
        }
    }
}

impl Toolchain {
    /// Asks the compiler where `name` lives.
    ///
    /// `--print-file-name` echoes the bare name back when it knows nothing,
    /// so only an existing path counts as found.
    pub fn print_file_name(&self, name: &str) -> Option<PathBuf> {
        let output = Command::new(&self.cc)
            .arg("--print-file-name")
            .arg(name)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        path.is_file().then_some(path)
    }
}

/// Runs `tool` and returns its stdout.
fn run_tool(tool: &Path, args: &[OsString]) -> Result<String, ComposeError> {
    debug!(?tool, ?args, "running build tool");
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|source| ComposeError::ToolSpawn {
            tool: tool.to_path_buf(),
            source,
        })?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let err = ComposeError::ToolFailed {
        tool: tool.to_path_buf(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    error!(error = %err, "build tool failed");
    Err(err)
}

/// Produces one merged runtime per requested flavor.
#[derive(Debug, Clone)]
pub struct Composer {
    toolchain: Toolchain,
    out_dir: PathBuf,
    overrides: HashMap<&'static str, PathBuf>,
}

impl Composer {
    /// A composer whose archive overrides come from the process environment.
    pub fn new(toolchain: Toolchain, out_dir: impl Into<PathBuf>) -> Self {
        let mut overrides = HashMap::new();
        for var in [
            FUZZER_NO_MAIN_ENV,
            SanitizerFlavor::Address.env_override(),
            SanitizerFlavor::UndefinedBehavior.env_override(),
        ] {
            if let Some(path) = std::env::var_os(var).filter(|v| !v.is_empty()) {
                overrides.insert(var, PathBuf::from(path));
            }
        }
        Self {
            toolchain,
            out_dir: out_dir.into(),
            overrides,
        }
    }

    /// Replaces (or sets) the override normally read from `var`.
    pub fn with_override(mut self, var: &'static str, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(var, path.into());
        self
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Toolchain lookup first, then the environment override.
    pub fn locate(&self, stem: &str, env: &'static str) -> Result<PathBuf, ComposeError> {
        let candidates = archive_candidates(stem);
        if let Some(path) = candidates
            .iter()
            .find_map(|name| self.toolchain.print_file_name(name))
        {
            debug!(?path, "located archive through the toolchain");
            return Ok(path);
        }
        debug!(archive = %candidates[0], cc = ?self.toolchain.cc, "toolchain lookup failed, trying {env}");
        match self.overrides.get(env) {
            Some(path) if path.is_file() => Ok(path.clone()),
            _ => Err(ComposeError::ArchiveNotFound {
                archive: candidates[0].clone(),
                cc: self.toolchain.cc.clone(),
                env,
            }),
        }
    }

    pub fn locate_fuzzer_no_main(&self) -> Result<PathBuf, ComposeError> {
        self.locate(FUZZER_NO_MAIN_STEM, FUZZER_NO_MAIN_ENV)
    }

    pub fn locate_sanitizer(&self, flavor: SanitizerFlavor) -> Result<PathBuf, ComposeError> {
        self.locate(flavor.archive_stem(), flavor.env_override())
    }

    /// Locates both archives and merges them into `<out_dir>/<flavor>_with_fuzzer.so`.
    pub fn compose(&self, flavor: SanitizerFlavor) -> Result<PathBuf, ComposeError> {
        let fuzzer = self.locate_fuzzer_no_main()?;
        let sanitizer = self.locate_sanitizer(flavor)?;
        self.compose_from(flavor, &sanitizer, &fuzzer)
    }

    /// Merges explicit archives. `sanitizer_archive` is only ever read.
    ///
    /// Only the pre-init members the archive actually holds are deleted, so
    /// either naming of the toolchain works.
    pub fn compose_from(
        &self,
        flavor: SanitizerFlavor,
        sanitizer_archive: &Path,
        fuzzer_archive: &Path,
    ) -> Result<PathBuf, ComposeError> {
        let scratch = tempfile::Builder::new()
            .prefix("fuzzbridge-compose-")
            .tempdir()
            .map_err(|source| ComposeError::Io {
                context: "Failed to create scratch directory".to_string(),
                source,
            })?;
        let file_name = sanitizer_archive
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from(format!("libclang_rt.{}.a", flavor.archive_stem())));
        let scratch_copy = scratch.path().join(file_name);
        std::fs::copy(sanitizer_archive, &scratch_copy).map_err(|source| ComposeError::Io {
            context: format!("Failed to copy {sanitizer_archive:?} to {scratch_copy:?}"),
            source,
        })?;

        let listing = run_tool(
            &self.toolchain.ar,
            &[OsString::from("t"), scratch_copy.clone().into_os_string()],
        )?;
        let present: Vec<&str> = listing
            .lines()
            .map(str::trim)
            .filter(|member| flavor.preinit_members().iter().any(|m| m == member))
            .collect();
        if present.is_empty() {
            debug!(%flavor, "archive has no pre-init members");
        } else {
            let mut strip: Vec<OsString> = vec!["d".into(), scratch_copy.clone().into()];
            strip.extend(present.iter().map(OsString::from));
            run_tool(&self.toolchain.ar, &strip)?;
        }

        std::fs::create_dir_all(&self.out_dir).map_err(|source| ComposeError::Io {
            context: format!("Failed to create output directory {:?}", self.out_dir),
            source,
        })?;
        let output = self.out_dir.join(flavor.output_name());

        let link: Vec<OsString> = vec![
            "-Wl,--whole-archive".into(),
            fuzzer_archive.into(),
            scratch_copy.into(),
            "-Wl,--no-whole-archive".into(),
            "-lpthread".into(),
            "-ldl".into(),
            "-shared".into(),
            "-o".into(),
            output.clone().into(),
        ];
        if let Err(e) = run_tool(&self.toolchain.cc, &link) {
            // A failed link can still leave a truncated object behind.
            if std::fs::remove_file(&output).is_ok() {
                debug!(?output, "removed partial link output");
            }
            return Err(e);
        }

        info!(%flavor, ?output, "composed merged sanitizer runtime");
        Ok(output)
    }

    /// Composes every flavor independently; the first failure stops the build.
    pub fn compose_all(&self, flavors: &[SanitizerFlavor]) -> Result<Vec<PathBuf>, ComposeError> {
        flavors.iter().map(|&flavor| self.compose(flavor)).collect()
    }
}
