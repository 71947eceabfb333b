use crate::composer::{SanitizerFlavor, Toolchain};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "fuzzbridge.toml";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DriverSettings {
    #[serde(default = "default_program_name")]
    pub program_name: String,
    /// `-max_total_time`, in seconds.
    pub max_total_time: Option<u64>,
    /// `-timeout` per input, in seconds. The engine exits 70 when exceeded.
    pub timeout: Option<u64>,
    /// `-runs`; unset means no limit.
    pub runs: Option<u64>,
    pub exact_artifact_path: Option<PathBuf>,
    pub dict: Option<PathBuf>,
    #[serde(default)]
    pub corpus_dirs: Vec<PathBuf>,
    /// Passed to the engine after everything above, untouched.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

pub fn default_program_name() -> String {
    "fuzzbridge".to_string()
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            program_name: default_program_name(),
            max_total_time: None,
            timeout: None,
            runs: None,
            exact_artifact_path: None,
            dict: None,
            corpus_dirs: Vec::new(),
            extra_args: Vec::new(),
        }
    }
}

impl DriverSettings {
    /// Engine argument tokens, program name first.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.program_name.clone()];
        if let Some(secs) = self.max_total_time {
            args.push(format!("-max_total_time={secs}"));
        }
        if let Some(secs) = self.timeout {
            args.push(format!("-timeout={secs}"));
        }
        if let Some(runs) = self.runs {
            args.push(format!("-runs={runs}"));
        }
        if let Some(path) = &self.exact_artifact_path {
            args.push(format!("-exact_artifact_path={}", path.display()));
        }
        if let Some(path) = &self.dict {
            args.push(format!("-dict={}", path.display()));
        }
        args.extend(self.extra_args.iter().cloned());
        args.extend(self.corpus_dirs.iter().map(|d| d.display().to_string()));
        args
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ComposerSettings {
    #[serde(default = "default_cc")]
    pub cc: PathBuf,
    #[serde(default = "default_ar")]
    pub ar: PathBuf,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_flavors")]
    pub flavors: Vec<SanitizerFlavor>,
}

pub fn default_cc() -> PathBuf {
    PathBuf::from("clang")
}

pub fn default_ar() -> PathBuf {
    PathBuf::from("ar")
}

pub fn default_out_dir() -> PathBuf {
    PathBuf::from("./target/fuzzbridge")
}

fn default_flavors() -> Vec<SanitizerFlavor> {
    SanitizerFlavor::ALL.to_vec()
}

impl Default for ComposerSettings {
    fn default() -> Self {
        Self {
            cc: default_cc(),
            ar: default_ar(),
            out_dir: default_out_dir(),
            flavors: default_flavors(),
        }
    }
}

impl ComposerSettings {
    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            cc: self.cc.clone(),
            ar: self.ar.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub composer: ComposerSettings,
}

impl BridgeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: BridgeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_means_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.driver.to_args(), vec!["fuzzbridge".to_string()]);
        assert_eq!(config.composer.flavors, SanitizerFlavor::ALL.to_vec());
    }

    #[test]
    fn driver_settings_become_engine_flags() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [driver]
            program-name = "fuzzbridgetestprogname"
            max-total-time = 30
            exact-artifact-path = "/tmp/crash"
            corpus-dirs = ["corpus"]
            extra-args = ["-use_value_profile=1"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.driver.to_args(),
            vec![
                "fuzzbridgetestprogname",
                "-max_total_time=30",
                "-exact_artifact_path=/tmp/crash",
                "-use_value_profile=1",
                "corpus",
            ]
        );
    }

    #[test]
    fn composer_flavors_accept_short_names() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [composer]
            cc = "/opt/llvm/bin/clang"
            flavors = ["asan"]
            "#,
        )
        .unwrap();
        assert_eq!(config.composer.flavors, vec![SanitizerFlavor::Address]);
        assert_eq!(config.composer.toolchain().cc, PathBuf::from("/opt/llvm/bin/clang"));
        assert_eq!(config.composer.ar, default_ar());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<BridgeConfig, _> = toml::from_str("[driver]\niterations = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file_reports_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[driver]\nmax-total-time = 5").unwrap();
        let config = BridgeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.driver.max_total_time, Some(5));

        let missing = BridgeConfig::load_from_file(Path::new("/nonexistent/fuzzbridge.toml"));
        let msg = missing.unwrap_err().to_string();
        assert!(msg.contains("Failed to read config file"), "{msg}");
    }
}
