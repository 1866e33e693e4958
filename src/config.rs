//! Profile loading, validation and placeholder expansion.
//!
//! A profile is the YAML description of one PostgreSQL host: which version
//! and packages to install, which directories, links and config files to lay
//! down, which account owns them and how to reach the service afterwards.
//! [`Profile::resolve`] validates it once and produces a [`ProvisionConfig`]
//! in which every `{version}` placeholder has been expanded.

use std::fs::File;
use std::io::BufReader;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ProvisionError;
use crate::host::PackageTool;

/// Version installed when neither the profile nor the CLI names one.
pub const DEFAULT_VERSION: &str = "14";

const VERSION_PLACEHOLDER: &str = "{version}";

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)?$").expect("version regex is valid"));
static ACCOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]*$").expect("account regex is valid"));
static SERVICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9@._:-]+$").expect("service regex is valid"));
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("placeholder regex is valid"));

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_service() -> String {
    "postgresql".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_endpoint() -> String {
    "postgresql://127.0.0.1:5432".to_string()
}

fn default_state_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/lib/pgprovision")
}

fn default_dir_mode() -> FileMode {
    FileMode(0o700)
}

fn default_true() -> bool {
    true
}

fn default_sweep_roots() -> Vec<Utf8PathBuf> {
    vec![Utf8PathBuf::from("/")]
}

fn default_sweep_exclude() -> Vec<Utf8PathBuf> {
    ["/proc", "/sys", "/dev", "/run"]
        .into_iter()
        .map(Utf8PathBuf::from)
        .collect()
}

/// Accepts `version: 14` and `version: 9.6` as well as quoted strings.
fn deserialize_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawVersion {
        Text(String),
        Integer(u64),
        Float(f64),
    }

    Ok(match RawVersion::deserialize(deserializer)? {
        RawVersion::Text(text) => text,
        RawVersion::Integer(n) => n.to_string(),
        RawVersion::Float(f) => f.to_string(),
    })
}

/// Unix permission bits written in octal (`"0750"`, `"750"` or `0750`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Parses octal text, with or without a leading `0` or `0o`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let digits = text.trim().trim_start_matches("0o");
        if digits.is_empty() || !digits.chars().all(|c| ('0'..='7').contains(&c)) {
            return Err(format!("invalid octal mode '{}'", text));
        }
        let mode =
            u32::from_str_radix(digits, 8).map_err(|e| format!("invalid mode '{}': {}", text, e))?;
        if mode > 0o7777 {
            return Err(format!("mode '{}' exceeds 07777", text));
        }
        Ok(Self(mode))
    }
}

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl<'de> Deserialize<'de> for FileMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de;

        struct ModeVisitor;

        impl de::Visitor<'_> for ModeVisitor {
            type Value = FileMode;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("an octal file mode such as \"0750\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                FileMode::parse(v).map_err(E::custom)
            }

            // An unquoted `750` reaches us as a decimal integer; its digits
            // are what the author meant.
            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                FileMode::parse(&v.to_string()).map_err(E::custom)
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                FileMode::parse(&v.to_string()).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}

impl Serialize for FileMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// The service account owning the data directories.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_user")]
    pub group: String,
    /// Desired uid, used by `migrate-ids`.
    #[serde(default)]
    pub uid: Option<u32>,
    /// Desired gid, used by `migrate-ids`.
    #[serde(default)]
    pub gid: Option<u32>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            group: default_user(),
            uid: None,
            gid: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PackagesConfig {
    #[serde(default)]
    pub tool: PackageTool,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    pub path: Utf8PathBuf,
    #[serde(default = "default_dir_mode")]
    pub mode: FileMode,
    /// Whether the directory tree belongs to the service account.
    #[serde(default = "default_true")]
    pub owned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SymlinkConfig {
    pub link: Utf8PathBuf,
    pub target: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub source: Utf8PathBuf,
    pub dest: Utf8PathBuf,
    #[serde(default)]
    pub mode: Option<FileMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuxScriptsConfig {
    pub source: Utf8PathBuf,
    pub dest: Utf8PathBuf,
}

/// Where `migrate-ids` re-stamps ownership and sweeps for leftovers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    /// Trees re-owned recursively to the new ids.
    #[serde(default)]
    pub roots: Vec<Utf8PathBuf>,
    #[serde(default = "default_sweep_roots")]
    pub sweep_roots: Vec<Utf8PathBuf>,
    #[serde(default = "default_sweep_exclude")]
    pub sweep_exclude: Vec<Utf8PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            sweep_roots: default_sweep_roots(),
            sweep_exclude: default_sweep_exclude(),
        }
    }
}

/// A profile exactly as written in YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default = "default_version", deserialize_with = "deserialize_version")]
    pub version: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
    #[serde(default)]
    pub symlinks: Vec<SymlinkConfig>,
    #[serde(default)]
    pub files: Vec<FileConfig>,
    #[serde(default)]
    pub aux_scripts: Option<AuxScriptsConfig>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: Utf8PathBuf,
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// A managed directory after placeholder expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDirectory {
    pub path: Utf8PathBuf,
    pub mode: u32,
    pub owned: bool,
}

/// A config file after placeholder expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedFile {
    pub source: Utf8PathBuf,
    pub dest: Utf8PathBuf,
    pub mode: Option<u32>,
}

/// A validated profile with every placeholder expanded.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub version: String,
    pub service: String,
    pub account: AccountConfig,
    pub package_tool: PackageTool,
    pub packages: Vec<String>,
    pub directories: Vec<ManagedDirectory>,
    pub symlinks: Vec<SymlinkConfig>,
    pub files: Vec<ManagedFile>,
    pub aux_scripts: Option<AuxScriptsConfig>,
    pub endpoint: Url,
    pub state_dir: Utf8PathBuf,
    pub migration: MigrationConfig,
}

/// Loads a profile from a YAML file.
///
/// Relative `source` paths of config files and auxiliary scripts are
/// resolved against the directory containing the profile.
pub fn load_profile(path: &Utf8Path) -> Result<Profile, ProvisionError> {
    let file = File::open(path).map_err(|e| ProvisionError::io(path.to_string(), e))?;
    let reader = BufReader::new(file);
    let mut profile: Profile = serde_yaml::from_reader(reader)
        .map_err(|e| ProvisionError::Config(format!("failed to parse yaml {}: {}", path, e)))?;

    let base_dir = path.parent().unwrap_or_else(|| Utf8Path::new(""));
    profile.resolve_paths(base_dir);
    Ok(profile)
}

/// Rejects paths containing `..`.
fn validate_no_parent_dirs(path: &Utf8Path, label: &str) -> Result<(), ProvisionError> {
    if path
        .components()
        .any(|c| c == camino::Utf8Component::ParentDir)
    {
        return Err(ProvisionError::Validation(format!(
            "{} path '{}' contains '..' components, which is not allowed",
            label, path
        )));
    }
    Ok(())
}

/// Rejects relative paths and paths containing `..`.
fn validate_absolute(path: &Utf8Path, label: &str) -> Result<(), ProvisionError> {
    if !path.is_absolute() {
        return Err(ProvisionError::Validation(format!(
            "{} path '{}' must be absolute",
            label, path
        )));
    }
    validate_no_parent_dirs(path, label)
}

fn validate_id(id: Option<u32>, label: &str) -> Result<(), ProvisionError> {
    if id == Some(0) {
        return Err(ProvisionError::Validation(format!(
            "{} must not be 0: the service account cannot be root",
            label
        )));
    }
    Ok(())
}

impl Profile {
    /// Resolves relative source paths against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        let sources = self
            .files
            .iter_mut()
            .map(|f| &mut f.source)
            .chain(self.aux_scripts.iter_mut().map(|a| &mut a.source));
        for source in sources {
            if source.is_relative() {
                *source = base_dir.join(&*source);
            }
        }
    }

    /// Validates the profile without keeping the resolved form.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        self.resolve(None).map(|_| ())
    }

    /// Validates the profile and expands `{version}` placeholders.
    ///
    /// `version_override` (from the command line) replaces the profile's
    /// `version` before anything is expanded.
    pub fn resolve(&self, version_override: Option<&str>) -> Result<ProvisionConfig, ProvisionError> {
        let version = version_override.unwrap_or(&self.version).to_string();
        if !VERSION_RE.is_match(&version) {
            return Err(ProvisionError::Validation(format!(
                "version '{}' must look like '14' or '9.6'",
                version
            )));
        }

        for (label, name) in [("user", &self.account.user), ("group", &self.account.group)] {
            if !ACCOUNT_RE.is_match(name) {
                return Err(ProvisionError::Validation(format!(
                    "invalid account {} name '{}'",
                    label, name
                )));
            }
        }
        validate_id(self.account.uid, "account.uid")?;
        validate_id(self.account.gid, "account.gid")?;

        let expand = |text: &str| -> Result<String, ProvisionError> {
            let expanded = text.replace(VERSION_PLACEHOLDER, &version);
            if let Some(m) = PLACEHOLDER_RE.find(&expanded) {
                return Err(ProvisionError::Validation(format!(
                    "unknown placeholder '{}' in '{}'",
                    m.as_str(),
                    text
                )));
            }
            Ok(expanded)
        };
        let expand_path = |path: &Utf8Path| expand(path.as_str()).map(Utf8PathBuf::from);

        let service = expand(&self.service)?;
        if !SERVICE_RE.is_match(&service) {
            return Err(ProvisionError::Validation(format!(
                "invalid service name '{}'",
                self.service
            )));
        }

        let packages = self
            .packages
            .names
            .iter()
            .map(|name| expand(name.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        if packages.iter().any(|p| p.trim().is_empty()) {
            return Err(ProvisionError::Validation("package names must not be empty".to_string()));
        }

        let mut directories: Vec<ManagedDirectory> = Vec::with_capacity(self.directories.len());
        for dir in &self.directories {
            let path = expand_path(&dir.path)?;
            validate_absolute(&path, "directory")?;
            if directories.iter().any(|d| d.path == path) {
                return Err(ProvisionError::Validation(format!("duplicate directory '{}'", path)));
            }
            directories.push(ManagedDirectory {
                path,
                mode: dir.mode.0,
                owned: dir.owned,
            });
        }

        let mut symlinks = Vec::with_capacity(self.symlinks.len());
        for link in &self.symlinks {
            let resolved = SymlinkConfig {
                link: expand_path(&link.link)?,
                target: expand_path(&link.target)?,
            };
            validate_absolute(&resolved.link, "symlink")?;
            if resolved.target.as_str().is_empty() {
                return Err(ProvisionError::Validation(format!(
                    "symlink '{}' has an empty target",
                    resolved.link
                )));
            }
            symlinks.push(resolved);
        }

        let mut files = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let resolved = ManagedFile {
                source: expand_path(&file.source)?,
                dest: expand_path(&file.dest)?,
                mode: file.mode.map(|m| m.0),
            };
            validate_no_parent_dirs(&resolved.source, "config file source")?;
            validate_absolute(&resolved.dest, "config file destination")?;
            files.push(resolved);
        }

        let aux_scripts = match &self.aux_scripts {
            Some(aux) => {
                let resolved = AuxScriptsConfig {
                    source: expand_path(&aux.source)?,
                    dest: expand_path(&aux.dest)?,
                };
                validate_no_parent_dirs(&resolved.source, "aux scripts source")?;
                validate_absolute(&resolved.dest, "aux scripts destination")?;
                Some(resolved)
            }
            None => None,
        };

        let endpoint = Url::parse(&expand(self.endpoint.as_str())?).map_err(|e| {
            ProvisionError::Validation(format!("invalid endpoint '{}': {}", self.endpoint, e))
        })?;
        if endpoint.host_str().is_none_or(str::is_empty) {
            return Err(ProvisionError::Validation(format!(
                "endpoint '{}' has no host",
                self.endpoint
            )));
        }

        validate_absolute(&self.state_dir, "state_dir")?;

        let mut migration = MigrationConfig {
            roots: Vec::with_capacity(self.migration.roots.len()),
            sweep_roots: Vec::with_capacity(self.migration.sweep_roots.len()),
            sweep_exclude: Vec::with_capacity(self.migration.sweep_exclude.len()),
        };
        for (input, output, label) in [
            (&self.migration.roots, &mut migration.roots, "migration root"),
            (&self.migration.sweep_roots, &mut migration.sweep_roots, "sweep root"),
            (&self.migration.sweep_exclude, &mut migration.sweep_exclude, "sweep exclusion"),
        ] {
            for path in input {
                let path = expand_path(path)?;
                validate_absolute(&path, label)?;
                output.push(path);
            }
        }

        Ok(ProvisionConfig {
            version,
            service,
            account: self.account.clone(),
            package_tool: self.packages.tool,
            packages,
            directories,
            symlinks,
            files,
            aux_scripts,
            endpoint,
            state_dir: self.state_dir.clone(),
            migration,
        })
    }
}
