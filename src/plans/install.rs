//! Installs and configures a PostgreSQL server.
//!
//! Re-running the plan against a provisioned host is safe: directories that
//! exist, symlinks that already point at the right place and a service that
//! is already running are no-ops.

use anyhow::{Context, bail};
use tracing::debug;

use super::account_ids;
use crate::config::{AuxScriptsConfig, ManagedDirectory, ManagedFile, ProvisionConfig, SymlinkConfig};
use crate::error::ProvisionError;
use crate::host::{FileKind, Host, restamp_tree};
use crate::preflight::Requirement;
use crate::registry::StepRegistry;
use crate::runner::Plan;
use crate::step::{ProvisioningStep, SnapshotKind, StepEffect, StepScope};
use crate::verify::{Check, CheckKind, Principal};

pub const INSTALL_PACKAGES: &str = "install-packages";
pub const CREATE_DIRECTORIES: &str = "create-directories";
pub const SET_OWNERSHIP: &str = "set-ownership";
pub const CREATE_SYMLINKS: &str = "create-symlinks";
pub const INSTALL_CONFIG_FILES: &str = "install-config-files";
pub const COPY_AUX_SCRIPTS: &str = "copy-aux-scripts";
pub const CHOWN_AUX_SCRIPTS: &str = "chown-aux-scripts";
pub const ENABLE_SERVICE: &str = "enable-service";
pub const START_SERVICE: &str = "start-service";

/// Mode given to copied auxiliary scripts.
const AUX_SCRIPT_MODE: u32 = 0o755;

/// Builds the install plan for `config`.
pub fn build(config: &ProvisionConfig) -> Result<Plan, ProvisionError> {
    let mut registry = StepRegistry::new();
    registry.register(install_packages(config))?;
    registry.register(create_directories(config))?;
    registry.register(set_ownership(config))?;
    registry.register(create_symlinks(config))?;
    registry.register(install_config_files(config))?;
    registry.register(copy_aux_scripts(config))?;
    registry.register(chown_aux_scripts(config))?;
    registry.register(enable_service(config))?;
    registry.register(start_service(config))?;
    registry.validate()?;

    Ok(Plan {
        name: "install".to_string(),
        requirements: requirements(config),
        registry,
        checks: checks(config),
        confirmation: None,
    })
}

fn requirements(config: &ProvisionConfig) -> Vec<Requirement> {
    let mut requirements = vec![Requirement::Privileged];
    requirements.extend(
        config
            .files
            .iter()
            .map(|f| Requirement::PathExists(f.source.clone())),
    );
    requirements.push(Requirement::ServiceInactive(config.service.clone()));
    requirements
}

fn checks(config: &ProvisionConfig) -> Vec<Check> {
    let owner = Principal::Named {
        user: config.account.user.clone(),
        group: config.account.group.clone(),
    };
    let mut checks = Vec::new();
    for dir in &config.directories {
        checks.push(
            Check::new(CheckKind::DirectoryExists(dir.path.clone())).established_by(CREATE_DIRECTORIES),
        );
        if dir.owned {
            checks.push(
                Check::new(CheckKind::Ownership {
                    path: dir.path.clone(),
                    owner: owner.clone(),
                    mode: Some(dir.mode),
                })
                .established_by(SET_OWNERSHIP),
            );
        }
    }
    checks.push(Check::new(CheckKind::ServiceActive(config.service.clone())).established_by(START_SERVICE));
    checks.push(Check::new(CheckKind::Connectivity(config.endpoint.clone())).established_by(START_SERVICE));
    checks
}

fn install_packages(config: &ProvisionConfig) -> ProvisioningStep {
    let packages = config.packages.clone();
    let operation = format!("{} install", config.package_tool.command_name());
    ProvisioningStep::mandatory(INSTALL_PACKAGES, 10, operation, move |scope| {
        if packages.is_empty() {
            debug!("no packages configured");
            return Ok(StepEffect::Unchanged);
        }
        scope.host.packages.install(&packages)?;
        Ok(StepEffect::Changed)
    })
}

fn create_directories(config: &ProvisionConfig) -> ProvisioningStep {
    let directories = config.directories.clone();
    ProvisioningStep::mandatory(CREATE_DIRECTORIES, 20, "mkdir", move |scope| {
        let mut effect = StepEffect::Unchanged;
        for dir in &directories {
            if scope.host.fs.exists(&dir.path) {
                let stat = scope.host.fs.stat(&dir.path)?;
                if !stat.is_dir() {
                    bail!("{} exists but is not a directory", dir.path);
                }
                debug!("{} already exists", dir.path);
                continue;
            }
            scope.host.fs.mkdir_all(&dir.path)?;
            effect = StepEffect::Changed;
        }
        Ok(effect)
    })
}

fn set_ownership(config: &ProvisionConfig) -> ProvisioningStep {
    let directories = config.directories.clone();
    let user = config.account.user.clone();
    let group = config.account.group.clone();
    ProvisioningStep::mandatory(SET_OWNERSHIP, 30, "chown/chmod", move |scope| {
        let (uid, gid) = account_ids(scope.host, &user, &group)?;
        let mut changed = 0;
        for dir in &directories {
            changed += apply_directory_ownership(scope.host, dir, uid, gid)?;
        }
        Ok(effect_of(changed))
    })
    .with_targets(
        config.directories.iter().map(|d| d.path.clone()),
        SnapshotKind::Ownership,
    )
}

/// Re-owns an owned tree and sets the top-level mode. Returns the number
/// of entries changed.
fn apply_directory_ownership(
    host: &Host,
    dir: &ManagedDirectory,
    uid: u32,
    gid: u32,
) -> anyhow::Result<usize> {
    let mut changed = 0;
    if dir.owned {
        changed += restamp_tree(host.fs.as_ref(), &dir.path, uid, gid)?;
    }
    let stat = host.fs.stat(&dir.path)?;
    if stat.mode != dir.mode {
        host.fs.chmod(&dir.path, dir.mode)?;
        changed += 1;
    }
    Ok(changed)
}

fn create_symlinks(config: &ProvisionConfig) -> ProvisioningStep {
    let symlinks = config.symlinks.clone();
    ProvisioningStep::mandatory(CREATE_SYMLINKS, 40, "symlink", move |scope| {
        let mut effect = StepEffect::Unchanged;
        for link in &symlinks {
            if ensure_symlink(scope.host, link)? == StepEffect::Changed {
                effect = StepEffect::Changed;
            }
        }
        Ok(effect)
    })
    .with_targets(config.symlinks.iter().map(|l| l.link.clone()), SnapshotKind::File)
}

/// Points `link.link` at `link.target`, replacing a stale link or file.
fn ensure_symlink(host: &Host, link: &SymlinkConfig) -> anyhow::Result<StepEffect> {
    if host.fs.exists(&link.link) {
        match host.fs.stat(&link.link)?.kind {
            FileKind::Symlink(current) if current == link.target => {
                debug!("{} already points at {}", link.link, link.target);
                return Ok(StepEffect::Unchanged);
            }
            FileKind::Symlink(_) | FileKind::File => host.fs.remove(&link.link)?,
            FileKind::Dir => bail!("{} is a directory, refusing to replace it", link.link),
            FileKind::Other => bail!("{} is not a file or symlink", link.link),
        }
    } else if let Some(parent) = link.link.parent() {
        host.fs.mkdir_all(parent)?;
    }
    host.fs.symlink(&link.target, &link.link)?;
    Ok(StepEffect::Changed)
}

fn install_config_files(config: &ProvisionConfig) -> ProvisioningStep {
    let files = config.files.clone();
    let user = config.account.user.clone();
    let group = config.account.group.clone();
    ProvisioningStep::mandatory(INSTALL_CONFIG_FILES, 50, "copy", move |scope| {
        if files.is_empty() {
            return Ok(StepEffect::Unchanged);
        }
        let (uid, gid) = account_ids(scope.host, &user, &group)?;
        for file in &files {
            install_file(scope.host, file, uid, gid)?;
        }
        Ok(StepEffect::Changed)
    })
    .with_targets(config.files.iter().map(|f| f.dest.clone()), SnapshotKind::File)
}

fn install_file(host: &Host, file: &ManagedFile, uid: u32, gid: u32) -> anyhow::Result<()> {
    if let Some(parent) = file.dest.parent() {
        host.fs.mkdir_all(parent)?;
    }
    host.fs.copy(&file.source, &file.dest)?;
    host.fs.chown(&file.dest, uid, gid)?;
    if let Some(mode) = file.mode {
        host.fs.chmod(&file.dest, mode)?;
    }
    Ok(())
}

fn copy_aux_scripts(config: &ProvisionConfig) -> ProvisioningStep {
    let scripts = config.aux_scripts.clone();
    ProvisioningStep::optional(COPY_AUX_SCRIPTS, 60, "copy", move |scope| match &scripts {
        None => Ok(StepEffect::Unchanged),
        Some(scripts) => copy_scripts(scope, scripts),
    })
}

fn copy_scripts(scope: &mut StepScope<'_>, scripts: &AuxScriptsConfig) -> anyhow::Result<StepEffect> {
    let fs = scope.host.fs.clone();
    if !fs.exists(&scripts.source) {
        bail!("script source {} does not exist", scripts.source);
    }
    let children = fs.read_dir(&scripts.source)?;
    fs.mkdir_all(&scripts.dest)?;
    for child in children {
        if fs.stat(&child)?.kind != FileKind::File {
            debug!("skipping {}, not a regular file", child);
            continue;
        }
        let Some(name) = child.file_name() else {
            continue;
        };
        let dest = scripts.dest.join(name);
        scope.snapshot(dest.clone(), SnapshotKind::File)?;
        fs.copy(&child, &dest)
            .with_context(|| format!("failed to install script {}", name))?;
        fs.chmod(&dest, AUX_SCRIPT_MODE)?;
    }
    Ok(StepEffect::Changed)
}

fn chown_aux_scripts(config: &ProvisionConfig) -> ProvisioningStep {
    let dest = config.aux_scripts.as_ref().map(|s| s.dest.clone());
    let user = config.account.user.clone();
    let group = config.account.group.clone();
    let step = ProvisioningStep::optional(CHOWN_AUX_SCRIPTS, 70, "chown", move |scope| {
        let Some(dest) = &dest else {
            return Ok(StepEffect::Unchanged);
        };
        let (uid, gid) = account_ids(scope.host, &user, &group)?;
        Ok(effect_of(restamp_tree(scope.host.fs.as_ref(), dest, uid, gid)?))
    })
    .depends_on(COPY_AUX_SCRIPTS);
    match &config.aux_scripts {
        Some(scripts) => step.with_target(scripts.dest.clone(), SnapshotKind::Ownership),
        None => step,
    }
}

fn enable_service(config: &ProvisionConfig) -> ProvisioningStep {
    let service = config.service.clone();
    ProvisioningStep::mandatory(ENABLE_SERVICE, 80, "systemctl enable", move |scope| {
        if scope.host.services.is_enabled(&service)? {
            return Ok(StepEffect::Unchanged);
        }
        scope.host.services.enable(&service)?;
        Ok(StepEffect::Changed)
    })
}

fn start_service(config: &ProvisionConfig) -> ProvisioningStep {
    let service = config.service.clone();
    ProvisioningStep::mandatory(START_SERVICE, 90, "systemctl start", move |scope| {
        if scope.host.services.is_active(&service)? {
            return Ok(StepEffect::Unchanged);
        }
        scope.host.services.start(&service)?;
        Ok(StepEffect::Changed)
    })
}

fn effect_of(changed: usize) -> StepEffect {
    if changed == 0 {
        StepEffect::Unchanged
    } else {
        StepEffect::Changed
    }
}
