use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use pgprovision::ProvisionError;
use pgprovision::config::load_profile;
use pgprovision::host::PackageTool;
use tempfile::tempdir;

fn profiles_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("profiles")
}

/// Writes `yaml` as `profile.yml` in a fresh directory.
fn write_profile(yaml: &str) -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let dir = tempdir()?;
    let path = Utf8PathBuf::from_path_buf(dir.path().join("profile.yml"))
        .map_err(|p| anyhow::anyhow!("non-UTF-8 temp path: {}", p.display()))?;
    fs::write(&path, yaml)?;
    Ok((dir, path))
}

#[test]
fn test_load_profile_invalid_file() {
    let path = Utf8PathBuf::from("/non/existent/file.yml");
    let result = load_profile(path.as_path());
    assert!(result.is_err());
    let err_msg = result.unwrap_err().to_string();
    assert!(
        err_msg.contains("I/O error: not found"),
        "Expected error message to contain 'I/O error: not found', got: {}",
        err_msg
    );
    assert!(err_msg.contains("/non/existent/file.yml"));
}

#[test]
fn test_load_profile_invalid_yaml() -> Result<()> {
    let (_dir, path) = write_profile("version: [14\n")?;

    let err = load_profile(&path).unwrap_err();

    assert!(matches!(err, ProvisionError::Config(_)), "got: {:?}", err);
    assert!(err.to_string().contains("failed to parse yaml"));
    Ok(())
}

#[test]
fn test_load_profile_rejects_unknown_fields() -> Result<()> {
    let (_dir, path) = write_profile("version: 14\ndirectory: []\n")?;

    let err = load_profile(&path).unwrap_err();

    assert!(err.to_string().contains("unknown field `directory`"), "got: {}", err);
    Ok(())
}

#[test]
fn test_relative_sources_resolve_against_profile_dir() -> Result<()> {
    let (dir, path) = write_profile(
        r#"
files:
  - source: conf/postgresql.conf
    dest: /etc/postgresql/{version}/main/postgresql.conf
  - source: /srv/shared/pg_ident.conf
    dest: /etc/postgresql/{version}/main/pg_ident.conf
aux_scripts:
  source: scripts
  dest: /usr/local/lib/pgprovision/scripts
"#,
    )?;
    let base = Utf8Path::from_path(dir.path()).unwrap();

    let config = load_profile(&path)?.resolve(None)?;

    assert_eq!(config.files[0].source, base.join("conf/postgresql.conf"));
    assert_eq!(config.files[1].source, "/srv/shared/pg_ident.conf");
    assert_eq!(config.aux_scripts.unwrap().source, base.join("scripts"));
    Ok(())
}

#[test]
fn test_version_override_reaches_every_path() -> Result<()> {
    let (_dir, path) = write_profile(
        r#"
version: 14
service: postgresql@{version}-main
packages:
  names: ["postgresql-{version}"]
directories:
  - path: /var/lib/postgresql/{version}/main
"#,
    )?;

    let config = load_profile(&path)?.resolve(Some("16"))?;

    assert_eq!(config.version, "16");
    assert_eq!(config.service, "postgresql@16-main");
    assert_eq!(config.packages, vec!["postgresql-16"]);
    assert_eq!(config.directories[0].path, "/var/lib/postgresql/16/main");
    Ok(())
}

#[test]
fn test_shipped_ubuntu_profile() -> Result<()> {
    let dir = profiles_dir().join("ubuntu-2204");

    let config = load_profile(&dir.join("profile.yml"))?.resolve(None)?;

    assert_eq!(config.version, "14");
    assert_eq!(config.package_tool, PackageTool::Apt);
    assert_eq!(config.packages, vec!["postgresql-14", "postgresql-contrib"]);
    assert_eq!(config.account.uid, Some(153));
    assert_eq!(config.account.gid, Some(153));
    let run_dir = config
        .directories
        .iter()
        .find(|d| d.path == "/var/run/postgresql")
        .unwrap();
    assert_eq!(run_dir.mode, 0o2775);
    assert!(config.directories.iter().any(|d| !d.owned));
    for file in &config.files {
        assert!(file.source.starts_with(&dir), "{}", file.source);
        assert!(file.source.exists(), "{} is missing", file.source);
    }
    assert!(config.aux_scripts.unwrap().source.join("pg_backup.sh").exists());
    assert!(
        config
            .migration
            .sweep_exclude
            .contains(&Utf8PathBuf::from("/var/lib/pgprovision"))
    );
    Ok(())
}

#[test]
fn test_shipped_centos_profile() -> Result<()> {
    let path = profiles_dir().join("centos-7").join("profile.yml");

    let config = load_profile(&path)?.resolve(None)?;

    assert_eq!(config.package_tool, PackageTool::Yum);
    assert_eq!(config.service, "postgresql-12");
    assert_eq!(config.packages[0], "postgresql12-server");
    assert_eq!(config.directories[0].path, "/var/lib/pgsql/12/data");
    assert!(config.aux_scripts.is_none());
    Ok(())
}

#[test]
fn test_invalid_package_tool_rejected() -> Result<()> {
    let (_dir, path) = write_profile("packages:\n  tool: pacman\n")?;

    let result = load_profile(&path);

    assert!(result.is_err());
    Ok(())
}
