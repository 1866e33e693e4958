//! In-memory host used by the integration tests.
//!
//! `FakeHost` implements every collaborator trait over a shared state, so a
//! test can arrange the host, run a plan and inspect both the end state and
//! the ordered list of mutating calls.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use pgprovision::config::{Profile, ProvisionConfig};
use pgprovision::host::{
    Accounts, ConnectivityProbe, FileKind, FileStat, Filesystem, Host, Identity, PackageManager,
    Privileges, ServiceManager, SharedMemory, WalkEntry,
};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Dir,
    File(Vec<u8>),
    Symlink(Utf8PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub content: Content,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub nodes: BTreeMap<Utf8PathBuf, Node>,
    pub users: BTreeMap<String, (u32, u32)>,
    pub groups: BTreeMap<String, u32>,
    pub installed: Vec<String>,
    pub service_active: bool,
    pub service_enabled: bool,
    pub reachable: bool,
    /// `(shmid, owner uid)`
    pub shm: Vec<(u64, u32)>,
    pub euid: u32,
    /// Mutating calls, in order.
    pub calls: Vec<String>,
    /// Calls starting with any of these prefixes fail.
    pub fail_ops: Vec<String>,
    pub unreadable: BTreeSet<Utf8PathBuf>,
}

impl FakeState {
    fn record(&mut self, call: String) -> Result<()> {
        let fails = self.fail_ops.iter().any(|p| call.starts_with(p.as_str()));
        self.calls.push(call.clone());
        if fails {
            bail!("simulated failure: {}", call);
        }
        Ok(())
    }

    fn node(&self, path: &Utf8Path) -> Result<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| anyhow!("{}: I/O error: not found", path))
    }

    fn require_parent(&self, path: &Utf8Path) -> Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => match self.nodes.get(parent) {
                Some(Node {
                    content: Content::Dir,
                    ..
                }) => Ok(()),
                _ => bail!("{}: parent directory missing", path),
            },
            _ => Ok(()),
        }
    }
}

/// A fake host. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeHost {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// A root-run host with an empty `/`, a stopped service and a reachable endpoint.
    pub fn new() -> Self {
        let mut state = FakeState {
            reachable: true,
            ..FakeState::default()
        };
        state.nodes.insert(
            Utf8PathBuf::from("/"),
            Node {
                uid: 0,
                gid: 0,
                mode: 0o755,
                content: Content::Dir,
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn host(&self) -> Host {
        let me = Arc::new(self.clone());
        Host {
            fs: me.clone(),
            packages: me.clone(),
            accounts: me.clone(),
            services: me.clone(),
            probe: me.clone(),
            shm: me.clone(),
            privileges: me,
        }
    }

    fn insert_parents(state: &mut FakeState, path: &Utf8Path) {
        let ancestors: Vec<Utf8PathBuf> = path.ancestors().skip(1).map(|p| p.to_owned()).collect();
        for dir in ancestors.into_iter().rev() {
            if dir.as_str().is_empty() {
                continue;
            }
            state.nodes.entry(dir).or_insert(Node {
                uid: 0,
                gid: 0,
                mode: 0o755,
                content: Content::Dir,
            });
        }
    }

    pub fn with_dir(self, path: &str, uid: u32, gid: u32, mode: u32) -> Self {
        {
            let mut state = self.state();
            Self::insert_parents(&mut state, Utf8Path::new(path));
            state.nodes.insert(
                path.into(),
                Node {
                    uid,
                    gid,
                    mode,
                    content: Content::Dir,
                },
            );
        }
        self
    }

    pub fn with_file(self, path: &str, contents: &str, uid: u32, gid: u32) -> Self {
        {
            let mut state = self.state();
            Self::insert_parents(&mut state, Utf8Path::new(path));
            state.nodes.insert(
                path.into(),
                Node {
                    uid,
                    gid,
                    mode: 0o644,
                    content: Content::File(contents.as_bytes().to_vec()),
                },
            );
        }
        self
    }

    pub fn with_symlink(self, link: &str, target: &str) -> Self {
        {
            let mut state = self.state();
            Self::insert_parents(&mut state, Utf8Path::new(link));
            state.nodes.insert(
                link.into(),
                Node {
                    uid: 0,
                    gid: 0,
                    mode: 0o777,
                    content: Content::Symlink(target.into()),
                },
            );
        }
        self
    }

    /// Adds a user with a same-named primary group.
    pub fn with_account(self, name: &str, uid: u32, gid: u32) -> Self {
        {
            let mut state = self.state();
            state.users.insert(name.to_string(), (uid, gid));
            state.groups.insert(name.to_string(), gid);
        }
        self
    }

    pub fn with_user(self, name: &str, uid: u32, gid: u32) -> Self {
        self.state().users.insert(name.to_string(), (uid, gid));
        self
    }

    pub fn with_group(self, name: &str, gid: u32) -> Self {
        self.state().groups.insert(name.to_string(), gid);
        self
    }

    pub fn with_service(self, active: bool, enabled: bool) -> Self {
        {
            let mut state = self.state();
            state.service_active = active;
            state.service_enabled = enabled;
        }
        self
    }

    pub fn with_shm(self, id: u64, uid: u32) -> Self {
        self.state().shm.push((id, uid));
        self
    }

    pub fn with_euid(self, euid: u32) -> Self {
        self.state().euid = euid;
        self
    }

    pub fn unreachable(self) -> Self {
        self.state().reachable = false;
        self
    }

    pub fn failing_on(self, prefix: &str) -> Self {
        self.state().fail_ops.push(prefix.to_string());
        self
    }

    pub fn unreadable(self, path: &str) -> Self {
        self.state().unreadable.insert(path.into());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Mutating calls outside `prefix`, e.g. excluding backup artifacts.
    pub fn calls_outside(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.split_whitespace().nth(1).is_some_and(|p| p.starts_with(prefix)))
            .collect()
    }

    pub fn node(&self, path: &str) -> Option<Node> {
        self.state().nodes.get(Utf8Path::new(path)).cloned()
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        match self.node(path)?.content {
            Content::File(bytes) => String::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Paths owned by `uid` or `gid`, excluding `skip`.
    pub fn owned_by(&self, uid: u32, gid: u32, skip: &str) -> Vec<Utf8PathBuf> {
        self.state()
            .nodes
            .iter()
            .filter(|(path, node)| {
                (node.uid == uid || node.gid == gid) && !path.starts_with(skip)
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn identity(&self, user: &str) -> Option<(u32, u32)> {
        self.state().users.get(user).copied()
    }
}

impl Filesystem for FakeHost {
    fn exists(&self, path: &Utf8Path) -> bool {
        self.state().nodes.contains_key(path)
    }

    fn stat(&self, path: &Utf8Path) -> Result<FileStat> {
        let state = self.state();
        let node = state.node(path)?;
        Ok(FileStat {
            uid: node.uid,
            gid: node.gid,
            mode: node.mode,
            kind: match &node.content {
                Content::Dir => FileKind::Dir,
                Content::File(_) => FileKind::File,
                Content::Symlink(target) => FileKind::Symlink(target.clone()),
            },
        })
    }

    fn mkdir_all(&self, path: &Utf8Path) -> Result<()> {
        let mut state = self.state();
        if let Some(node) = state.nodes.get(path) {
            if node.content == Content::Dir {
                return Ok(());
            }
            bail!("{}: exists and is not a directory", path);
        }
        state.record(format!("mkdir {}", path))?;
        Self::insert_parents(&mut state, path);
        state.nodes.insert(
            path.to_owned(),
            Node {
                uid: 0,
                gid: 0,
                mode: 0o755,
                content: Content::Dir,
            },
        );
        Ok(())
    }

    fn chown(&self, path: &Utf8Path, uid: u32, gid: u32) -> Result<()> {
        let mut state = self.state();
        state.node(path)?;
        state.record(format!("chown {} {}:{}", path, uid, gid))?;
        let node = state.nodes.get_mut(path).unwrap();
        node.uid = uid;
        node.gid = gid;
        Ok(())
    }

    fn chmod(&self, path: &Utf8Path, mode: u32) -> Result<()> {
        let mut state = self.state();
        state.node(path)?;
        state.record(format!("chmod {} {:04o}", path, mode))?;
        state.nodes.get_mut(path).unwrap().mode = mode;
        Ok(())
    }

    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> Result<()> {
        let mut state = self.state();
        if state.nodes.contains_key(link) {
            bail!("{}: I/O error: already exists", link);
        }
        state.require_parent(link)?;
        state.record(format!("symlink {} {}", link, target))?;
        state.nodes.insert(
            link.to_owned(),
            Node {
                uid: 0,
                gid: 0,
                mode: 0o777,
                content: Content::Symlink(target.to_owned()),
            },
        );
        Ok(())
    }

    fn remove(&self, path: &Utf8Path) -> Result<()> {
        let mut state = self.state();
        if state.node(path)?.content == Content::Dir {
            bail!("{}: I/O error: is a directory", path);
        }
        state.record(format!("remove {}", path))?;
        state.nodes.remove(path);
        Ok(())
    }

    fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        let mut state = self.state();
        let source = state.node(from)?.clone();
        let Content::File(bytes) = source.content else {
            bail!("{}: not a regular file", from);
        };
        state.require_parent(to)?;
        if let Some(existing) = state.nodes.get(to)
            && existing.content == Content::Dir
        {
            bail!("{}: I/O error: is a directory", to);
        }
        state.record(format!("copy {} {}", to, from))?;
        let (uid, gid) = state.nodes.get(to).map_or((0, 0), |n| (n.uid, n.gid));
        state.nodes.insert(
            to.to_owned(),
            Node {
                uid,
                gid,
                mode: source.mode,
                content: Content::File(bytes),
            },
        );
        Ok(())
    }

    fn write(&self, path: &Utf8Path, contents: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.require_parent(path)?;
        state.record(format!("write {}", path))?;
        state.nodes.insert(
            path.to_owned(),
            Node {
                uid: 0,
                gid: 0,
                mode: 0o600,
                content: Content::File(contents.to_vec()),
            },
        );
        Ok(())
    }

    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let state = self.state();
        if state.node(path)?.content != Content::Dir {
            bail!("{}: not a directory", path);
        }
        Ok(state
            .nodes
            .keys()
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect())
    }

    fn walk(&self, root: &Utf8Path, exclude: &[Utf8PathBuf]) -> Vec<WalkEntry> {
        let state = self.state();
        if !state.nodes.contains_key(root) {
            return vec![WalkEntry::Unreadable {
                path: root.to_owned(),
                reason: "I/O error: not found".to_string(),
            }];
        }
        let mut entries = Vec::new();
        let mut pruned: Vec<&Utf8Path> = exclude.iter().map(|p| p.as_path()).collect();
        for (path, node) in &state.nodes {
            if !path.starts_with(root) || pruned.iter().any(|p| path.starts_with(p)) {
                continue;
            }
            if state.unreadable.contains(path) {
                entries.push(WalkEntry::Unreadable {
                    path: path.clone(),
                    reason: "I/O error: permission denied".to_string(),
                });
                pruned.push(path);
                continue;
            }
            entries.push(WalkEntry::Found {
                path: path.clone(),
                stat: FileStat {
                    uid: node.uid,
                    gid: node.gid,
                    mode: node.mode,
                    kind: match &node.content {
                        Content::Dir => FileKind::Dir,
                        Content::File(_) => FileKind::File,
                        Content::Symlink(target) => FileKind::Symlink(target.clone()),
                    },
                },
            });
        }
        entries
    }
}

impl PackageManager for FakeHost {
    fn install(&self, packages: &[String]) -> Result<()> {
        let mut state = self.state();
        state.record(format!("install {}", packages.join(" ")))?;
        state.installed.extend(packages.iter().cloned());
        Ok(())
    }
}

impl Accounts for FakeHost {
    fn user_by_name(&self, name: &str) -> Option<Identity> {
        self.state().users.get(name).map(|&(uid, gid)| Identity {
            name: name.to_string(),
            uid,
            gid,
        })
    }

    fn user_by_uid(&self, uid: u32) -> Option<Identity> {
        self.state()
            .users
            .iter()
            .find(|(_, (u, _))| *u == uid)
            .map(|(name, &(uid, gid))| Identity {
                name: name.clone(),
                uid,
                gid,
            })
    }

    fn group_gid(&self, name: &str) -> Option<u32> {
        self.state().groups.get(name).copied()
    }

    fn group_by_gid(&self, gid: u32) -> Option<String> {
        self.state()
            .groups
            .iter()
            .find(|(_, g)| **g == gid)
            .map(|(name, _)| name.clone())
    }

    fn set_uid(&self, name: &str, uid: u32) -> Result<()> {
        let mut state = self.state();
        state.record(format!("usermod -u {} {}", uid, name))?;
        let user = state
            .users
            .get_mut(name)
            .ok_or_else(|| anyhow!("usermod: user '{}' does not exist", name))?;
        user.0 = uid;
        Ok(())
    }

    fn set_gid(&self, group: &str, gid: u32) -> Result<()> {
        let mut state = self.state();
        state.record(format!("groupmod -g {} {}", gid, group))?;
        let old = state
            .groups
            .insert(group.to_string(), gid)
            .ok_or_else(|| anyhow!("groupmod: group '{}' does not exist", group))?;
        for user in state.users.values_mut() {
            if user.1 == old {
                user.1 = gid;
            }
        }
        Ok(())
    }
}

impl ServiceManager for FakeHost {
    fn enable(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.record(format!("enable {}", name))?;
        state.service_enabled = true;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.record(format!("start {}", name))?;
        state.service_active = true;
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.record(format!("stop {}", name))?;
        state.service_active = false;
        Ok(())
    }

    fn is_active(&self, _name: &str) -> Result<bool> {
        Ok(self.state().service_active)
    }

    fn is_enabled(&self, _name: &str) -> Result<bool> {
        Ok(self.state().service_enabled)
    }
}

impl ConnectivityProbe for FakeHost {
    fn try_connect(&self, endpoint: &Url) -> Result<()> {
        let state = self.state();
        if state.reachable && state.service_active {
            Ok(())
        } else {
            bail!("failed to connect to {}: connection refused", endpoint)
        }
    }
}

impl SharedMemory for FakeHost {
    fn segments_owned_by(&self, uid: u32) -> Result<Vec<u64>> {
        Ok(self
            .state()
            .shm
            .iter()
            .filter(|(_, owner)| *owner == uid)
            .map(|(id, _)| *id)
            .collect())
    }

    fn release(&self, id: u64) -> Result<()> {
        let mut state = self.state();
        state.record(format!("ipcrm -m {}", id))?;
        state.shm.retain(|(segment, _)| *segment != id);
        Ok(())
    }
}

impl Privileges for FakeHost {
    fn effective_uid(&self) -> u32 {
        self.state().euid
    }
}

/// Parses and resolves a profile given inline.
pub fn resolve(yaml: &str) -> ProvisionConfig {
    let profile: Profile = serde_yaml::from_str(yaml).expect("profile should parse");
    profile.resolve(None).expect("profile should resolve")
}

/// A temporary state directory for locks, run logs and run contexts.
pub fn state_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}
