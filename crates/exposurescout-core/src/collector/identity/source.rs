//! Where identity data comes from.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::debug;

use crate::collector::CollectError;
use crate::collector::traits::{FileSystem, RealFs};
use crate::digest::Digest;

use super::model::{Group, Sudoer, User};
use super::parser::{
    GroupEntry, PasswdEntry, parse_group, parse_group_line, parse_lines, parse_passwd,
    parse_sudoer_line, parse_sudoers, parse_user_line, resolve_users,
};

/// Producer of the raw identity categories.
///
/// Each method is called from its own worker thread.
pub trait IdentitySource: Send + Sync {
    fn users(&self) -> Result<Vec<User>, CollectError>;

    fn groups(&self) -> Result<Vec<Group>, CollectError>;

    fn sudoers(&self) -> Result<Vec<Sudoer>, CollectError>;

    fn passwd_digest(&self) -> Result<Digest, CollectError>;

    fn group_digest(&self) -> Result<Digest, CollectError>;
}

pub const PASSWD_PATH: &str = "/etc/passwd";
pub const GROUP_PATH: &str = "/etc/group";
pub const SUDOERS_PATH: &str = "/etc/sudoers";

fn read(fs: &dyn FileSystem, path: &Path) -> Result<String, CollectError> {
    fs.read_to_string(path)
        .map_err(|e| CollectError::from_io(path, e))
}

fn digest(fs: &dyn FileSystem, path: &Path) -> Result<Digest, CollectError> {
    fs.hash_file(path).map_err(|e| CollectError::from_io(path, e))
}

/// Reads the local account databases.
pub struct EtcSource {
    fs: Arc<dyn FileSystem>,
    passwd: PathBuf,
    group: PathBuf,
    sudoers: PathBuf,
    admin_groups: Vec<String>,
}

impl EtcSource {
    pub fn new() -> Self {
        Self::with_fs(Arc::new(RealFs::new()))
    }

    pub fn with_fs(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            passwd: PathBuf::from(PASSWD_PATH),
            group: PathBuf::from(GROUP_PATH),
            sudoers: PathBuf::from(SUDOERS_PATH),
            admin_groups: vec!["sudo".into(), "wheel".into(), "admin".into()],
        }
    }

    pub fn with_paths(
        mut self,
        passwd: impl Into<PathBuf>,
        group: impl Into<PathBuf>,
        sudoers: impl Into<PathBuf>,
    ) -> Self {
        self.passwd = passwd.into();
        self.group = group.into();
        self.sudoers = sudoers.into();
        self
    }

    /// Groups whose members are treated as sudoers when the sudoers file
    /// cannot be read.
    pub fn with_admin_groups<S: Into<String>>(mut self, groups: impl IntoIterator<Item = S>) -> Self {
        self.admin_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    fn passwd_entries(&self) -> Result<Vec<PasswdEntry>, CollectError> {
        Ok(parse_passwd(&read(self.fs.as_ref(), &self.passwd)?))
    }

    fn group_entries(&self) -> Result<Vec<GroupEntry>, CollectError> {
        Ok(parse_group(&read(self.fs.as_ref(), &self.group)?))
    }
}

impl Default for EtcSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Uids of everyone in the named groups, by membership list or primary gid.
fn group_members(
    names: &BTreeSet<String>,
    passwd: &[PasswdEntry],
    groups: &[GroupEntry],
) -> BTreeSet<u32> {
    let mut uids = BTreeSet::new();
    for group in groups.iter().filter(|g| names.contains(&g.name)) {
        for entry in passwd {
            if entry.gid == group.gid || group.members.contains(&entry.name) {
                uids.insert(entry.uid);
            }
        }
    }
    uids
}

impl IdentitySource for EtcSource {
    fn users(&self) -> Result<Vec<User>, CollectError> {
        let passwd = self.passwd_entries()?;
        // Supplementary groups are optional.
        let groups = self.group_entries().unwrap_or_default();
        Ok(resolve_users(&passwd, &groups))
    }

    fn groups(&self) -> Result<Vec<Group>, CollectError> {
        Ok(self
            .group_entries()?
            .into_iter()
            .map(|g| Group::new(g.gid, g.name))
            .collect())
    }

    fn sudoers(&self) -> Result<Vec<Sudoer>, CollectError> {
        let passwd = self.passwd_entries()?;
        let groups = self.group_entries()?;

        let uids = match read(self.fs.as_ref(), &self.sudoers) {
            Ok(content) => {
                let grants = parse_sudoers(&content);
                let mut uids = group_members(&grants.groups, &passwd, &groups);
                for name in &grants.users {
                    if let Some(uid) = name.strip_prefix('#').and_then(|u| u.parse().ok()) {
                        uids.insert(uid);
                    } else if let Some(entry) = passwd.iter().find(|p| &p.name == name) {
                        uids.insert(entry.uid);
                    }
                }
                uids
            }
            Err(e) => {
                debug!(error = %e, "sudoers unreadable, using administrative groups");
                let admin: BTreeSet<String> = self.admin_groups.iter().cloned().collect();
                group_members(&admin, &passwd, &groups)
            }
        };
        Ok(uids.into_iter().map(Sudoer::new).collect())
    }

    fn passwd_digest(&self) -> Result<Digest, CollectError> {
        digest(self.fs.as_ref(), &self.passwd)
    }

    fn group_digest(&self) -> Result<Digest, CollectError> {
        digest(self.fs.as_ref(), &self.group)
    }
}

/// Runs external scripts printing one record per line.
///
/// Users as `uid(name):gid,gid`, groups as `name:gid`, sudoers as one uid.
/// Scripts are interpreted by `/bin/sh` unless another shell is set.
/// Digests are still taken from the account files.
pub struct ScriptSource {
    fs: Arc<dyn FileSystem>,
    shell: PathBuf,
    users_script: PathBuf,
    groups_script: PathBuf,
    sudoers_script: PathBuf,
    passwd: PathBuf,
    group: PathBuf,
}

impl ScriptSource {
    /// Expects `Users.sh`, `Groups.sh` and `Sudoers.sh` inside `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            fs: Arc::new(RealFs::new()),
            shell: PathBuf::from("/bin/sh"),
            users_script: dir.join("Users.sh"),
            groups_script: dir.join("Groups.sh"),
            sudoers_script: dir.join("Sudoers.sh"),
            passwd: PathBuf::from(PASSWD_PATH),
            group: PathBuf::from(GROUP_PATH),
        }
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    fn execute(&self, script: &Path) -> Result<String, CollectError> {
        let output = Command::new(&self.shell)
            .arg(script)
            .output()
            .map_err(|e| CollectError::from_io(&self.shell, e))?;
        if !output.status.success() {
            return Err(CollectError::Command {
                command: script.display().to_string(),
                message: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| {
            CollectError::Parse(format!("{} printed invalid UTF-8", script.display()))
        })
    }
}

impl IdentitySource for ScriptSource {
    fn users(&self) -> Result<Vec<User>, CollectError> {
        parse_lines(&self.execute(&self.users_script)?, parse_user_line)
    }

    fn groups(&self) -> Result<Vec<Group>, CollectError> {
        parse_lines(&self.execute(&self.groups_script)?, parse_group_line)
    }

    fn sudoers(&self) -> Result<Vec<Sudoer>, CollectError> {
        let uids = parse_lines(&self.execute(&self.sudoers_script)?, parse_sudoer_line)?;
        Ok(uids.into_iter().map(Sudoer::new).collect())
    }

    fn passwd_digest(&self) -> Result<Digest, CollectError> {
        digest(self.fs.as_ref(), &self.passwd)
    }

    fn group_digest(&self) -> Result<Digest, CollectError> {
        digest(self.fs.as_ref(), &self.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockFs;
    use crate::collector::mock::{GROUP, PASSWD};

    fn uids(sudoers: Vec<Sudoer>) -> Vec<u32> {
        sudoers.into_iter().map(|s| s.uid).collect()
    }

    #[test]
    fn test_etc_source_typical_host() {
        let source = EtcSource::with_fs(Arc::new(MockFs::typical_host()));

        let users = source.users().unwrap();
        assert_eq!(users.len(), 5);
        assert_eq!(users[2], User::new(1001, "alice", [1001, 27, 1500]));

        let groups = source.groups().unwrap();
        assert!(groups.contains(&Group::new(1500, "developers")));

        // root directly, alice through %sudo
        assert_eq!(uids(source.sudoers().unwrap()), vec![0, 1001]);
        assert_eq!(source.passwd_digest().unwrap(), Digest::of(PASSWD.as_bytes()));
        assert_eq!(source.group_digest().unwrap(), Digest::of(GROUP.as_bytes()));
    }

    #[test]
    fn test_unreadable_sudoers_falls_back_to_admin_groups() {
        let mut fs = MockFs::typical_host();
        fs.deny("/etc/sudoers");
        let source = EtcSource::with_fs(Arc::new(fs));
        assert_eq!(uids(source.sudoers().unwrap()), vec![1001]);

        let mut fs = MockFs::typical_host();
        fs.remove("/etc/sudoers");
        let source = EtcSource::with_fs(Arc::new(fs)).with_admin_groups(["developers"]);
        assert_eq!(uids(source.sudoers().unwrap()), vec![1001, 1002]);
    }

    #[test]
    fn test_missing_passwd_is_an_error() {
        let mut fs = MockFs::typical_host();
        fs.remove("/etc/passwd");
        let source = EtcSource::with_fs(Arc::new(fs));
        assert!(matches!(source.users(), Err(CollectError::Io { .. })));
        assert!(source.groups().is_ok());
    }

    #[test]
    fn test_custom_paths() {
        let mut fs = MockFs::new();
        fs.add_file("/chroot/passwd", "svc:x:900:900::/:/bin/false\n");
        fs.add_file("/chroot/group", "svc:x:900:\n");
        let source = EtcSource::with_fs(Arc::new(fs)).with_paths(
            "/chroot/passwd",
            "/chroot/group",
            "/chroot/sudoers",
        );
        assert_eq!(source.users().unwrap(), vec![User::new(900, "svc", [900])]);
        assert!(source.sudoers().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_script_source() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = [
            ("Users.sh", "printf '0(root):0\\n1001(alice):1001,27\\n'"),
            ("Groups.sh", "printf 'root:0\\nsudo:27\\n'"),
            ("Sudoers.sh", "exit 3"),
        ];
        for (name, body) in scripts {
            std::fs::write(dir.path().join(name), format!("{body}\n")).unwrap();
        }

        let source = ScriptSource::new(dir.path()).with_fs(Arc::new(MockFs::typical_host()));
        assert_eq!(
            source.users().unwrap(),
            vec![User::new(0, "root", [0]), User::new(1001, "alice", [1001, 27])]
        );
        assert_eq!(source.groups().unwrap()[1], Group::new(27, "sudo"));
        assert!(matches!(source.sudoers(), Err(CollectError::Command { .. })));
        assert!(source.passwd_digest().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_script() {
        let source = ScriptSource::new("/nonexistent/scripts");
        assert!(matches!(source.users(), Err(CollectError::Command { .. })));

        let source = ScriptSource::new("/tmp").with_shell("/nonexistent/shell");
        assert!(matches!(source.groups(), Err(CollectError::Io { .. })));
    }
}
