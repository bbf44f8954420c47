//! Pre-built host scenarios for testing collectors.

use super::MockFs;

pub const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
alice:x:1001:1001:Alice:/home/alice:/bin/bash
bob:x:1002:1002:Bob:/home/bob:/bin/bash
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
";

pub const GROUP: &str = "\
root:x:0:
daemon:x:1:
sudo:x:27:alice
alice:x:1001:
bob:x:1002:
developers:x:1500:alice,bob
nogroup:x:65534:
";

pub const SUDOERS: &str = "\
# See sudoers(5)
Defaults\tenv_reset
Defaults\tsecure_path=\"/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin\"

root\tALL=(ALL:ALL) ALL
%sudo\tALL=(ALL:ALL) ALL

#includedir /etc/sudoers.d
";

impl MockFs {
    /// Creates a small host with identity files and an application tree.
    ///
    /// Identity: users root, daemon, alice, bob, nobody; alice is in `sudo`
    /// and `developers`, bob in `developers`. Sudoers grants root directly
    /// and the `sudo` group.
    ///
    /// Files under `/srv/app` (inodes fixed for diff tests):
    ///
    /// ```text
    /// /srv/app              500
    /// /srv/app/bin          501
    /// /srv/app/bin/server   502
    /// /srv/app/config.toml  503
    /// /srv/app/current      symlink -> bin/server
    /// /srv/app/logs         504
    /// ```
    pub fn typical_host() -> Self {
        let mut fs = MockFs::new();

        fs.add_file("/etc/passwd", PASSWD);
        fs.add_file("/etc/group", GROUP);
        fs.add_file("/etc/sudoers", SUDOERS);
        fs.chmod("/etc/sudoers", 0o440);

        fs.add_dir_with_inode("/srv/app", 500);
        fs.add_dir_with_inode("/srv/app/bin", 501);
        fs.add_file_with_inode("/srv/app/bin/server", b"\x7fELF\x02\x01\x01", 502);
        fs.chmod("/srv/app/bin/server", 0o755);
        fs.add_file_with_inode(
            "/srv/app/config.toml",
            "listen = \"0.0.0.0:8080\"\nworkers = 4\n",
            503,
        );
        fs.add_symlink("/srv/app/current", "bin/server");
        fs.add_dir_with_inode("/srv/app/logs", 504);

        for path in [
            "/srv/app",
            "/srv/app/bin",
            "/srv/app/bin/server",
            "/srv/app/config.toml",
            "/srv/app/current",
            "/srv/app/logs",
        ] {
            fs.chown(path, 1001, 1001);
        }

        fs
    }
}
