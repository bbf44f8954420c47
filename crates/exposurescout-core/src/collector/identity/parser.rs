//! Parsers for account databases and identity script output.

use std::collections::{BTreeMap, BTreeSet};

use crate::collector::CollectError;

use super::model::{Group, User};

/// One `/etc/passwd` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

/// One `/etc/group` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

/// Who a sudoers file grants privileges to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SudoersGrants {
    /// User names from user specifications.
    pub users: BTreeSet<String>,
    /// Group names from `%group` specifications.
    pub groups: BTreeSet<String>,
}

fn records(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Parses `/etc/passwd` content. Malformed lines are skipped.
pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    records(content)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() < 4 {
                return None;
            }
            Some(PasswdEntry {
                name: parts[0].to_string(),
                uid: parts[2].parse().ok()?,
                gid: parts[3].parse().ok()?,
            })
        })
        .collect()
}

/// Parses `/etc/group` content. Malformed lines are skipped.
pub fn parse_group(content: &str) -> Vec<GroupEntry> {
    records(content)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() < 3 {
                return None;
            }
            let members = parts
                .get(3)
                .map(|m| {
                    m.split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            Some(GroupEntry {
                name: parts[0].to_string(),
                gid: parts[2].parse().ok()?,
                members,
            })
        })
        .collect()
}

/// Extracts the principals of sudoers user specifications.
///
/// `Defaults`, alias definitions and include directives are ignored, as are
/// `#`-comments (`#includedir` included). A `#uid` principal is not a
/// comment and is kept verbatim.
pub fn parse_sudoers(content: &str) -> SudoersGrants {
    let mut grants = SudoersGrants::default();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('@') {
            continue;
        }
        if line.starts_with('#') && !is_uid_principal(line) {
            continue;
        }
        let keyword = line.split_whitespace().next().unwrap_or_default();
        if keyword.starts_with("Defaults") || keyword.ends_with("_Alias") {
            continue;
        }
        let compact = compact_lists(line);
        let mut tokens = compact.split_whitespace();
        let (Some(principals), Some(_)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        for principal in principals.split(',').filter(|p| !p.is_empty()) {
            match principal.strip_prefix('%') {
                Some(group) => grants.groups.insert(group.to_string()),
                None => grants.users.insert(principal.to_string()),
            };
        }
    }
    grants
}

/// Removes whitespace around commas so a list reads as one token.
fn compact_lists(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut after_comma = false;
    for c in line.chars() {
        if c == ',' {
            while out.ends_with(char::is_whitespace) {
                out.pop();
            }
            after_comma = true;
            out.push(c);
        } else if c.is_whitespace() && after_comma {
            continue;
        } else {
            after_comma = false;
            out.push(c);
        }
    }
    out
}

fn is_uid_principal(line: &str) -> bool {
    line[1..].starts_with(|c: char| c.is_ascii_digit())
}

/// Builds users from passwd and group records.
///
/// A user belongs to its primary group and to every group listing it.
pub fn resolve_users(passwd: &[PasswdEntry], groups: &[GroupEntry]) -> Vec<User> {
    let mut membership: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
    for group in groups {
        for member in &group.members {
            membership.entry(member.as_str()).or_default().push(group.gid);
        }
    }
    passwd
        .iter()
        .map(|p| {
            let extra = membership.get(p.name.as_str()).into_iter().flatten().copied();
            User::new(p.uid, p.name.clone(), std::iter::once(p.gid).chain(extra))
        })
        .collect()
}

/// Parses `uid(name):gid,gid` as printed by the users script.
pub fn parse_user_line(line: &str) -> Result<User, CollectError> {
    let bad = || CollectError::Parse(format!("invalid user line {line:?}"));
    let (head, gids) = line.split_once(':').ok_or_else(bad)?;
    let (uid, name) = head.split_once('(').ok_or_else(bad)?;
    let name = name.strip_suffix(')').ok_or_else(bad)?;
    let uid = uid.trim().parse().map_err(|_| bad())?;
    let groups = gids
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(|g| g.parse::<u32>().map_err(|_| bad()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(User::new(uid, name, groups))
}

/// Parses `name:gid` as printed by the groups script.
pub fn parse_group_line(line: &str) -> Result<Group, CollectError> {
    let bad = || CollectError::Parse(format!("invalid group line {line:?}"));
    let (name, gid) = line.split_once(':').ok_or_else(bad)?;
    let gid = gid.trim().parse().map_err(|_| bad())?;
    Ok(Group::new(gid, name))
}

/// Parses one uid as printed by the sudoers script.
pub fn parse_sudoer_line(line: &str) -> Result<u32, CollectError> {
    line.trim()
        .parse()
        .map_err(|_| CollectError::Parse(format!("invalid sudoer line {line:?}")))
}

/// Applies `parse` to every non-empty line.
pub fn parse_lines<T>(
    output: &str,
    parse: impl Fn(&str) -> Result<T, CollectError>,
) -> Result<Vec<T>, CollectError> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{GROUP, PASSWD, SUDOERS};

    #[test]
    fn test_parse_passwd() {
        let entries = parse_passwd(PASSWD);
        assert_eq!(entries.len(), 5);
        assert_eq!(
            entries[2],
            PasswdEntry {
                name: "alice".into(),
                uid: 1001,
                gid: 1001
            }
        );
        assert_eq!(entries[4].uid, 65534);
    }

    #[test]
    fn test_parse_passwd_skips_malformed() {
        let entries = parse_passwd("# comment\n\nbroken\nx:x:notanumber:0::/:/bin/sh\nok:x:5:5::/:/bin/sh\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "ok");
    }

    #[test]
    fn test_parse_group_members() {
        let groups = parse_group(GROUP);
        let developers = groups.iter().find(|g| g.name == "developers").unwrap();
        assert_eq!(developers.gid, 1500);
        assert_eq!(developers.members, vec!["alice", "bob"]);
        assert!(groups.iter().find(|g| g.name == "root").unwrap().members.is_empty());
    }

    #[test]
    fn test_parse_sudoers() {
        let grants = parse_sudoers(SUDOERS);
        assert_eq!(grants.users, BTreeSet::from(["root".to_string()]));
        assert_eq!(grants.groups, BTreeSet::from(["sudo".to_string()]));
    }

    #[test]
    fn test_parse_sudoers_aliases_and_lists() {
        let content = "\
User_Alias ADMINS = carol, dave
Cmnd_Alias SHUTDOWN = /sbin/shutdown
ADMINS ALL = SHUTDOWN
erin, %wheel ALL=(ALL) NOPASSWD: ALL
#1005 ALL=(ALL) ALL
@includedir /etc/sudoers.d
";
        let grants = parse_sudoers(content);
        assert!(grants.users.contains("erin"));
        assert!(grants.users.contains("#1005"));
        assert!(grants.users.contains("ADMINS"));
        assert!(!grants.users.contains("carol"));
        assert_eq!(grants.groups, BTreeSet::from(["wheel".to_string()]));
    }

    #[test]
    fn test_resolve_users_membership() {
        let users = resolve_users(&parse_passwd(PASSWD), &parse_group(GROUP));
        let alice = users.iter().find(|u| u.name == "alice").unwrap();
        assert_eq!(alice.groups, BTreeSet::from([27, 1001, 1500]));
        let root = users.iter().find(|u| u.uid == 0).unwrap();
        assert_eq!(root.groups, BTreeSet::from([0]));
    }

    #[test]
    fn test_script_lines() {
        let user = parse_user_line("1001(alice):1001,27,1001").unwrap();
        assert_eq!(user, User::new(1001, "alice", [27, 1001]));

        let lonely = parse_user_line("7(svc):").unwrap();
        assert!(lonely.groups.is_empty());

        assert_eq!(parse_group_line("sudo:27").unwrap(), Group::new(27, "sudo"));
        assert_eq!(parse_sudoer_line(" 0 ").unwrap(), 0);
    }

    #[test]
    fn test_script_lines_malformed() {
        assert!(parse_user_line("alice:1001").is_err());
        assert!(parse_user_line("x(alice:1").is_err());
        assert!(parse_group_line("sudo").is_err());
        assert!(parse_sudoer_line("root").is_err());
    }

    #[test]
    fn test_parse_lines_skips_blank() {
        let uids = parse_lines("0\n\n1001\n", parse_sudoer_line).unwrap();
        assert_eq!(uids, vec![0, 1001]);
        assert!(parse_lines("0\nx\n", parse_sudoer_line).is_err());
    }
}
