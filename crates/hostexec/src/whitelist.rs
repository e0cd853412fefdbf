//! Operator-controlled command whitelists.
//!
//! Two sets are maintained: one for read-only callers and one for callers
//! allowed to change device state. The write set is always a superset of the
//! read set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default location of the whitelist file on the device.
pub const DEFAULT_WHITELIST_PATH: &str = "/etc/sonic/command_whitelist.yaml";

/// Commands chosen from existing troubleshooting guides. Anything with a
/// chance of impacting a running device lives in [`DEFAULT_WRITE_COMMANDS`].
const DEFAULT_READ_COMMANDS: &[&str] = &[
    "ls", "cat", "echo", "ping", "grep", "dmesg", "zgrep", "tail", "teamshow", "ps", "uptime",
    "awk", "xargs", "show", "TSC",
];

const DEFAULT_WRITE_COMMANDS: &[&str] = &[
    "docker",
    "reboot",
    "mv",
    "systemctl",
    "ip",
    "ifconfig",
    "TSA",
    "TSB",
    "sonic-installer",
    "sonic_installer",
    "config",
    "tcpdump",
    "acl-loader",
    "counterpoll",
    "bcmcmd",
    "redis-cli",
    "sonic-db-cli",
    "sonic-clear",
    "wc",
    "portstat",
    "pfcwd",
    "lspci",
    "pcieutil",
    "include",
    "vtysh",
];

/// Where to load whitelists from.
#[derive(Clone, Debug)]
pub struct WhitelistConfig {
    /// Path of the YAML whitelist file
    pub path: PathBuf,
}

impl WhitelistConfig {
    /// Create a config pointing at the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WHITELIST_PATH)
    }
}

/// Access level of a caller, selecting which whitelist applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    /// May only run commands from the read whitelist
    #[default]
    ReadOnly,
    /// May run commands from the write whitelist
    ReadWrite,
}

/// An immutable set of allowed command names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Whitelist {
    commands: BTreeSet<String>,
}

impl Whitelist {
    /// Returns true if `command` is allowed, compared exactly as written.
    pub fn contains(&self, command: &str) -> bool {
        self.commands.contains(command)
    }

    /// Number of allowed commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing is allowed.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Iterate over the allowed commands in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }

    /// Returns true if every entry of `self` is also in `other`.
    pub fn is_subset(&self, other: &Whitelist) -> bool {
        self.commands.is_subset(&other.commands)
    }
}

impl<S: Into<String>> FromIterator<S> for Whitelist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// The read and write whitelists, loaded once and shared read-only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Whitelists {
    read: Whitelist,
    write: Whitelist,
}

#[derive(Debug, Error)]
enum WhitelistError {
    #[error("failed to read whitelist file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse whitelist file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("key '{0}' is missing")]
    MissingKey(&'static str),
}

#[derive(Debug, Default, Deserialize)]
struct WhitelistFile {
    read_whitelist: Option<Vec<String>>,
    write_whitelist: Option<Vec<String>>,
}

impl Whitelists {
    /// Build the pair. Entries of `read` are folded into `write` so a
    /// read-only command is always usable by a read-write caller.
    pub fn new(read: Whitelist, write: Whitelist) -> Self {
        let write = read.iter().chain(write.iter()).collect();
        Self { read, write }
    }

    /// The conservative built-in pair used when the file cannot be loaded.
    pub fn defaults() -> Self {
        Self::new(
            DEFAULT_READ_COMMANDS.iter().copied().collect(),
            DEFAULT_WRITE_COMMANDS.iter().copied().collect(),
        )
    }

    /// Load the whitelists from `config.path`.
    ///
    /// Never fails: any read, parse, or structural problem is logged and the
    /// [defaults](Self::defaults) are returned instead.
    pub fn load(config: &WhitelistConfig) -> Self {
        match Self::try_load(&config.path) {
            Ok(whitelists) => {
                tracing::info!(
                    path = %config.path.display(),
                    read = whitelists.read.len(),
                    write = whitelists.write.len(),
                    "Loaded command whitelists"
                );
                whitelists
            }
            Err(e) => {
                tracing::warn!(
                    path = %config.path.display(),
                    "Using default whitelists: {}",
                    e
                );
                Self::defaults()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self, WhitelistError> {
        let contents = std::fs::read_to_string(path)?;
        // An empty document deserializes to unit, not a mapping.
        let file: WhitelistFile = if contents.trim().is_empty() {
            WhitelistFile::default()
        } else {
            serde_yaml::from_str(&contents)?
        };
        let read = file
            .read_whitelist
            .ok_or(WhitelistError::MissingKey("read_whitelist"))?;
        let write = file
            .write_whitelist
            .ok_or(WhitelistError::MissingKey("write_whitelist"))?;
        Ok(Self::new(
            read.into_iter().collect(),
            write.into_iter().collect(),
        ))
    }

    /// The read-only whitelist.
    pub fn read(&self) -> &Whitelist {
        &self.read
    }

    /// The read-write whitelist (always a superset of [`read`](Self::read)).
    pub fn write(&self) -> &Whitelist {
        &self.write
    }

    /// The whitelist that applies to a caller with the given access level.
    pub fn for_access(&self, access: AccessLevel) -> &Whitelist {
        match access {
            AccessLevel::ReadOnly => &self.read,
            AccessLevel::ReadWrite => &self.write,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn load_from(contents: Option<&str>) -> Whitelists {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("command_whitelist.yaml");
        if let Some(contents) = contents {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
        }
        Whitelists::load(&WhitelistConfig::new(&path))
    }

    fn names(list: &Whitelist) -> Vec<&str> {
        list.iter().collect()
    }

    #[test]
    fn test_defaults_read_subset_of_write() {
        let defaults = Whitelists::defaults();
        assert!(!defaults.read().is_empty());
        assert!(!defaults.write().is_empty());
        assert!(defaults.read().is_subset(defaults.write()));
        assert!(defaults.write().contains("reboot"));
        assert!(!defaults.read().contains("reboot"));
    }

    #[test]
    fn test_load_valid_file() {
        let lists = load_from(Some(
            "read_whitelist:\n  - cmd1\n  - cmd2\nwrite_whitelist:\n  - cmd3\n  - cmd4\n",
        ));
        assert_eq!(names(lists.read()), vec!["cmd1", "cmd2"]);
        assert_eq!(names(lists.write()), vec!["cmd1", "cmd2", "cmd3", "cmd4"]);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        assert_eq!(load_from(None), Whitelists::defaults());
    }

    #[test]
    fn test_load_malformed_yaml_uses_defaults() {
        assert_eq!(
            load_from(Some("read_whitelist: [cmd1, cmd2")),
            Whitelists::defaults()
        );
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        assert_eq!(load_from(Some("")), Whitelists::defaults());
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        assert_eq!(
            load_from(Some("read_whitelist:\n  - cmd1\n")),
            Whitelists::defaults()
        );
        assert_eq!(
            load_from(Some("write_whitelist:\n  - cmd1\n")),
            Whitelists::defaults()
        );
    }

    #[test]
    fn test_load_wrong_structure_uses_defaults() {
        assert_eq!(
            load_from(Some("read_whitelist: 42\nwrite_whitelist: {a: b}\n")),
            Whitelists::defaults()
        );
    }

    #[test]
    fn test_explicit_empty_lists_are_honoured() {
        let lists = load_from(Some("read_whitelist: []\nwrite_whitelist: []\n"));
        assert!(lists.read().is_empty());
        assert!(lists.write().is_empty());
    }

    #[test]
    fn test_for_access() {
        let lists = Whitelists::new(
            ["ls"].into_iter().collect(),
            ["reboot"].into_iter().collect(),
        );
        assert!(!lists.for_access(AccessLevel::ReadOnly).contains("reboot"));
        assert!(lists.for_access(AccessLevel::ReadWrite).contains("reboot"));
        assert!(lists.for_access(AccessLevel::ReadWrite).contains("ls"));
    }
}
