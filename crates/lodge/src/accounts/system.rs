//! OS account database access.
//!
//! Reads go through `getent` so NSS-backed accounts are visible; writes use
//! the shadow-utils helpers, run directly when root or through `sudo -n`.

use anyhow::{Context, Result};
use log::debug;
use rustix::process::geteuid;
use std::path::{Path, PathBuf};
use std::process::Command;

/// One line of the passwd database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: PathBuf,
    pub shell: String,
}

impl PasswdEntry {
    /// Parse `name:password:uid:gid:gecos:home:shell`.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.trim_end_matches('\n').split(':').collect();
        if parts.len() < 7 {
            return None;
        }
        Some(Self {
            name: parts[0].to_string(),
            uid: parts[2].parse().ok()?,
            gid: parts[3].parse().ok()?,
            gecos: parts[4].to_string(),
            home: PathBuf::from(parts[5]),
            shell: parts[6].to_string(),
        })
    }
}

/// Parameters for a new account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub uid: Option<u32>,
    pub group: String,
    pub extra_groups: Vec<String>,
    pub shell: String,
    pub home: PathBuf,
    pub comment: String,
}

/// Boundary to the OS account database.
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Option<PasswdEntry>>;

    fn group_exists(&self, group: &str) -> Result<bool>;

    fn create_group(&self, group: &str) -> Result<()>;

    fn create_user(&self, account: &NewAccount) -> Result<()>;

    /// Create `entry.home` owned by the account with mode 0700.
    fn ensure_home(&self, entry: &PasswdEntry, group: &str) -> Result<()>;
}

/// [`UserDirectory`] backed by the host's account tools.
#[derive(Debug, Clone)]
pub struct SystemUsers {
    use_sudo: bool,
    uid_start: u32,
}

impl SystemUsers {
    pub fn new(use_sudo: bool, uid_start: u32) -> Self {
        Self {
            use_sudo,
            uid_start,
        }
    }

    /// Next free UID at or above `uid_start`, based on /etc/passwd.
    fn find_next_uid(&self) -> Result<u32> {
        let passwd = std::fs::read_to_string("/etc/passwd").context("reading /etc/passwd")?;
        let max_uid = passwd
            .lines()
            .filter_map(PasswdEntry::parse)
            .map(|entry| entry.uid)
            .filter(|uid| *uid >= self.uid_start && *uid < 60000)
            .max();
        Ok(max_uid.map_or(self.uid_start, |uid| uid + 1))
    }
}

impl UserDirectory for SystemUsers {
    fn lookup(&self, name: &str) -> Result<Option<PasswdEntry>> {
        let output = Command::new("getent")
            .args(["passwd", name])
            .output()
            .context("running getent passwd")?;

        // getent exits 2 when the key is unknown.
        if !output.status.success() {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().next().and_then(PasswdEntry::parse))
    }

    fn group_exists(&self, group: &str) -> Result<bool> {
        let output = Command::new("getent")
            .args(["group", group])
            .output()
            .context("checking if group exists")?;
        Ok(output.status.success())
    }

    fn create_group(&self, group: &str) -> Result<()> {
        run_privileged_command(self.use_sudo, "/usr/sbin/groupadd", &[group])
            .with_context(|| format!("creating group '{group}'"))
    }

    fn create_user(&self, account: &NewAccount) -> Result<()> {
        let uid = match account.uid {
            Some(uid) => uid,
            None => self.find_next_uid()?,
        };
        let home = account.home.to_string_lossy().into_owned();
        let uid_arg = uid.to_string();
        let extra = account.extra_groups.join(",");

        let mut args: Vec<&str> = vec![
            "-u",
            &uid_arg,
            "-g",
            &account.group,
            "-s",
            &account.shell,
            "-d",
            &home,
            "-m",
            "-c",
            &account.comment,
        ];
        if !extra.is_empty() {
            args.push("-G");
            args.push(&extra);
        }
        args.push(&account.name);

        run_privileged_command(self.use_sudo, "/usr/sbin/useradd", &args)
            .with_context(|| format!("creating user '{}'", account.name))
    }

    fn ensure_home(&self, entry: &PasswdEntry, group: &str) -> Result<()> {
        let home = entry.home.to_string_lossy();
        run_privileged_command(
            self.use_sudo,
            "/usr/bin/install",
            &["-d", "-o", &entry.name, "-g", group, "-m", "0700", &home],
        )
        .with_context(|| format!("creating home {} for '{}'", home, entry.name))
    }
}

/// Whether the supervisor itself runs as root.
pub fn is_root() -> bool {
    geteuid().is_root()
}

/// Run a command directly when root, through `sudo -n` otherwise.
pub(crate) fn run_privileged_command(use_sudo: bool, cmd: &str, args: &[&str]) -> Result<()> {
    let output = if use_sudo && !is_root() {
        debug!("Running: sudo {} {:?}", cmd, args);
        Command::new("sudo")
            .arg("-n")
            .arg(cmd)
            .args(args)
            .output()
            .with_context(|| format!("running sudo {} {:?}", cmd, args))?
    } else {
        debug!("Running: {} {:?}", cmd, args);
        Command::new(cmd)
            .args(args)
            .output()
            .with_context(|| format!("running {} {:?}", cmd, args))?
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "Command failed: {} {:?}\nstderr: {}",
            cmd,
            args,
            stderr.trim()
        );
    }

    Ok(())
}

pub(crate) fn home_exists(home: &Path) -> bool {
    home.is_dir()
}
