//! Building the worker command line and environment.
//!
//! The worker never inherits the supervisor's environment. It gets the
//! identity variables of its account, a fixed PATH and locale, its log
//! level, and whatever names the operator listed in `env_passthrough`.

use std::path::Path;
use std::process::Stdio;

use log::debug;
use tokio::process::Command;

use crate::accounts::{Account, is_root};
use crate::config::{SupervisorConfig, WORKER_LOG_ENV};

/// How the worker process changes to its account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Isolation disabled: run as the supervisor's own user.
    CurrentUser,
    /// Supervisor is root: set uid/gid on the child before exec.
    SetUid,
    /// Supervisor is unprivileged: go through `sudo -n -u <account>`.
    Sudo,
}

impl LaunchMode {
    pub fn select(account: &Account, use_sudo: bool) -> Result<Self, String> {
        if !account.isolated {
            return Ok(Self::CurrentUser);
        }
        if is_root() {
            return Ok(Self::SetUid);
        }
        if use_sudo {
            return Ok(Self::Sudo);
        }
        Err(format!(
            "cannot run as '{}': supervisor is not root and sudo is disabled",
            account.name
        ))
    }
}

/// Explicit environment for a worker of `account`.
pub fn worker_env(config: &SupervisorConfig, account: &Account) -> Vec<(String, String)> {
    let mut env = vec![
        ("HOME".to_string(), account.home.display().to_string()),
        ("USER".to_string(), account.name.clone()),
        ("LOGNAME".to_string(), account.name.clone()),
        ("SHELL".to_string(), account.shell.clone()),
        ("PATH".to_string(), config.worker_path.clone()),
        ("LANG".to_string(), config.worker_lang.clone()),
        (WORKER_LOG_ENV.to_string(), config.worker_log_level.clone()),
    ];

    for name in &config.env_passthrough {
        if env.iter().any(|(key, _)| key == name) {
            continue;
        }
        if let Ok(value) = std::env::var(name) {
            env.push((name.clone(), value));
        }
    }
    env
}

/// Worker arguments: configured prefix args, then socket and home.
pub fn worker_args(config: &SupervisorConfig, socket: &Path, home: &Path) -> Vec<String> {
    let mut args = config.worker_args.clone();
    args.push("--socket".to_string());
    args.push(socket.display().to_string());
    args.push("--home".to_string());
    args.push(home.display().to_string());
    args
}

/// Command that starts the worker for `account`, listening on `socket`.
pub fn worker_command(
    config: &SupervisorConfig,
    account: &Account,
    socket: &Path,
    mode: LaunchMode,
) -> Command {
    let env = worker_env(config, account);
    let args = worker_args(config, socket, &account.home);

    let mut cmd = match mode {
        LaunchMode::Sudo => {
            // sudo resets the environment itself; `env -i` makes the
            // worker's environment exactly the list below.
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "-u", &account.name, "--", "env", "-i"]);
            for (key, value) in &env {
                cmd.arg(format!("{key}={value}"));
            }
            cmd.arg(&config.worker_binary);
            cmd.args(&args);
            cmd
        }
        LaunchMode::SetUid | LaunchMode::CurrentUser => {
            let mut cmd = Command::new(&config.worker_binary);
            cmd.args(&args)
                .env_clear()
                .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .current_dir(&account.home);
            if mode == LaunchMode::SetUid {
                cmd.uid(account.uid).gid(account.gid);
            }
            cmd
        }
    };

    debug!(
        "Worker command for '{}' ({:?}): {} {:?}",
        account.name, mode, config.worker_binary, args
    );

    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn account(isolated: bool) -> Account {
        Account {
            name: "lc_alice".to_string(),
            uid: 2001,
            gid: 2000,
            home: PathBuf::from("/home/lc_alice"),
            shell: "/bin/bash".to_string(),
            isolated,
        }
    }

    #[test]
    fn test_env_is_explicit() {
        let config = SupervisorConfig::default();
        let env = worker_env(&config, &account(true));
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["HOME", "USER", "LOGNAME", "SHELL", "PATH", "LANG", "LODGE_LOG"]
        );
        assert!(env.contains(&("HOME".to_string(), "/home/lc_alice".to_string())));
        assert!(env.contains(&("LOGNAME".to_string(), "lc_alice".to_string())));
    }

    #[test]
    fn test_passthrough_cannot_override_identity() {
        let config = SupervisorConfig {
            env_passthrough: vec!["HOME".to_string(), "LODGE_TEST_UNSET_VAR_Q".to_string()],
            ..SupervisorConfig::default()
        };
        let env = worker_env(&config, &account(true));
        assert_eq!(env.iter().filter(|(k, _)| k == "HOME").count(), 1);
        assert!(!env.iter().any(|(k, _)| k == "LODGE_TEST_UNSET_VAR_Q"));
    }

    #[test]
    fn test_args_end_with_socket_and_home() {
        let config = SupervisorConfig {
            worker_args: vec!["-c".to_string(), "exit 0".to_string()],
            ..SupervisorConfig::default()
        };
        let args = worker_args(
            &config,
            Path::new("/home/lc_alice/.lodge/socket"),
            Path::new("/home/lc_alice"),
        );
        assert_eq!(
            args,
            vec![
                "-c",
                "exit 0",
                "--socket",
                "/home/lc_alice/.lodge/socket",
                "--home",
                "/home/lc_alice"
            ]
        );
    }

    #[test]
    fn test_launch_mode_for_shared_user() {
        assert_eq!(
            LaunchMode::select(&account(false), false).unwrap(),
            LaunchMode::CurrentUser
        );
        if !is_root() {
            assert_eq!(
                LaunchMode::select(&account(true), true).unwrap(),
                LaunchMode::Sudo
            );
            assert!(LaunchMode::select(&account(true), false).is_err());
        }
    }
}
