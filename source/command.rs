// Command-execution collaborator. Every dispatched command runs under a bound:
// `wait-timeout` enforces it instead of trusting the child to exit, and a timed-out child is
// killed rather than left to leak. Privilege-bounded execution sets uid/gid on the spawned child
// via `CommandExt`, never on the daemon's own process.

use crate::{constants, error::Error};
use std::{os::unix::process::CommandExt as _, process, time};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Privilege {
  /// Run as the daemon's own (typically root) identity.
  Direct,
  /// Fork directly into `CMD_EXEC_UID`/`CMD_EXEC_GID`, without going through `sudo`.
  DirectAs { uid: Option<u32>, gid: Option<u32> },
  /// Run as `sudo -u user [-g group] --`.
  Sudo { user: Option<String>, group: Option<String> },
}

impl Privilege {
  fn timeout(&self) -> time::Duration {
    match self {
      Privilege::Direct => time::Duration::from_secs(constants::CMD_DIRECT_TIMEOUT_SECS),
      Privilege::DirectAs { .. } | Privilege::Sudo { .. } => time::Duration::from_secs(constants::CMD_SETUID_TIMEOUT_SECS),
    }
  }
}

/// Runs `command` under a shell, dropping privileges first when `privilege` asks for it, and
/// killing the child if it outruns its timeout class.
pub fn run(sudo_exe: &std::path::Path, command: &str, privilege: Privilege) -> Result<process::ExitStatus, Error> {
  let mut builder = process::Command::new("/bin/sh");
  builder.arg("-c");
  match privilege {
    Privilege::Direct => {
      builder.arg(command);
    }
    Privilege::DirectAs { uid, gid } => {
      builder.arg(command);
      if let Some(gid) = gid {
        builder.gid(gid);
      }
      if let Some(uid) = uid {
        builder.uid(uid);
      }
    }
    Privilege::Sudo { user, group } => {
      let mut sudo_args: Vec<String> = Vec::new();
      if let Some(user) = user {
        sudo_args.push("-u".to_string());
        sudo_args.push(user);
      }
      if let Some(group) = group {
        sudo_args.push("-g".to_string());
        sudo_args.push(group);
      }
      sudo_args.push("--".to_string());
      sudo_args.push("/bin/sh".to_string());
      sudo_args.push("-c".to_string());
      sudo_args.push(command.to_string());
      builder = process::Command::new(sudo_exe);
      builder.args(sudo_args);
    }
  }

  let mut child = builder.spawn().map_err(|_| Error::CommandError)?;
  match wait_timeout::ChildExt::wait_timeout(&mut child, privilege.timeout()).map_err(|_| Error::CommandError)? {
    Some(status) => Ok(status),
    None => {
      let _ = child.kill();
      let _ = child.wait();
      Err(Error::CommandError)
    }
  }
}
