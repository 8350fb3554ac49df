// Firewall back-end collaborator.
// `iptables` is shelled out to directly: build an argument vector, run it, check the exit status.

use crate::policy;
use anyhow::Context as _;
use std::{collections, net, process, sync, time};

#[derive(Debug, Clone)]
pub struct Grant {
  pub chain_comment: String,
  pub source: net::Ipv4Addr,
  pub ports: Vec<policy::PortProto>,
  pub nat_target: Option<(net::Ipv4Addr, policy::PortProto)>,
  pub expires_at: time::SystemTime,
}

pub trait Backend: Send + Sync {
  fn install_access(&self, grant: &Grant) -> anyhow::Result<()>;
  /// Sweeps installed grants for expiry. `full_sweep` asks the backend to also
  /// reconcile against the real firewall state (e.g. re-list rules and drop anything stale that
  /// isn't in the in-memory ledger any more), not just check in-memory timers -- cheaper partial
  /// sweeps run every `RULES_CHECK_THRESHOLD` iterations, a full sweep runs less often.
  fn check_and_expire_rules(&self, full_sweep: bool) -> anyhow::Result<()>;
  fn cleanup_all(&self) -> anyhow::Result<()>;
}

/// Shells out to `iptables`. One rule per grant, tagged with a comment so
/// `check_and_expire_rules` can find and remove its own rules without touching anything a human
/// added by hand.
pub struct Iptables {
  exe: std::path::PathBuf,
  enable_nat: bool,
  enable_forwarding: bool,
  installed: sync::Mutex<Vec<Grant>>,
}

impl Iptables {
  pub fn new(exe: std::path::PathBuf, enable_nat: bool, enable_forwarding: bool) -> Self {
    Self {
      exe,
      enable_nat,
      enable_forwarding,
      installed: sync::Mutex::new(Vec::new()),
    }
  }

  fn run(&self, args: &[&str]) -> anyhow::Result<()> {
    let status = process::Command::new(&self.exe)
      .args(args)
      .status()
      .with_context(|| format!("failed to run {:?} {args:?}", self.exe))?;
    anyhow::ensure!(status.success(), "{:?} {args:?} exited with {status}", self.exe);
    Ok(())
  }

  /// Lists the daemon's own rules straight from the kernel and removes any whose `--comment`
  /// isn't in `installed` any more -- catches rules orphaned by a crash between install and
  /// bookkeeping, which the in-memory ledger alone can't see. Only worth the extra `exec` on a
  /// full sweep.
  fn reconcile_with_kernel_state(&self, installed: &[Grant]) -> anyhow::Result<()> {
    let output = process::Command::new(&self.exe)
      .args(["-S", "INPUT"])
      .output()
      .with_context(|| format!("failed to list rules via {:?}", self.exe))?;
    if !output.status.success() {
      anyhow::bail!("{:?} -S INPUT exited with {}", self.exe, output.status);
    }
    let listing = String::from_utf8_lossy(&output.stdout);
    let known: collections::HashSet<&str> = installed.iter().map(|grant| grant.chain_comment.as_str()).collect();
    for line in listing.lines() {
      let Some(comment_start) = line.find("--comment ") else {
        continue;
      };
      let rest = &line[comment_start + "--comment ".len()..];
      let comment = rest.trim_matches('"').split_whitespace().next().unwrap_or("");
      if comment.starts_with("spad-") && !known.contains(comment) {
        log::warn!(target: "spad::firewall", "pruning orphaned rule with comment {comment:?} found on a full sweep");
        let delete_args: Vec<&str> = std::iter::once("-D").chain(line.trim_start_matches("-A ").split_whitespace()).collect();
        let _ = self.run(&delete_args);
      }
    }
    Ok(())
  }
}

impl Backend for Iptables {
  fn install_access(&self, grant: &Grant) -> anyhow::Result<()> {
    for port in &grant.ports {
      let proto = match port.protocol {
        policy::Protocol::Tcp => "tcp",
        policy::Protocol::Udp => "udp",
      };
      self.run(&[
        "-A",
        "INPUT",
        "-s",
        &grant.source.to_string(),
        "-p",
        proto,
        "--dport",
        &port.port.to_string(),
        "-m",
        "comment",
        "--comment",
        &grant.chain_comment,
        "-j",
        "ACCEPT",
      ])?;
    }
    if self.enable_nat {
      if let Some((target_ip, target_port)) = &grant.nat_target {
        anyhow::ensure!(self.enable_forwarding, "NAT grant requested but forwarding is disabled");
        let proto = match target_port.protocol {
          policy::Protocol::Tcp => "tcp",
          policy::Protocol::Udp => "udp",
        };
        self.run(&[
          "-t",
          "nat",
          "-A",
          "PREROUTING",
          "-s",
          &grant.source.to_string(),
          "-p",
          proto,
          "--dport",
          &target_port.port.to_string(),
          "-m",
          "comment",
          "--comment",
          &grant.chain_comment,
          "-j",
          "DNAT",
          "--to-destination",
          &format!("{target_ip}:{}", target_port.port),
        ])?;
      }
    }
    self.installed.lock().unwrap().push(grant.clone());
    Ok(())
  }

  fn check_and_expire_rules(&self, full_sweep: bool) -> anyhow::Result<()> {
    let now = time::SystemTime::now();
    let mut installed = self.installed.lock().unwrap();
    let mut remaining = Vec::with_capacity(installed.len());
    for grant in installed.drain(..) {
      if grant.expires_at <= now {
        for port in &grant.ports {
          let proto = match port.protocol {
            policy::Protocol::Tcp => "tcp",
            policy::Protocol::Udp => "udp",
          };
          let _ = self.run(&[
            "-D",
            "INPUT",
            "-s",
            &grant.source.to_string(),
            "-p",
            proto,
            "--dport",
            &port.port.to_string(),
            "-m",
            "comment",
            "--comment",
            &grant.chain_comment,
            "-j",
            "ACCEPT",
          ]);
        }
      } else {
        remaining.push(grant);
      }
    }
    if full_sweep {
      if let Err(error) = self.reconcile_with_kernel_state(&remaining) {
        log::warn!(target: "spad::firewall", "full sweep reconciliation failed: {error:#}");
      }
    }
    *installed = remaining;
    Ok(())
  }

  fn cleanup_all(&self) -> anyhow::Result<()> {
    let mut installed = self.installed.lock().unwrap();
    for grant in installed.drain(..) {
      for port in &grant.ports {
        let proto = match port.protocol {
          policy::Protocol::Tcp => "tcp",
          policy::Protocol::Udp => "udp",
        };
        let _ = self.run(&[
          "-D",
          "INPUT",
          "-s",
          &grant.source.to_string(),
          "-p",
          proto,
          "--dport",
          &port.port.to_string(),
          "-m",
          "comment",
          "--comment",
          &grant.chain_comment,
          "-j",
          "ACCEPT",
        ]);
      }
    }
    Ok(())
  }
}

/// Used in `--test-mode` and by unit/integration tests: records what it would have done instead
/// of shelling out.
#[derive(Default)]
pub struct Null {
  pub grants: sync::Mutex<Vec<Grant>>,
  pub expired_calls: sync::atomic::AtomicUsize,
}

impl Backend for Null {
  fn install_access(&self, grant: &Grant) -> anyhow::Result<()> {
    self.grants.lock().unwrap().push(grant.clone());
    Ok(())
  }

  fn check_and_expire_rules(&self, _full_sweep: bool) -> anyhow::Result<()> {
    self.expired_calls.fetch_add(1, sync::atomic::Ordering::Relaxed);
    let now = time::SystemTime::now();
    self.grants.lock().unwrap().retain(|grant| grant.expires_at > now);
    Ok(())
  }

  fn cleanup_all(&self) -> anyhow::Result<()> {
    self.grants.lock().unwrap().clear();
    Ok(())
  }
}
