// UDP receive loop and housekeeping: a bounded amount of work per wakeup, periodic
// firewall-rule and digest-store maintenance interleaved with packet handling.

use crate::{config, digest, firewall, packet, pipeline, policy};
use anyhow::Context as _;
use std::{net, sync, time};

static SHUTDOWN: sync::atomic::AtomicBool = sync::atomic::AtomicBool::new(false);

extern "C" fn handle_signal(_: nix::libc::c_int) {
  SHUTDOWN.store(true, sync::atomic::Ordering::SeqCst);
}

fn install_signal_handlers() -> anyhow::Result<()> {
  // SAFETY: the handler only performs an atomic store, which is async-signal-safe.
  unsafe {
    let action = nix::sys::signal::SigAction::new(
      nix::sys::signal::SigHandler::Handler(handle_signal),
      nix::sys::signal::SaFlags::empty(),
      nix::sys::signal::SigSet::empty(),
    );
    nix::sys::signal::sigaction(nix::sys::signal::Signal::SIGTERM, &action)?;
    nix::sys::signal::sigaction(nix::sys::signal::Signal::SIGINT, &action)?;
    nix::sys::signal::sigaction(nix::sys::signal::Signal::SIGHUP, &action)?;
  }
  Ok(())
}

fn bind(config: &config::Config) -> anyhow::Result<socket2::Socket> {
  let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
    .with_context(|| "couldn't create UDP socket")?;
  socket.set_nonblocking(true)?;
  socket.set_reuse_address(true)?;
  let address = net::SocketAddrV4::new(config.listen_address, config.listen_port);
  socket.bind(&address.into()).with_context(|| format!("couldn't bind {address}"))?;
  Ok(socket)
}

/// Runs the receive loop until a SIGTERM/SIGINT/SIGHUP is observed, then flushes the digest store
/// and tears down every installed firewall rule before returning. There's no separate
/// reload-on-SIGHUP behavior -- all three signals request the same graceful shutdown.
pub fn run(config: &config::Config, policy: &policy::Policy, digests: &digest::Store, backend: &dyn firewall::Backend) -> anyhow::Result<()> {
  install_signal_handlers()?;
  let socket = bind(config)?;
  let mut buffer = vec![std::mem::MaybeUninit::new(0u8); crate::constants::MAX_SPA_PACKET_LEN];
  let mut iterations: u32 = 0;
  let mut checks: u32 = 0;

  log::info!(target: "spad::server", "listening on {}:{}", config.listen_address, config.listen_port);

  while !SHUTDOWN.load(sync::atomic::Ordering::SeqCst) {
    match socket.recv_from(&mut buffer) {
      Ok((len, from)) => {
        let Some(from) = from.as_socket_ipv4() else {
          continue; // IPv4-only listener; an IPv6 peer address would be a kernel/socket bug.
        };
        let raw: Vec<u8> = buffer[..len].iter().map(|byte| unsafe { byte.assume_init() }).collect();
        let recv = packet::RecvMeta {
          src_ip: *from.ip(),
          dst_ip: config.listen_address,
          src_port: from.port(),
          dst_port: config.listen_port,
        };
        let now = time::SystemTime::now().duration_since(time::UNIX_EPOCH).unwrap().as_secs() as i64;
        let disposition = pipeline::handle(&raw, recv, config, policy, digests, backend, now);
        log_disposition(&disposition, recv);
      }
      Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
        std::thread::sleep(config.udpserv_select_timeout);
      }
      Err(error) => {
        log::warn!(target: "spad::server", "recv failed: {error}");
      }
    }

    iterations += 1;
    if iterations >= config.rules_check_threshold {
      iterations = 0;
      checks += 1;
      let full_sweep = checks >= crate::constants::FULL_SWEEP_EVERY_N_CHECKS;
      if full_sweep {
        checks = 0;
      }
      if let Err(error) = backend.check_and_expire_rules(full_sweep) {
        log::warn!(target: "spad::server", "firewall rule sweep failed: {error:#}");
      }
      if config.enable_digest_persistence {
        if let Err(error) = digests.compact() {
          log::warn!(target: "spad::server", "digest store compaction failed: {error:#}");
        }
      }
    }
  }

  log::info!(target: "spad::server", "shutting down");
  digests.flush().with_context(|| "couldn't flush digest store on shutdown")?;
  backend.cleanup_all().with_context(|| "couldn't clean up firewall rules on shutdown")?;
  Ok(())
}

/// Every drop gets exactly one WARNING/ERROR line naming the source IP and, when the packet made
/// it far enough to be tried against a stanza, that stanza's number. No plaintext, key
/// material, or digest bytes are logged at any point -- only the stable `Error` reason code.
fn log_disposition(disposition: &pipeline::Disposition, recv: packet::RecvMeta) {
  match disposition {
    pipeline::Disposition::Dispatched(_) => {
      log::info!(target: "spad::server", "granted access to {}", recv.src_ip);
    }
    pipeline::Disposition::Denied(reason, None) => {
      log::warn!(target: "spad::server", "denied {} from {}", reason.as_str(), recv.src_ip);
    }
    pipeline::Disposition::Denied(reason, Some(stanza_number)) => {
      log::warn!(target: "spad::server", "denied {} from {} (stanza {stanza_number})", reason.as_str(), recv.src_ip);
    }
  }
}
