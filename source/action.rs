// C7 -- Action Dispatcher. Takes an evaluator grant and turns it into an actual
// side effect: a firewall rule, a dispatched command, or (in `--test-mode`) nothing at all.

use crate::{command, config, error::Error, evaluator, firewall, message, policy};
use std::time;

pub enum Dispatched {
  FirewallGrant(firewall::Grant),
  CommandRan,
  TestModeNoop,
}

fn effective_timeout(stanza: &policy::Stanza, message: &message::Message) -> u32 {
  if message.msg_type.has_client_timeout_semantics() {
    if let Some(client_timeout) = message.client_timeout {
      return client_timeout;
    }
  }
  stanza.access_timeout
}

/// The stanza's `ENABLE_CMD_SUDO_EXEC` guard must key off its own sudo user/group fields, never
/// off the non-sudo `CMD_EXEC_USER`/`CMD_EXEC_GROUP` fields.
fn resolve_privilege(stanza: &policy::Stanza) -> command::Privilege {
  if stanza.enable_cmd_sudo_exec {
    command::Privilege::Sudo {
      user: stanza.cmd_sudo_exec_user.clone(),
      group: stanza.cmd_sudo_exec_group.clone(),
    }
  } else if stanza.cmd_exec_uid.is_some() || stanza.cmd_exec_gid.is_some() {
    command::Privilege::DirectAs {
      uid: stanza.cmd_exec_uid,
      gid: stanza.cmd_exec_gid,
    }
  } else {
    command::Privilege::Direct
  }
}

/// Substitutes the handful of placeholders a `CMD_CYCLE_OPEN`/`CMD_CYCLE_CLOSE` template can
/// reference: the grant's resolved source IP and its access timeout in seconds.
fn render_template(template: &str, use_src_ip: std::net::Ipv4Addr, timeout: u32) -> String {
  template.replace("%IP%", &use_src_ip.to_string()).replace("%TIMEOUT%", &timeout.to_string())
}

/// Well-known `PERMIT_SERVICE` names and the single proto/port each one resolves to. spec.md
/// leaves the access-file mapping syntax unspecified, so this is a fixed table rather than a
/// second configuration grammar; a stanza that names a service outside this table can never be
/// granted, regardless of what `OPEN_PORTS` happens to list.
const SERVICE_TABLE: &[(&str, policy::Protocol, u16)] = &[
  ("ssh", policy::Protocol::Tcp, 22),
  ("http", policy::Protocol::Tcp, 80),
  ("https", policy::Protocol::Tcp, 443),
  ("smtp", policy::Protocol::Tcp, 25),
  ("smtps", policy::Protocol::Tcp, 465),
  ("imap", policy::Protocol::Tcp, 143),
  ("imaps", policy::Protocol::Tcp, 993),
  ("pop3", policy::Protocol::Tcp, 110),
  ("pop3s", policy::Protocol::Tcp, 995),
  ("dns", policy::Protocol::Udp, 53),
  ("ftp", policy::Protocol::Tcp, 21),
];

/// Resolves requested service names to their own proto/port pairs. Unlike a port request, the
/// stanza's `OPEN_PORTS` list plays no part here -- a service grant must never fall back to the
/// stanza's entire port-allow-list, or a client validated only for one named service would end up
/// with access to every port the stanza happens to also permit.
fn resolve_services(services: &[String]) -> Result<Vec<policy::PortProto>, Error> {
  services
    .iter()
    .map(|name| {
      SERVICE_TABLE
        .iter()
        .find(|(known, ..)| known.eq_ignore_ascii_case(name))
        .map(|&(_, protocol, port)| policy::PortProto { protocol, port })
        .ok_or(Error::AccessDenied)
    })
    .collect()
}

pub fn dispatch(
  grant: evaluator::Grant<'_>,
  config: &config::Config,
  backend: &dyn firewall::Backend,
) -> Result<Dispatched, Error> {
  let evaluator::Grant { stanza, message, request, use_src_ip } = grant;

  if config.test_mode {
    log::info!(target: "spad::action", "test-mode: would act on request {request:?} from {use_src_ip}");
    return Ok(Dispatched::TestModeNoop);
  }

  // Action 1: a stanza with a command-cycle open template runs that instead of a
  // firewall grant for any granted request -- ports, services, or NAT -- not only for explicit
  // `COMMAND` messages. Only a plain `COMMAND` message (no command-cycle configured) still goes
  // through the `ENABLE_CMD_EXEC` path below.
  if let Some(cycle) = &stanza.command_cycle {
    if !matches!(request, evaluator::Request::Command(_)) {
      let timeout = effective_timeout(stanza, &message);
      let rendered = render_template(&cycle.open, use_src_ip, timeout);
      let status = command::run(&config.sudo_exe, &rendered, resolve_privilege(stanza))?;
      if !status.success() {
        return Err(Error::CommandError);
      }
      return Ok(Dispatched::CommandRan);
    }
  }

  match request {
    evaluator::Request::Command(command_line) => {
      let full_command = match &stanza.command_cycle {
        Some(cycle) => format!("{} {}", render_template(&cycle.open, use_src_ip, stanza.access_timeout), command_line),
        None => command_line,
      };
      let status = command::run(&config.sudo_exe, &full_command, resolve_privilege(stanza))?;
      if !status.success() {
        return Err(Error::CommandError);
      }
      Ok(Dispatched::CommandRan)
    }
    evaluator::Request::Ports(ports) => {
      let grant = firewall::Grant {
        chain_comment: format!("spad-stanza-{}", stanza.number),
        source: use_src_ip,
        ports,
        nat_target: nat_target(&message),
        expires_at: time::SystemTime::now() + time::Duration::from_secs(effective_timeout(stanza, &message) as u64),
      };
      backend.install_access(&grant).map_err(|_| Error::CommandError)?;
      Ok(Dispatched::FirewallGrant(grant))
    }
    evaluator::Request::Services(services) => {
      let ports = resolve_services(&services)?;
      let grant = firewall::Grant {
        chain_comment: format!("spad-stanza-{}", stanza.number),
        source: use_src_ip,
        ports,
        nat_target: None,
        expires_at: time::SystemTime::now() + time::Duration::from_secs(effective_timeout(stanza, &message) as u64),
      };
      backend.install_access(&grant).map_err(|_| Error::CommandError)?;
      Ok(Dispatched::FirewallGrant(grant))
    }
  }
}

fn nat_target(message: &message::Message) -> Option<(std::net::Ipv4Addr, policy::PortProto)> {
  let nat_access = message.nat_access.as_deref()?;
  let (ip, rest) = nat_access.split_once(',')?;
  let ip = ip.parse().ok()?;
  let (proto, port) = rest.split_once('/')?;
  let protocol = match proto.to_ascii_lowercase().as_str() {
    "tcp" => policy::Protocol::Tcp,
    "udp" => policy::Protocol::Udp,
    _ => return None,
  };
  let port = port.parse().ok()?;
  Some((ip, policy::PortProto { protocol, port }))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn stanza() -> policy::Stanza {
    let contents = "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/22\nACCESS_TIMEOUT 45\n";
    policy::parse(contents).unwrap().remove(0)
  }

  fn message() -> message::Message {
    message::Message {
      client_id: 0,
      username: String::new(),
      timestamp: 0,
      version: "2.0.3".to_string(),
      msg_type: message::MessageType::Access,
      source_ip: "192.168.1.7".parse().unwrap(),
      request: "tcp/22".to_string(),
      nat_access: None,
      server_auth: None,
      client_timeout: None,
    }
  }

  #[test]
  fn installs_firewall_grant_for_port_request() {
    let stanza = stanza();
    let backend = firewall::Null::default();
    let grant = evaluator::Grant {
      stanza: &stanza,
      message: message(),
      request: evaluator::Request::Ports(vec![policy::PortProto { protocol: policy::Protocol::Tcp, port: 22 }]),
      use_src_ip: "192.168.1.7".parse().unwrap(),
    };
    let config = config::Config::test_defaults();
    let dispatched = dispatch(grant, &config, &backend).unwrap();
    assert!(matches!(dispatched, Dispatched::FirewallGrant(_)));
    assert_eq!(backend.grants.lock().unwrap().len(), 1);
  }

  #[test]
  fn command_cycle_open_preempts_the_firewall_grant_for_a_port_request() {
    let contents = "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/22\nCMD_CYCLE_OPEN true\nCMD_CYCLE_CLOSE true\n";
    let stanza = policy::parse(contents).unwrap().remove(0);
    let backend = firewall::Null::default();
    let grant = evaluator::Grant {
      stanza: &stanza,
      message: message(),
      request: evaluator::Request::Ports(vec![policy::PortProto { protocol: policy::Protocol::Tcp, port: 22 }]),
      use_src_ip: "192.168.1.7".parse().unwrap(),
    };
    let config = config::Config::test_defaults();
    let dispatched = dispatch(grant, &config, &backend).unwrap();
    assert!(matches!(dispatched, Dispatched::CommandRan));
    assert!(backend.grants.lock().unwrap().is_empty());
  }

  #[test]
  fn service_grant_resolves_to_the_services_own_port_not_the_stanzas_port_list() {
    // OPEN_PORTS is a different, unrelated port from the one `ssh` resolves to -- a grant for
    // the `ssh` service must install tcp/22, never tcp/9999.
    let contents = "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/9999\nPERMIT_SERVICE ssh\n";
    let stanza = policy::parse(contents).unwrap().remove(0);
    let backend = firewall::Null::default();
    let grant = evaluator::Grant {
      stanza: &stanza,
      message: message(),
      request: evaluator::Request::Services(vec!["ssh".to_string()]),
      use_src_ip: "192.168.1.7".parse().unwrap(),
    };
    let config = config::Config::test_defaults();
    let dispatched = dispatch(grant, &config, &backend).unwrap();
    assert!(matches!(dispatched, Dispatched::FirewallGrant(_)));
    let installed = backend.grants.lock().unwrap();
    assert_eq!(installed[0].ports, vec![policy::PortProto { protocol: policy::Protocol::Tcp, port: 22 }]);
  }

  #[test]
  fn service_grant_for_an_unmapped_service_name_is_denied() {
    let contents = "SOURCE 192.168.1.0/24\nKEY_BASE64 dGVzdF9rZXlfMTIzNDU=\nHMAC_KEY_BASE64 aG1hY19rZXlfNjc4OTA=\nOPEN_PORTS tcp/22\nPERMIT_SERVICE not-a-real-service\n";
    let stanza = policy::parse(contents).unwrap().remove(0);
    let backend = firewall::Null::default();
    let grant = evaluator::Grant {
      stanza: &stanza,
      message: message(),
      request: evaluator::Request::Services(vec!["not-a-real-service".to_string()]),
      use_src_ip: "192.168.1.7".parse().unwrap(),
    };
    let config = config::Config::test_defaults();
    let result = dispatch(grant, &config, &backend);
    assert_eq!(result.err(), Some(Error::AccessDenied));
    assert!(backend.grants.lock().unwrap().is_empty());
  }

  #[test]
  fn test_mode_takes_no_action() {
    let stanza = stanza();
    let backend = firewall::Null::default();
    let grant = evaluator::Grant {
      stanza: &stanza,
      message: message(),
      request: evaluator::Request::Ports(vec![policy::PortProto { protocol: policy::Protocol::Tcp, port: 22 }]),
      use_src_ip: "192.168.1.7".parse().unwrap(),
    };
    let mut config = config::Config::test_defaults();
    config.test_mode = true;
    let dispatched = dispatch(grant, &config, &backend).unwrap();
    assert!(matches!(dispatched, Dispatched::TestModeNoop));
    assert!(backend.grants.lock().unwrap().is_empty());
  }
}
