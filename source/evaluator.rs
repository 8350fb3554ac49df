// C6 -- Access Evaluator. Runs the decoded message through the stanza's policy predicates in
// order. Each predicate either passes, or fails with an explicit instruction for the caller's
// search loop: `Stop` (this packet is done, trying another candidate stanza won't change the
// outcome) or `Keep` (this stanza wasn't the right match, move on to the next candidate).

use crate::{crypto::asymmetric, error::Error, message, policy};
use std::net;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchControl {
  Stop,
  Keep,
}

#[derive(Debug)]
pub struct Rejection {
  pub reason: Error,
  pub control: SearchControl,
}

#[derive(Debug)]
pub enum Request {
  Ports(Vec<policy::PortProto>),
  Services(Vec<String>),
  Command(String),
}

pub struct Grant<'a> {
  pub stanza: &'a policy::Stanza,
  pub message: message::Message,
  pub request: Request,
  /// The IP address the grant is installed for: the embedded source-IP field, unless the client
  /// left it as `0.0.0.0` (meaning "whatever you saw me as"), in which case the packet's
  /// recv-time source IP is substituted.
  pub use_src_ip: net::Ipv4Addr,
}

pub enum Verdict<'a> {
  Grant(Grant<'a>),
  Reject(Rejection),
}

fn reject(reason: Error, control: SearchControl) -> Rejection {
  Rejection { reason, control }
}

fn parse_requested_ports(request: &str) -> Result<Vec<policy::PortProto>, ()> {
  request
    .split(',')
    .map(|item| {
      let (proto, port) = item.split_once('/').ok_or(())?;
      let protocol = match proto.to_ascii_lowercase().as_str() {
        "tcp" => policy::Protocol::Tcp,
        "udp" => policy::Protocol::Udp,
        _ => return Err(()),
      };
      let port = port.parse::<u16>().map_err(|_| ())?;
      Ok(policy::PortProto { protocol, port })
    })
    .collect()
}

fn parse_requested_services(request: &str) -> Vec<String> {
  request.split(',').map(|item| item.trim().to_string()).filter(|item| !item.is_empty()).collect()
}

/// Evaluates one already-decrypted message against one candidate stanza. Does not
/// consult stanza expiration or replay state -- the pipeline coordinator filters those before
/// spending a crypto attempt on a stanza at all.
pub fn evaluate<'a>(
  stanza: &'a policy::Stanza,
  message: message::Message,
  config: &crate::config::Config,
  packet_src_ip: net::Ipv4Addr,
  now: i64,
  signer: Option<&asymmetric::Signer>,
) -> Verdict<'a> {
  // 1. The legacy-access quirk: a legacy request against a stanza that doesn't permit
  // legacy requests stops the search outright, as if no message type could be established at
  // all for a legacy-shaped packet.
  if message.msg_type.is_legacy() && !config.allow_legacy_access_requests {
    return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Stop));
  }

  // 1b. Asymmetric signer allow-list (the "C4 tail"): runs here, after the message has
  // decoded and after the legacy-type check, so a packet that's both legacy-forbidden and
  // unsigned-by-an-untrusted-key stops the search on the legacy check rather than keep-searching
  // on the signer mismatch.
  if let (Some(signer), Some(asymmetric_settings)) = (signer, &stanza.asymmetric) {
    if !asymmetric::check_signer(asymmetric_settings, signer) {
      return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
    }
  }

  // 2. Username, when the stanza requires one.
  if let Some(required) = &stanza.required_username {
    if &message.username != required {
      return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
    }
  }

  // 3. Embedded source-IP handling. `0.0.0.0` is the client's "I don't know my
  // own address" sentinel: the packet's recv-time source IP is substituted for the grant, but
  // only if the stanza doesn't demand a verified match (there's nothing to verify against a
  // wildcard). A non-wildcard embedded IP is used for the grant as-is, checked against the
  // packet's recv-time source when the stanza requires it.
  let use_src_ip = if message.source_ip.is_unspecified() {
    if stanza.require_source_address {
      return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
    }
    packet_src_ip
  } else {
    if stanza.require_source_address && message.source_ip != packet_src_ip {
      return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
    }
    message.source_ip
  };

  // 4. Freshness of the embedded timestamp, independent of the replay store's own age check. A
  // stale timestamp isn't this stanza's call to make final -- another candidate stanza might
  // allow a looser (or no) aging window -- so it's a keep-searching miss, not a hard stop.
  if config.enable_spa_packet_aging {
    let age = now - message.timestamp;
    if age < 0 || age as u64 > config.max_spa_packet_age as u64 {
      return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
    }
  }

  // 5. A client-supplied timeout only makes sense on message types that carry one; anything else
  // is an inconsistent message, not a policy mismatch.
  if message.client_timeout.is_some() && !message.msg_type.has_client_timeout_semantics() {
    return Verdict::Reject(reject(Error::BadData, SearchControl::Stop));
  }

  // 6. Command requests need the stanza to allow command execution at all -- a policy mismatch
  // like the port- and service-allow-list checks below, not a protocol error: another candidate
  // stanza for the same source might have `ENABLE_CMD_EXEC`/`ENABLE_CMD_SUDO_EXEC` on.
  if matches!(message.msg_type, message::MessageType::Command) {
    if !stanza.enable_cmd_exec && !stanza.enable_cmd_sudo_exec {
      return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
    }
    if message.request.is_empty() {
      return Verdict::Reject(reject(Error::BadData, SearchControl::Stop));
    }
    let request = Request::Command(message.request.clone());
    return Verdict::Grant(Grant { stanza, message, request, use_src_ip });
  }

  // 7. Service requests: every requested service-id must be explicitly permitted, and an unknown
  // service is treated as an unambiguous protocol error rather than a policy mismatch.
  if message.msg_type.is_service() {
    let requested = parse_requested_services(&message.request);
    if requested.is_empty() {
      return Verdict::Reject(reject(Error::BadData, SearchControl::Stop));
    }
    if !requested.iter().all(|service| stanza.permitted_services.iter().any(|permitted| permitted == service)) {
      return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Stop));
    }
    let request = Request::Services(requested);
    return Verdict::Grant(Grant { stanza, message, request, use_src_ip });
  }

  // 7b. NAT-mode enablement: a NAT-class request against a server that hasn't
  // turned the corresponding feature on isn't a stanza mismatch -- another stanza can't make NAT
  // support appear -- but it also isn't an unambiguous protocol error, since the packet itself is
  // well-formed and a different server configuration would have accepted it. Treated as a policy
  // miss (keep searching) rather than a hard stop: "not enabled right now" and "not supported at
  // all" are different conditions, and there's no separate compile-time gate in this build to
  // produce the stop-searching half of that distinction.
  if message.msg_type.is_nat() && !config.enable_nat {
    return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
  }
  if message.msg_type.is_local_nat() && !config.enable_local_nat {
    return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
  }

  // 8. Everything else is a port-based access request (plain, NAT, or local-NAT): every requested
  // proto/port pair must be in the stanza's permitted list. Unlike services, a denied port keeps
  // the search going -- another candidate stanza for the same source might still permit it.
  let requested = match parse_requested_ports(&message.request) {
    Ok(ports) if !ports.is_empty() => ports,
    _ => return Verdict::Reject(reject(Error::BadData, SearchControl::Stop)),
  };
  if !requested.iter().all(|wanted| stanza.permitted_ports.iter().any(|permitted| permitted == wanted)) {
    return Verdict::Reject(reject(Error::AccessDenied, SearchControl::Keep));
  }

  // 9. NAT-flavored requests carry a second proto/port pair (the translated destination); it
  // isn't checked against the permitted list (the stanza only governs the externally visible
  // port), but it must be well-formed.
  if (message.msg_type.is_nat() || message.msg_type.is_local_nat()) && message.nat_access.is_some() {
    let nat_access = message.nat_access.as_deref().unwrap();
    let comma = nat_access.find(',');
    let valid = comma
      .map(|index| {
        let (ip, rest) = nat_access.split_at(index);
        ip.parse::<net::Ipv4Addr>().is_ok() && parse_requested_ports(&rest[1..]).is_ok()
      })
      .unwrap_or(false);
    if !valid {
      return Verdict::Reject(reject(Error::BadData, SearchControl::Stop));
    }
  }

  let request = Request::Ports(requested);
  Verdict::Grant(Grant { stanza, message, request, use_src_ip })
}
