//! Inbound control message handling and outbound message construction.
//!
//! `process_message` validates a raw control packet and applies it to the
//! `SystemState`. Handlers never send anything themselves; replies that the
//! protocol requires are driven by the control loop on its next tick.

use crate::config::CLIENT_IDENTIFICATION_LEN;
use crate::proto::{
    attr, Attribute, GrecpMessage, HelloTimestamp, MessageType, ProtocolError, TunnelType,
};
use crate::session::{LinkState, Session, SystemState};
use std::time::Duration;

/// Ack code sent with filter list acknowledgements (success)
pub const FILTER_LIST_ACK_CODE: u8 = 2;

/// Render bytes as space separated hex for trace output
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Validate a control packet and dispatch it to its handler.
///
/// `now` is the current uptime. Returns the handled message type; every
/// error means the packet was discarded and state is untouched.
pub fn process_message(
    state: &mut SystemState,
    buf: &[u8],
    now: Duration,
) -> Result<MessageType, ProtocolError> {
    let message = GrecpMessage::decode(buf).inspect_err(|e| {
        tracing::warn!("Discarding control message: {e}");
    })?;

    if message.key != state.session.bonding_key && message.message_type != MessageType::Accept {
        tracing::warn!(
            "Discarding {} message with invalid GRE key 0x{:08X}",
            message.message_type,
            message.key
        );
        return Err(ProtocolError::InvalidKey(message.key));
    }

    tracing::debug!(
        "Received {} message for {} tunnel",
        message.message_type,
        message.tunnel_type
    );
    tracing::trace!("Contents of {} message: {}", message.message_type, hex_dump(buf));

    match message.message_type {
        MessageType::Accept => handle_accept(state, &message, now),
        MessageType::Deny => handle_deny(state, &message),
        MessageType::Hello => handle_hello(state, &message, now),
        MessageType::Notify => handle_notify(state, &message),
        MessageType::Teardown => handle_teardown(state, &message),
        MessageType::Request => {
            tracing::warn!("Ignoring request message sent to a client");
        }
    }

    Ok(message.message_type)
}

fn log_unimplemented(message: &GrecpMessage, attribute: &Attribute) {
    tracing::debug!(
        "Unimplemented attribute in {} message received: {}",
        message.message_type,
        attribute.id
    );
}

fn error_code(message: &GrecpMessage) -> u32 {
    message
        .attribute(attr::ERROR_CODE)
        .and_then(Attribute::as_u32)
        .unwrap_or(0)
}

/// Adopt the server's session parameters and establish the link
pub fn handle_accept(state: &mut SystemState, message: &GrecpMessage, now: Duration) {
    let session = &mut state.session;

    for attribute in &message.attributes {
        match attribute.id {
            attr::H_IPV6_ADDRESS => match attribute.as_ipv6() {
                Some(ip) => session.haap_ip = ip,
                None => tracing::warn!("Ignoring HAAP address of {} bytes", attribute.value.len()),
            },
            attr::SESSION_ID => {
                if let Some(id) = attribute.as_u32() {
                    session.session_id = id;
                }
            }
            attr::ACTIVE_HELLO_INTERVAL => {
                if session.active_hello_interval == 0 {
                    if let Some(interval) = attribute.as_u32() {
                        session.active_hello_interval = interval;
                    }
                }
            }
            attr::HELLO_RETRY_TIMES => {
                if session.hello_retry_times == 0 {
                    if let Some(times) = attribute.as_u32() {
                        session.hello_retry_times = times;
                    }
                }
            }
            attr::BONDING_KEY_VALUE => {
                if let Some(key) = attribute.as_u32() {
                    session.bonding_key = key;
                }
            }
            attr::BYPASS_BANDWIDTH_CHECK_INTERVAL => {
                if let Some(interval) = attribute.as_u32() {
                    session.bypass_bandwidth_check_interval = interval;
                }
            }
            attr::PADDING => {}
            _ => log_unimplemented(message, attribute),
        }
    }

    if !state.link(message.tunnel_type).is_established() {
        tracing::info!(
            "{} tunnel established, HAAP {}",
            message.tunnel_type,
            state.session.haap_ip
        );
    }
    state.link_mut(message.tunnel_type).establish(now);
}

/// The server refused our request; the next tick retries
pub fn handle_deny(state: &mut SystemState, message: &GrecpMessage) {
    for attribute in &message.attributes {
        if !matches!(attribute.id, attr::ERROR_CODE | attr::PADDING) {
            log_unimplemented(message, attribute);
        }
    }

    let link = state.link_mut(message.tunnel_type);
    if link.state == LinkState::Requesting {
        link.state = LinkState::Down;
    }
    tracing::error!(
        "HAAP rejected {} tunnel request with error code {}",
        message.tunnel_type,
        error_code(message)
    );
}

/// Hello reply: the echoed timestamp yields the round-trip time
pub fn handle_hello(state: &mut SystemState, message: &GrecpMessage, now: Duration) {
    for attribute in &message.attributes {
        match attribute.id {
            attr::TIMESTAMP => {
                let Some(stamp) = attribute.as_timestamp() else {
                    tracing::warn!("Ignoring short timestamp attribute");
                    continue;
                };
                let sent = stamp.as_duration();
                let link = state.link_mut(message.tunnel_type);
                link.round_trip_time = now.saturating_sub(sent);
                link.last_hello_received = sent;
                link.missed_hellos = 0;
                tracing::debug!(
                    "Round trip time for {}: {:?}",
                    message.tunnel_type,
                    link.round_trip_time
                );
            }
            attr::PADDING => {}
            _ => log_unimplemented(message, attribute),
        }
    }
}

/// Asynchronous signals from the server
pub fn handle_notify(state: &mut SystemState, message: &GrecpMessage) {
    for attribute in &message.attributes {
        match attribute.id {
            attr::FILTER_LIST_PACKAGE => match attribute.as_u32() {
                Some(commit_count) => {
                    state.session.filter_list_commit_count = commit_count;
                    state.session.filter_list_acked = false;
                    tracing::debug!("Filter list commit count now {commit_count}");
                }
                None => tracing::warn!("Ignoring short filter list package"),
            },
            attr::TUNNEL_VERIFICATION => {
                state.lte.tunnel_verification_required = true;
            }
            attr::BYPASS_TRAFFIC_RATE | attr::PADDING => {}
            _ => log_unimplemented(message, attribute),
        }
    }
}

/// The server ended the session; both links go down
pub fn handle_teardown(state: &mut SystemState, message: &GrecpMessage) {
    for attribute in &message.attributes {
        if !matches!(attribute.id, attr::ERROR_CODE | attr::PADDING) {
            log_unimplemented(message, attribute);
        }
    }

    state.lte.state = LinkState::Down;
    state.dsl.state = LinkState::Down;
    tracing::error!(
        "Tunnel(s) terminated by HAAP with error code {}",
        error_code(message)
    );
}

/// Connection request. Only the LTE request identifies the client.
pub fn request(session: &Session, tunnel: TunnelType, client_identification: &str) -> GrecpMessage {
    let mut message = GrecpMessage::new(MessageType::Request, tunnel, session.bonding_key);

    if tunnel == TunnelType::Lte {
        let mut name = [0u8; CLIENT_IDENTIFICATION_LEN];
        let bytes = client_identification.as_bytes();
        let len = bytes.len().min(CLIENT_IDENTIFICATION_LEN);
        name[..len].copy_from_slice(&bytes[..len]);
        message = message.with_attribute(Attribute::new(
            attr::CLIENT_IDENTIFICATION_NAME,
            name.to_vec(),
        ));
    }
    if session.session_id != 0 {
        message = message.with_attribute(Attribute::from_u32(attr::SESSION_ID, session.session_id));
    }
    message.with_attribute(Attribute::padding())
}

/// Liveness probe stamped with the current uptime
pub fn hello(session: &Session, tunnel: TunnelType, stamp: HelloTimestamp) -> GrecpMessage {
    GrecpMessage::new(MessageType::Hello, tunnel, session.bonding_key)
        .with_attribute(Attribute::new(attr::TIMESTAMP, stamp.encode().to_vec()))
        .with_attribute(Attribute::padding())
}

/// Acknowledge the current filter list commit
pub fn filter_list_ack(session: &Session) -> GrecpMessage {
    let mut value = session.filter_list_commit_count.to_be_bytes().to_vec();
    value.push(FILTER_LIST_ACK_CODE);
    GrecpMessage::new(MessageType::Notify, TunnelType::Lte, session.bonding_key)
        .with_attribute(Attribute::new(attr::FILTER_LIST_PACKAGE_ACK, value))
        .with_attribute(Attribute::padding())
}

pub fn tunnel_verification(session: &Session) -> GrecpMessage {
    GrecpMessage::new(MessageType::Notify, TunnelType::Lte, session.bonding_key)
        .with_attribute(Attribute::flag(attr::TUNNEL_VERIFICATION))
        .with_attribute(Attribute::padding())
}

/// Report the failure of the other link over `tunnel`
pub fn link_failure(session: &Session, tunnel: TunnelType) -> GrecpMessage {
    let failed = match tunnel {
        TunnelType::Lte => attr::DSL_LINK_FAILURE,
        TunnelType::Dsl => attr::LTE_LINK_FAILURE,
    };
    GrecpMessage::new(MessageType::Notify, tunnel, session.bonding_key)
        .with_attribute(Attribute::flag(failed))
        .with_attribute(Attribute::padding())
}

pub fn bypass_traffic(session: &Session, kbit: u32) -> GrecpMessage {
    GrecpMessage::new(MessageType::Notify, TunnelType::Dsl, session.bonding_key)
        .with_attribute(Attribute::from_u32(attr::BYPASS_TRAFFIC_RATE, kbit))
        .with_attribute(Attribute::padding())
}
