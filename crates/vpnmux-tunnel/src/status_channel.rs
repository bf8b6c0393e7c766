//! Status channel
//!
//! The VPN client reports its lifecycle out of band: its up/down scripts
//! publish one text line per event on a per-tunnel channel.
//!
//! ```text
//! up <iface> <netGw> <vpnGw> <trustedIp> [dns1,dns2|-] [localIp]
//! down [reason]
//! error [message]
//! pid <n>
//! shutdown
//! ```
//!
//! [`StatusChannelListener`] bridges the asynchronous transport to the
//! supervisor. `start()` and `stop()` block until the transport confirms
//! the (un)subscription, so the supervisor can sequence "listener ready"
//! before spawning the client and "listener detached" before declaring the
//! tunnel stopped.

use crate::bus::{PubSubTransport, SubscriptionHandler, SubscriptionId};
use crate::profile::ProfileId;
use crate::runtime::TunnelLink;
use crossbeam_channel::{bounded, Sender};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Channel name prefix; the profile id follows.
pub const CHANNEL_PREFIX: &str = "vpnmux.tunnel.";

/// Channel carrying the status lines of one tunnel.
pub fn status_channel_name(id: &ProfileId) -> String {
    format!("{CHANNEL_PREFIX}{id}")
}

/// Typed status event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Up(TunnelLink),
    Down { reason: Option<String> },
    Error { message: String },
    Pid(u32),
    Shutdown,
}

impl StatusEvent {
    /// Keyword for logs and task names.
    pub fn keyword(&self) -> &'static str {
        match self {
            StatusEvent::Up(_) => "up",
            StatusEvent::Down { .. } => "down",
            StatusEvent::Error { .. } => "error",
            StatusEvent::Pid(_) => "pid",
            StatusEvent::Shutdown => "shutdown",
        }
    }
}

/// A status line that could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusLineError {
    #[error("empty status line")]
    Empty,

    #[error("unknown status keyword {0:?}")]
    UnknownKeyword(String),

    #[error("malformed {keyword} line: {reason}")]
    Malformed { keyword: String, reason: String },
}

/// Listener / transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("pub/sub transport is closed")]
    TransportClosed,

    #[error("listener on {0} already started")]
    AlreadyStarted(String),

    #[error("listener on {0} not started")]
    NotStarted(String),

    #[error("transport dropped the confirmation for {0}")]
    Unconfirmed(String),
}

static LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_]+)(?:\s+(.*?))?\s*$").expect("status line pattern is valid")
});

/// Parse one status line.
pub fn parse_status_line(line: &str) -> Result<StatusEvent, StatusLineError> {
    if line.trim().is_empty() {
        return Err(StatusLineError::Empty);
    }
    let caps = LINE
        .captures(line)
        .ok_or_else(|| StatusLineError::UnknownKeyword(line.trim().to_string()))?;
    let keyword = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
    let rest = caps.get(2).map_or("", |m| m.as_str());

    match keyword.as_str() {
        "up" => parse_up(rest).map(StatusEvent::Up),
        "down" => Ok(StatusEvent::Down {
            reason: non_empty(rest),
        }),
        "error" => Ok(StatusEvent::Error {
            message: non_empty(rest).unwrap_or_else(|| "unspecified error".to_string()),
        }),
        "pid" => rest
            .parse::<u32>()
            .map(StatusEvent::Pid)
            .map_err(|e| malformed("pid", e.to_string())),
        "shutdown" => Ok(StatusEvent::Shutdown),
        _ => Err(StatusLineError::UnknownKeyword(keyword)),
    }
}

fn parse_up(rest: &str) -> Result<TunnelLink, StatusLineError> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(malformed(
            "up",
            format!("expected at least 4 fields, got {}", fields.len()),
        ));
    }

    let net_gateway = parse_ip("net gateway", fields[1])?;
    let vpn_gateway = parse_ip("vpn gateway", fields[2])?;
    let trusted_ip = parse_ip("trusted ip", fields[3])?;

    let dns_servers = match fields.get(4) {
        None | Some(&"-") => Vec::new(),
        Some(list) => list
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| parse_ip("dns server", s))
            .collect::<Result<Vec<_>, _>>()?,
    };

    let local_ip = match fields.get(5) {
        Some(ip) => parse_ip("local ip", ip)?,
        None => net_gateway,
    };

    Ok(TunnelLink {
        interface: fields[0].to_string(),
        net_gateway,
        vpn_gateway,
        local_ip,
        trusted_ip,
        dns_servers,
    })
}

fn parse_ip(what: &str, value: &str) -> Result<IpAddr, StatusLineError> {
    value
        .parse()
        .map_err(|_| malformed("up", format!("bad {what} {value:?}")))
}

fn malformed(keyword: &str, reason: String) -> StatusLineError {
    StatusLineError::Malformed {
        keyword: keyword.to_string(),
        reason,
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Receives the typed events of one channel.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, event: StatusEvent);
}

/// Transport-side handler for one subscription.
///
/// The transport holds the only strong reference. Dropping it without a
/// confirmation drops the pending handshake sender, which the waiting
/// listener sees as a disconnect.
struct ChannelBridge {
    channel: String,
    listener: Arc<dyn StatusListener>,
    /// Single-shot handshake slot, armed before each (un)subscribe request.
    pending: Mutex<Option<Sender<()>>>,
}

impl ChannelBridge {
    fn arm(&self, tx: Sender<()>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn disarm(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn release(&self, what: &str) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => debug!("Unexpected {} confirmation on {}", what, self.channel),
        }
    }
}

impl SubscriptionHandler for ChannelBridge {
    fn on_message(&self, channel: &str, message: &str) {
        if channel != self.channel {
            return;
        }
        match parse_status_line(message) {
            Ok(event) => {
                debug!("{}: {}", self.channel, message);
                self.listener.on_status(event);
            }
            Err(StatusLineError::UnknownKeyword(keyword)) => {
                info!("Ignoring unknown status {:?} on {}", keyword, self.channel);
            }
            Err(e) => warn!("Bad status line on {}: {}", self.channel, e),
        }
    }

    fn on_subscribed(&self, _channel: &str) {
        self.release("subscribe");
    }

    fn on_unsubscribed(&self, _channel: &str) {
        self.release("unsubscribe");
    }
}

/// Live subscription: the transport's id and a weak handle on its bridge.
struct Subscription {
    id: SubscriptionId,
    bridge: Weak<ChannelBridge>,
}

/// Per-tunnel subscription with a synchronous start/stop handshake.
pub struct StatusChannelListener {
    channel: String,
    transport: Arc<dyn PubSubTransport>,
    listener: Arc<dyn StatusListener>,
    subscription: Option<Subscription>,
}

impl StatusChannelListener {
    pub fn new(
        profile: &ProfileId,
        transport: Arc<dyn PubSubTransport>,
        listener: Arc<dyn StatusListener>,
    ) -> Self {
        Self {
            channel: status_channel_name(profile),
            transport,
            listener,
            subscription: None,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_started(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribe and block until the transport confirms.
    ///
    /// Fails with [`ChannelError::Unconfirmed`] if the transport drops the
    /// handler without confirming.
    pub fn start(&mut self) -> Result<(), ChannelError> {
        if self.subscription.is_some() {
            return Err(ChannelError::AlreadyStarted(self.channel.clone()));
        }

        // Armed before the request goes out, so an early confirmation is
        // buffered rather than lost.
        let (tx, rx) = bounded(1);
        let bridge = Arc::new(ChannelBridge {
            channel: self.channel.clone(),
            listener: self.listener.clone(),
            pending: Mutex::new(Some(tx)),
        });
        let weak = Arc::downgrade(&bridge);

        // Ownership moves to the transport here.
        let id = self.transport.subscribe(&self.channel, bridge)?;
        if rx.recv().is_err() {
            warn!("Subscription to {} dropped unconfirmed", self.channel);
            return Err(ChannelError::Unconfirmed(self.channel.clone()));
        }

        self.subscription = Some(Subscription { id, bridge: weak });
        debug!("Listening on {}", self.channel);
        Ok(())
    }

    /// Unsubscribe and block until the transport confirms.
    pub fn stop(&mut self) -> Result<(), ChannelError> {
        let subscription = self
            .subscription
            .take()
            .ok_or_else(|| ChannelError::NotStarted(self.channel.clone()))?;

        // Nobody holds the bridge any more: the transport already let go.
        let Some(bridge) = subscription.bridge.upgrade() else {
            debug!("Subscription to {} already gone", self.channel);
            return Ok(());
        };
        let (tx, rx) = bounded(1);
        bridge.arm(tx);
        drop(bridge);

        if let Err(e) = self.transport.unsubscribe(subscription.id) {
            if let Some(bridge) = subscription.bridge.upgrade() {
                bridge.disarm();
            }
            return Err(e);
        }
        if rx.recv().is_err() {
            warn!("Unsubscription from {} dropped unconfirmed", self.channel);
            return Err(ChannelError::Unconfirmed(self.channel.clone()));
        }

        debug!("Detached from {}", self.channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DelayedTransport, EventLog};
    use std::time::Duration;

    #[test]
    fn test_parse_up_full() {
        let event =
            parse_status_line("up tun0 10.8.0.1 10.8.0.5 203.0.113.7 10.8.0.1,9.9.9.9 10.8.0.6")
                .unwrap();
        let StatusEvent::Up(link) = event else {
            panic!("expected up, got {event:?}");
        };
        assert_eq!(link.interface, "tun0");
        assert_eq!(link.trusted_ip, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(link.dns_servers.len(), 2);
        assert_eq!(link.local_ip, "10.8.0.6".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_up_minimal() {
        let StatusEvent::Up(link) = parse_status_line("up tun1 10.9.0.1 10.9.0.2 198.51.100.1").unwrap()
        else {
            panic!("expected up");
        };
        assert!(link.dns_servers.is_empty());
        assert_eq!(link.local_ip, link.net_gateway);

        let StatusEvent::Up(link) =
            parse_status_line("up tun1 10.9.0.1 10.9.0.2 198.51.100.1 - 10.9.0.3").unwrap()
        else {
            panic!("expected up");
        };
        assert!(link.dns_servers.is_empty());
        assert_eq!(link.local_ip, "10.9.0.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_up_malformed() {
        assert!(matches!(
            parse_status_line("up tun0 10.8.0.1"),
            Err(StatusLineError::Malformed { .. })
        ));
        assert!(matches!(
            parse_status_line("up tun0 10.8.0.1 nope 203.0.113.7"),
            Err(StatusLineError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_other_keywords() {
        assert_eq!(
            parse_status_line("down ping-restart").unwrap(),
            StatusEvent::Down {
                reason: Some("ping-restart".into())
            }
        );
        assert_eq!(parse_status_line("down").unwrap(), StatusEvent::Down { reason: None });
        assert_eq!(parse_status_line("pid 4242").unwrap(), StatusEvent::Pid(4242));
        assert_eq!(parse_status_line("  shutdown ").unwrap(), StatusEvent::Shutdown);
        assert_eq!(
            parse_status_line("error AUTH_FAILED").unwrap(),
            StatusEvent::Error {
                message: "AUTH_FAILED".into()
            }
        );
        assert!(matches!(parse_status_line("pid abc"), Err(StatusLineError::Malformed { .. })));
    }

    #[test]
    fn test_parse_unknown_and_empty() {
        assert_eq!(
            parse_status_line("reconnecting soon"),
            Err(StatusLineError::UnknownKeyword("reconnecting".into()))
        );
        assert_eq!(parse_status_line("   "), Err(StatusLineError::Empty));
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(status_channel_name(&ProfileId::new("work")), "vpnmux.tunnel.work");
    }

    #[test]
    fn test_start_waits_for_delayed_confirmation() {
        let transport = Arc::new(DelayedTransport::new(Duration::from_millis(150)));
        let events = Arc::new(EventLog::default());
        let mut listener =
            StatusChannelListener::new(&ProfileId::new("work"), transport.clone(), events.clone());

        listener.start().unwrap();
        assert!(transport.is_subscribed("vpnmux.tunnel.work"));
        assert!(listener.is_started());

        transport.deliver("vpnmux.tunnel.work", "pid 77");
        transport.deliver("vpnmux.tunnel.work", "bogus line");
        transport.deliver("vpnmux.tunnel.other", "pid 99");
        assert_eq!(events.events(), vec![StatusEvent::Pid(77)]);

        listener.stop().unwrap();
        assert!(!transport.is_subscribed("vpnmux.tunnel.work"));
        assert!(!listener.is_started());
    }

    #[test]
    fn test_start_twice_and_stop_unstarted() {
        let transport = Arc::new(DelayedTransport::new(Duration::ZERO));
        let events = Arc::new(EventLog::default());
        let mut listener = StatusChannelListener::new(&ProfileId::new("work"), transport, events);

        assert_eq!(
            listener.stop(),
            Err(ChannelError::NotStarted("vpnmux.tunnel.work".into()))
        );
        listener.start().unwrap();
        assert_eq!(
            listener.start(),
            Err(ChannelError::AlreadyStarted("vpnmux.tunnel.work".into()))
        );
        listener.stop().unwrap();
        listener.start().unwrap();
    }

    /// Confirms subscriptions only when told to; unsubscribing just drops
    /// the handler.
    struct ForgetfulTransport {
        confirm_subscribe: bool,
        held: Mutex<Option<Arc<dyn SubscriptionHandler>>>,
    }

    impl ForgetfulTransport {
        fn new(confirm_subscribe: bool) -> Self {
            Self {
                confirm_subscribe,
                held: Mutex::new(None),
            }
        }
    }

    impl PubSubTransport for ForgetfulTransport {
        fn subscribe(
            &self,
            channel: &str,
            handler: Arc<dyn SubscriptionHandler>,
        ) -> Result<SubscriptionId, ChannelError> {
            if self.confirm_subscribe {
                handler.on_subscribed(channel);
                *self.held.lock().unwrap() = Some(handler);
            }
            Ok(SubscriptionId(1))
        }

        fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), ChannelError> {
            self.held.lock().unwrap().take();
            Ok(())
        }
    }

    fn run_with_timeout<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(Duration::from_secs(3))
            .expect("listener call did not return")
    }

    #[test]
    fn test_start_fails_when_transport_drops_handler() {
        let result = run_with_timeout(|| {
            let mut listener = StatusChannelListener::new(
                &ProfileId::new("work"),
                Arc::new(ForgetfulTransport::new(false)),
                Arc::new(EventLog::default()),
            );
            let result = listener.start();
            (result, listener.is_started())
        });
        assert_eq!(
            result,
            (Err(ChannelError::Unconfirmed("vpnmux.tunnel.work".into())), false)
        );
    }

    #[test]
    fn test_stop_fails_when_transport_drops_handler() {
        let result = run_with_timeout(|| {
            let mut listener = StatusChannelListener::new(
                &ProfileId::new("work"),
                Arc::new(ForgetfulTransport::new(true)),
                Arc::new(EventLog::default()),
            );
            listener.start().unwrap();
            let result = listener.stop();
            (result, listener.is_started())
        });
        assert_eq!(
            result,
            (Err(ChannelError::Unconfirmed("vpnmux.tunnel.work".into())), false)
        );
    }

    #[test]
    fn test_subscribe_on_shut_down_bus_fails() {
        let bus = Arc::new(crate::bus::LocalBus::new().unwrap());
        bus.shutdown();
        let result = run_with_timeout(move || {
            let mut listener =
                StatusChannelListener::new(&ProfileId::new("work"), bus, Arc::new(EventLog::default()));
            listener.start()
        });
        assert_eq!(result, Err(ChannelError::TransportClosed));
    }
}
