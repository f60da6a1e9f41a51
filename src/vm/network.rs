//! Guest network interface selection and IP discovery.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::settings::VmType;
use crate::{Error, Result};

/// Guest address on Lima's user-mode (SLIRP) network.
pub const SLIRP_GUEST_IP: &str = "192.168.5.15";

/// Interface the guest's services listen on (used for flannel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningInterface {
    pub iface: String,
    pub addr: String,
}

/// Extract the first IPv4 address from `ip --family inet addr show` output.
pub fn parse_inet_addr(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix("inet ")?;
        let addr = rest.split(['/', ' ']).next()?;
        (!addr.is_empty()).then(|| addr.to_string())
    })
}

/// Pick the interface to listen on: bridged `rd0`, then shared `rd1`, then
/// `vznat` on VZ, then `eth0` at `fallback_addr`.  `lookup` returns the
/// IPv4 address of an interface, if it has one.
pub async fn select_listening_interface<F, Fut>(
    allow_privileged: bool,
    admin_access: bool,
    vm_type: VmType,
    fallback_addr: &str,
    events: &EventBus,
    lookup: F,
) -> ListeningInterface
where
    F: Fn(&'static str) -> Fut,
    Fut: Future<Output = Option<String>>,
{
    if allow_privileged {
        if let Some(addr) = lookup("rd0").await {
            info!(%addr, "using bridged network rd0");
            return ListeningInterface {
                iface: "rd0".to_string(),
                addr,
            };
        }
        let shared = lookup("rd1").await;
        if admin_access {
            let body = match &shared {
                Some(addr) => format!("Using shared network address {addr}"),
                None => "Shared network isn't available either. Only network access is via \
                         port forwarding to the host."
                    .to_string(),
            };
            events.notify("Bridged network did not get an IP address.", body);
        }
        if let Some(addr) = shared {
            info!(%addr, "using shared network rd1");
            return ListeningInterface {
                iface: "rd1".to_string(),
                addr,
            };
        }
        warn!("neither rd0 nor rd1 has an IPv4 address");
    }
    if vm_type == VmType::Vz {
        if let Some(addr) = lookup("vznat").await {
            info!(%addr, "using vznat network");
            return ListeningInterface {
                iface: "vznat".to_string(),
                addr,
            };
        }
        warn!("vznat interface has no IPv4 address");
    }
    ListeningInterface {
        iface: "eth0".to_string(),
        addr: fallback_addr.to_string(),
    }
}

/// Find the guest's own address from `/proc/net/route` and
/// `/proc/net/fib_trie`: the local route for `eth0`, then the `/32 host
/// LOCAL` entry inside that network.
pub fn guest_ip_from_proc(route: &str, fib_trie: &str) -> Option<String> {
    let network = route.lines().find_map(|line| {
        let mut cols = line.split_whitespace();
        match (cols.next(), cols.next()) {
            (Some("eth0"), Some(dest)) if dest != "00000000" && dest.len() == 8 => Some(dest),
            _ => None,
        }
    })?;
    // Little-endian hex
    let octets: Vec<String> = (0..4)
        .rev()
        .map(|i| u8::from_str_radix(&network[i * 2..i * 2 + 2], 16).map(|b| b.to_string()))
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let prefix = format!("{}/", octets.join("."));

    let lines: Vec<&str> = fib_trie
        .lines()
        .skip(1)
        .take_while(|l| l.starts_with(char::is_whitespace))
        .skip_while(|l| !l.contains(&prefix))
        .collect();
    lines
        .windows(2)
        .find(|pair| pair[1].contains("/32 host LOCAL"))
        .and_then(|pair| pair[0].split_whitespace().last())
        .map(str::to_string)
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    /// The host-IP discovery schedule: 100ms doubling up to 30s.
    pub fn host_ip(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Call `attempt` until it yields a value or the attempts run out.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let mut delay = self.initial_delay;
        let mut last_error = None;
        for n in 1..=self.max_attempts {
            match attempt().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => debug!(what, attempt = n, "not available yet"),
                Err(e) => {
                    debug!(what, attempt = n, error = %e, "attempt failed");
                    last_error = Some(e);
                }
            }
            if n < self.max_attempts {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, self.max_delay);
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::recoverable(
                "Network Error",
                format!("could not determine {what} after {} attempts", self.max_attempts),
            )
        }))
    }
}
