//! CoAP transmission parameters (RFC 7252, section 4.8) and the endpoint
//! limits derived from them.

use std::{
    net::{Ipv4Addr, Ipv6Addr},
    time::Duration,
};

pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

pub const ACK_RANDOM_FACTOR: f64 = 1.5;

pub const MAX_RETRANSMIT: u32 = 4;

/// `ACK_TIMEOUT * (2^(MAX_RETRANSMIT + 1) - 1) * ACK_RANDOM_FACTOR`
pub const MAX_TRANSMIT_SPAN: Duration = Duration::from_secs(93);

pub const MAX_LATENCY: Duration = Duration::from_secs(120);

pub const PROCESSING_DELAY: Duration = Duration::from_secs(2);

/// `MAX_TRANSMIT_SPAN + 2 * MAX_LATENCY + PROCESSING_DELAY`, the lifetime
/// of the MID/token matching tables. The span contribution uses the
/// nominal ACK_TIMEOUT, giving the canonical 247 seconds.
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

/// How long a handler may run before the empty ACK is sent and the real
/// response becomes a separate exchange.
pub const SEPARATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bodies above this many bytes go blockwise.
pub const MAX_PAYLOAD: usize = 1024;

/// After this many NON notifications in a row the next one is sent CON.
pub const MAX_NON_NOTIFICATIONS: u32 = 10;

/// Unacknowledged CON notifications tolerated before the observer is
/// evicted.
pub const MAX_LOST_NOTIFICATION: u32 = 2;

/// The Observe option is 24 bits wide; the counter wraps below this and
/// skips the reserved register/deregister values 0 and 1.
pub const MAX_OBSERVE_COUNT: u32 = (1 << 24) - 1;

pub const MINIMUM_OBSERVE_INTERVAL: Duration = Duration::from_secs(30);

/// Notifications are refreshed this long before their Max-Age expires.
pub const OBSERVING_JITTER: Duration = Duration::from_secs(5);

pub const RECEIVING_BUFFER: usize = 4096;

/// Capacity of every matching table (MID, token, the four block tables and
/// the observe relations).
pub const TRANSACTION_LIST_MAX_SIZE: usize = 1024;

pub const ALL_COAP_NODES: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

pub const ALL_COAP_NODES_IPV6: Ipv6Addr = Ipv6Addr::new(0xFF00, 0, 0, 0, 0, 0, 0, 0xFD);

pub const DISCOVERY_PATH: &str = "/.well-known/core";

pub const DEFAULT_PORT: u16 = 5683;
