//! Protocol state machines of the CoAP endpoint.
//!
//! The wire layer lives in the codec crate; this crate owns everything
//! between a decoded message and the socket: the per-exchange transaction,
//! the bounded matching caches, and the four layers the pipeline runs
//! through (message, block, observe, request). Each layer has an inbound
//! and an outbound pass; the endpoint driver wires them together in a
//! fixed order and maps layer errors to wire behaviour.

pub mod cache;
pub mod layers;
pub mod params;
pub mod resource;
pub mod transaction;
pub mod tree;

use crate::transaction::Transaction;

use std::sync::Arc;

use codec::{Code, Message};

/// Which message of an exchange an ACK/RST refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Related {
    Request,
    Response,
}

/// Layer errors, one variant per wire behaviour.
///
/// * `Protocol` rejects the datagram with an RST carrying the captured MID.
/// * `Pong` answers an unmatched empty CON with an RST (CoAP ping).
/// * `Internal` synthesises a response with the given code on the open
///   transaction and pushes it through the outbound pipeline.
/// * `Observe` delivers the code as a CON notification, then evicts the
///   subscriber.
/// * `Silent` is logged and dropped.
pub enum Error {
    Protocol {
        reason: String,
        mid: Option<u16>,
    },
    Pong {
        message: Box<Message>,
    },
    Internal {
        reason: String,
        code: Code,
        transaction: Option<Arc<Transaction>>,
        related: Related,
    },
    Observe {
        reason: String,
        code: Code,
        transaction: Option<Arc<Transaction>>,
    },
    Silent {
        reason: String,
    },
}

impl Error {
    pub fn protocol(reason: impl Into<String>, mid: Option<u16>) -> Self {
        Error::Protocol {
            reason: reason.into(),
            mid,
        }
    }

    pub fn silent(reason: impl Into<String>) -> Self {
        Error::Silent {
            reason: reason.into(),
        }
    }

    pub fn internal(
        reason: impl Into<String>,
        code: Code,
        transaction: Option<Arc<Transaction>>,
        related: Related,
    ) -> Self {
        Error::Internal {
            reason: reason.into(),
            code,
            transaction,
            related,
        }
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Error::Protocol {
            reason: value.to_string(),
            mid: value.mid(),
        }
    }
}

impl std::error::Error for Error {}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Protocol { reason, mid } => {
                write!(f, "Protocol {{ reason: {:?}, mid: {:?} }}", reason, mid)
            }
            Error::Pong { message } => write!(f, "Pong {{ mid: {:?} }}", message.mid),
            Error::Internal { reason, code, .. } => {
                write!(f, "Internal {{ reason: {:?}, code: {} }}", reason, code)
            }
            Error::Observe { reason, code, .. } => {
                write!(f, "Observe {{ reason: {:?}, code: {} }}", reason, code)
            }
            Error::Silent { reason } => write!(f, "Silent {{ reason: {:?} }}", reason),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
