//! Matching between messages (by MID) and exchanges (by token).
//!
//! The layer owns the two TTL tables. Inbound CON requests seen twice
//! within EXCHANGE_LIFETIME surface as duplicates so the driver can replay
//! the cached response; inbound responses and empty messages are resolved
//! against the unicast keys first and the all-nodes multicast keys second,
//! so unicast answers to a multicast request find their pending exchange.

use crate::{
    Error, Related,
    cache::TtlCache,
    params::{ALL_COAP_NODES, EXCHANGE_LIFETIME, TRANSACTION_LIST_MAX_SIZE},
    transaction::{MidKey, TokenKey, Transaction},
};

use std::{net::SocketAddr, sync::Arc, time::Instant};

use codec::{Code, Message, MessageType};
use parking_lot::Mutex;
use rand::Rng;

pub struct MessageLayer {
    by_mid: Mutex<TtlCache<MidKey, Arc<Transaction>>>,
    by_token: Mutex<TtlCache<TokenKey, Arc<Transaction>>>,
    current_mid: Mutex<u16>,
}

impl MessageLayer {
    pub fn new(starting_mid: Option<u16>) -> Self {
        Self {
            by_mid: Mutex::new(TtlCache::new(TRANSACTION_LIST_MAX_SIZE, EXCHANGE_LIFETIME)),
            by_token: Mutex::new(TtlCache::new(TRANSACTION_LIST_MAX_SIZE, EXCHANGE_LIFETIME)),
            current_mid: Mutex::new(
                starting_mid.unwrap_or_else(|| rand::rng().random_range(1..65535)),
            ),
        }
    }

    /// The next MID. Sequential, wrapping modulo 65535 — MID 65535 is
    /// never handed out, faithfully to the original generator.
    pub fn fetch_mid(&self) -> u16 {
        let mut current = self.current_mid.lock();
        let mid = *current;
        *current = (*current + 1) % 65535;
        mid
    }

    /// Handle duplicates and store received requests.
    pub fn receive_request(&self, mut request: Message) -> Result<Arc<Transaction>, Error> {
        let source = request
            .source
            .ok_or_else(|| Error::silent("request source cannot be computed"))?;
        let mid = request
            .mid
            .ok_or_else(|| Error::silent("request mid is not set"))?;

        let key_mid = MidKey::new(source, mid);
        let key_token = TokenKey::new(source, &request.token);

        let mut by_mid = self.by_mid.lock();
        if let Some(transaction) = by_mid.get(&key_mid).cloned() {
            if self.by_token.lock().get(&key_token).is_none() {
                log::warn!("duplicated message with different token: source={}", source);
                let mid = transaction.lock().request.mid;
                return Err(Error::protocol("tokens do not match", mid));
            }

            transaction.lock().request.duplicated = true;
            return Ok(transaction);
        }

        request.timestamp = Some(Instant::now());
        let transaction = Transaction::new(request);
        by_mid.insert(key_mid, transaction.clone());
        self.by_token.lock().insert(key_token, transaction.clone());
        Ok(transaction)
    }

    /// Pair a response with its request, by MID first (with a token cross
    /// check), by token alone for separate responses, then the multicast
    /// keys. An unmatched response is ignored with a log line.
    pub fn receive_response(&self, mut response: Message) -> Result<Arc<Transaction>, Error> {
        let source = response
            .source
            .ok_or_else(|| Error::silent("response source cannot be computed"))?;
        let mid = response
            .mid
            .ok_or_else(|| Error::silent("response mid is not set"))?;

        let key_mid = MidKey::new(source, mid);
        let key_token = TokenKey::new(source, &response.token);
        let key_mid_multicast = MidKey::with_host(ALL_COAP_NODES.into(), source, mid);
        let key_token_multicast = TokenKey::with_host(ALL_COAP_NODES.into(), source, &response.token);

        let transaction = {
            let mut by_mid = self.by_mid.lock();
            let mut by_token = self.by_token.lock();

            if let Some(transaction) = by_mid.get(&key_mid).cloned() {
                if response.token != transaction.lock().request.token {
                    return Err(Error::silent(format!(
                        "tokens do not match: response message {}",
                        source
                    )));
                }

                transaction
            } else if let Some(transaction) = by_token.get(&key_token).cloned() {
                transaction
            } else if let Some(transaction) = by_mid.get(&key_mid_multicast).cloned() {
                transaction
            } else if let Some(transaction) = by_token.get(&key_token_multicast).cloned() {
                if response.token != transaction.lock().request.token {
                    return Err(Error::silent(format!(
                        "tokens do not match: response message {}",
                        source
                    )));
                }

                transaction
            } else {
                return Err(Error::silent(format!(
                    "un-matched incoming response message {}",
                    source
                )));
            }
        };

        {
            let mut state = transaction.lock();
            state.request.acknowledged = true;
            response.timestamp = Some(Instant::now());
            if response.kind != Some(MessageType::Confirmable) {
                response.acknowledged = true;
            }

            state.response = Some(response);
        }

        transaction.stop_retransmit();
        Ok(transaction)
    }

    /// Resolve an inbound ACK/RST (or an empty CON, which counts as an
    /// implicit ACK) against the four keys. No match means a CoAP ping.
    pub fn receive_empty(&self, message: &Message) -> Result<Arc<Transaction>, Error> {
        let source = message
            .source
            .ok_or_else(|| Error::silent("message source cannot be computed"))?;
        let mid = message
            .mid
            .ok_or_else(|| Error::silent("message mid is not set"))?;

        let transaction = {
            let mut by_mid = self.by_mid.lock();
            let mut by_token = self.by_token.lock();

            let key_mid = MidKey::new(source, mid);
            let key_token = TokenKey::new(source, &message.token);
            let key_mid_multicast = MidKey::with_host(ALL_COAP_NODES.into(), source, mid);
            let key_token_multicast =
                TokenKey::with_host(ALL_COAP_NODES.into(), source, &message.token);

            let found = by_mid
                .get(&key_mid)
                .cloned()
                .or_else(|| by_token.get(&key_token).cloned())
                .or_else(|| by_mid.get(&key_mid_multicast).cloned())
                .or_else(|| by_token.get(&key_token_multicast).cloned());

            match found {
                Some(transaction) => transaction,
                None => {
                    log::warn!(
                        "un-matched incoming empty message: source={}, mid={}",
                        source,
                        mid,
                    );

                    return Err(Error::Pong {
                        message: Box::new(message.clone()),
                    });
                }
            }
        };

        {
            let mut state = transaction.lock();
            match message.kind {
                Some(MessageType::Acknowledgement) => {
                    if !state.request.acknowledged {
                        state.request.acknowledged = true;
                    } else if let Some(response) = state.response.as_mut() {
                        if !response.acknowledged {
                            response.acknowledged = true;
                        }
                    }
                }
                Some(MessageType::Reset) => {
                    if !state.request.acknowledged {
                        state.request.rejected = true;
                    } else if let Some(response) = state.response.as_mut() {
                        if !response.acknowledged {
                            response.rejected = true;
                        }
                    }
                }
                Some(MessageType::Confirmable) => {
                    // implicit ACK, the explicit one might have been lost
                    log::debug!("implicit ack on received con for waiting transaction");
                    state.request.acknowledged = true;
                }
                _ => return Err(Error::silent("unhandled empty message type")),
            }

            state.retransmit_stop = true;
        }

        transaction.stop_retransmit();
        Ok(transaction)
    }

    /// Create the transaction for an outgoing request and index it under
    /// both keys. The MID is allocated here when the caller left it unset.
    pub fn send_request(&self, mut request: Message) -> Result<Arc<Transaction>, Error> {
        let destination = request
            .destination
            .ok_or_else(|| Error::silent("request destination cannot be computed"))?;

        if request.kind.is_none() {
            return Err(Error::silent("request type is not set"));
        }

        if request.mid.is_none() {
            request.mid = Some(self.fetch_mid());
        }

        request.timestamp = Some(Instant::now());
        let mid = request.mid.unwrap();
        let key_mid = MidKey::new(destination, mid);
        let key_token = TokenKey::new(destination, &request.token);

        let transaction = Transaction::new(request);
        self.by_mid.lock().insert(key_mid, transaction.clone());
        self.by_token.lock().insert(key_token, transaction.clone());
        Ok(transaction)
    }

    /// Derive type, token and MID for the outgoing response and index the
    /// transaction under the response keys (and the multicast keys, when
    /// the request came in on the all-nodes address).
    pub fn send_response(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let (key_mid, key_token, multicast_keys) = {
            let mut state = transaction.lock();
            let request_kind = state.request.kind;
            let request_mid = state.request.mid;
            let request_token = state.request.token.clone();
            let request_acknowledged = state.request.acknowledged;
            let request_source = state.request.source;
            let forced = state.notification_type.take();

            let response = state
                .response
                .as_mut()
                .ok_or_else(|| Error::silent("transaction has no response to send"))?;

            if response.kind.is_none() {
                if request_kind == Some(MessageType::Confirmable) && !request_acknowledged {
                    // piggy-backed
                    response.kind = Some(MessageType::Acknowledgement);
                    response.mid = request_mid;
                    response.acknowledged = true;
                } else if request_kind == Some(MessageType::NonConfirmable) {
                    response.kind = Some(MessageType::NonConfirmable);
                    response.acknowledged = true;
                } else {
                    response.kind = Some(MessageType::Confirmable);
                }
            }

            // A pending notification carries the type the observe layer
            // decided on, unless the response rides an ACK anyway.
            if let Some(kind) = forced {
                if response.kind != Some(MessageType::Acknowledgement) {
                    response.kind = Some(kind);
                    response.acknowledged = kind != MessageType::Confirmable;
                }
            }

            response.token = request_token;
            response.timestamp = Some(Instant::now());
            if response.mid.is_none() {
                response.mid = Some(self.fetch_mid());
            }

            let destination = response
                .destination
                .ok_or_else(|| Error::silent("response destination cannot be computed"))?;

            log::debug!("send_response: {}", response);

            let mid = response.mid.unwrap();
            let key_mid = MidKey::new(destination, mid);
            let key_token = TokenKey::new(destination, &response.token);

            let multicast_keys = request_source.filter(|addr| addr.ip().is_multicast()).map(
                |addr: SocketAddr| {
                    (
                        MidKey::new(addr, mid),
                        TokenKey::new(addr, &response.token),
                    )
                },
            );

            state.request.acknowledged = true;
            (key_mid, key_token, multicast_keys)
        };

        let mut by_mid = self.by_mid.lock();
        let mut by_token = self.by_token.lock();
        by_mid.insert(key_mid, transaction.clone());
        by_token.insert(key_token, transaction.clone());
        if let Some((key_mid, key_token)) = multicast_keys {
            by_mid.insert(key_mid, transaction.clone());
            by_token.insert(key_token, transaction.clone());
        }

        Ok(())
    }

    /// Build the matching empty ACK for the transaction's request or
    /// response and mark it acknowledged.
    pub fn send_empty(
        &self,
        transaction: &Arc<Transaction>,
        related: Related,
    ) -> Result<Message, Error> {
        let (message, key_mid, key_token) = {
            let mut state = transaction.lock();
            let (kind, mid, token, peer) = match related {
                Related::Request => {
                    let request = &mut state.request;
                    if request.kind != Some(MessageType::Confirmable) {
                        return Err(Error::silent("non messages cannot be replied with acks"));
                    }

                    request.acknowledged = true;
                    (request.kind, request.mid, request.token.clone(), request.source)
                }
                Related::Response => {
                    let response = state
                        .response
                        .as_mut()
                        .ok_or_else(|| Error::silent("transaction has no response"))?;
                    if response.kind != Some(MessageType::Confirmable) {
                        return Err(Error::silent("non messages cannot be replied with acks"));
                    }

                    response.acknowledged = true;
                    (
                        response.kind,
                        response.mid,
                        response.token.clone(),
                        response.source,
                    )
                }
            };

            debug_assert_eq!(kind, Some(MessageType::Confirmable));

            let peer =
                peer.ok_or_else(|| Error::silent("ack destination cannot be computed"))?;

            let mut message = Message::new();
            message.kind = Some(MessageType::Acknowledgement);
            message.code = Code::Empty;
            message.mid = mid;
            message.destination = Some(peer);

            let mid = mid.ok_or_else(|| Error::silent("ack mid cannot be computed"))?;
            (message, MidKey::new(peer, mid), TokenKey::new(peer, &token))
        };

        self.by_mid.lock().insert(key_mid, transaction.clone());
        self.by_token.lock().insert(key_token, transaction.clone());

        log::debug!("send_empty: {}", message);
        Ok(message)
    }

    /// Client-originated ping: an empty CON that the peer answers with
    /// RST. Returns the transaction the RST will resolve against.
    pub fn send_ping(&self, mut message: Message) -> Result<Arc<Transaction>, Error> {
        let destination = message
            .destination
            .ok_or_else(|| Error::silent("message destination cannot be computed"))?;

        message.kind = Some(MessageType::Confirmable);
        message.code = Code::Empty;
        if message.mid.is_none() {
            message.mid = Some(self.fetch_mid());
        }

        message.timestamp = Some(Instant::now());

        let mid = message.mid.unwrap();
        let key_mid = MidKey::new(destination, mid);
        let key_token = TokenKey::new(destination, &message.token);

        let transaction = Transaction::new(message);
        self.by_mid.lock().insert(key_mid, transaction.clone());
        self.by_token.lock().insert(key_token, transaction.clone());
        Ok(transaction)
    }
}
