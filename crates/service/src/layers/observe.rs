//! Resource observation (RFC 7641): the subscription table and the fan-out
//! of notifications.
//!
//! A relation is keyed by `(peer, token)` and pins the transaction of the
//! registering exchange, so notifications reuse its token and destination.
//! The layer never reaches into the tree itself; the resource snapshot
//! travels on the transaction.
//!
//! Lock order: the relations table is taken before any transaction lock,
//! never after one.

use crate::{
    Error,
    cache::LfuCache,
    params::{MAX_NON_NOTIFICATIONS, TRANSACTION_LIST_MAX_SIZE},
    resource::Resource,
    transaction::{TokenKey, Transaction, TransactionState},
};

use std::{sync::Arc, time::Instant};

use codec::{Code, ContentFormat, Message, MessageType};
use parking_lot::Mutex;

pub struct ObserveItem {
    /// When the last notification went out.
    pub timestamp: Instant,
    /// NON notifications sent since the last CON.
    pub non_counter: u32,
    pub allowed: bool,
    pub transaction: Option<Arc<Transaction>>,
    pub content_type: Option<ContentFormat>,
    content_type_known: bool,
    /// Max-Age of the last notification, the freshness deadline.
    pub pmin: Option<u32>,
}

impl ObserveItem {
    fn new(transaction: Option<Arc<Transaction>>, allowed: bool) -> Self {
        Self {
            timestamp: Instant::now(),
            non_counter: 0,
            allowed,
            transaction,
            content_type: None,
            content_type_known: false,
            pmin: None,
        }
    }
}

pub struct ObserveLayer {
    relations: Mutex<LfuCache<TokenKey, ObserveItem>>,
}

impl Default for ObserveLayer {
    fn default() -> Self {
        Self {
            relations: Mutex::new(LfuCache::new(TRANSACTION_LIST_MAX_SIZE)),
        }
    }
}

impl ObserveLayer {
    /// Client side: a request with Observe=0 registers the local end of
    /// the relation before it leaves.
    pub fn send_request(&self, request: &Message) -> Result<(), Error> {
        if request.observe() != Some(0) {
            return Ok(());
        }

        let destination = request
            .destination
            .ok_or_else(|| Error::silent("request destination cannot be computed"))?;

        self.relations.lock().insert(
            TokenKey::new(destination, &request.token),
            ObserveItem::new(None, true),
        );

        Ok(())
    }

    /// Server side: Observe=0 registers or refreshes the subscription,
    /// Observe=1 deregisters it.
    pub fn receive_request(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let (observe, source, token) = {
            let state = transaction.lock();
            (
                state.request.observe(),
                state.request.source,
                state.request.token.clone(),
            )
        };

        if observe != Some(0) && observe != Some(1) {
            return Ok(());
        }

        let source = source.ok_or_else(|| Error::silent("request source cannot be computed"))?;
        let key = TokenKey::new(source, &token);
        let mut relations = self.relations.lock();

        if observe == Some(0) {
            let allowed = relations.contains(&key);
            relations.insert(key, ObserveItem::new(Some(transaction.clone()), allowed));
        } else {
            log::info!("remove subscriber: peer={}", source);
            relations.remove(&key);
        }

        Ok(())
    }

    /// Client side: a CON response belonging to a relation is a
    /// notification the driver must ACK.
    pub fn receive_response(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let (source, token, confirmable) = {
            let state = transaction.lock();
            let Some(response) = state.response.as_ref() else {
                return Ok(());
            };

            (
                response.source,
                response.token.clone(),
                response.kind == Some(MessageType::Confirmable),
            )
        };

        let source = source.ok_or_else(|| Error::silent("response source cannot be computed"))?;

        if confirmable && self.relations.lock().contains(&TokenKey::new(source, &token)) {
            transaction.lock().notification = true;
        }

        Ok(())
    }

    /// Client side: sending RST towards a notifier tears the local
    /// relation down.
    pub fn send_empty(&self, message: &Message) -> Result<(), Error> {
        if message.kind != Some(MessageType::Reset) {
            return Ok(());
        }

        let destination = message
            .destination
            .ok_or_else(|| Error::silent("message destination cannot be computed"))?;

        self.relations
            .lock()
            .remove(&TokenKey::new(destination, &message.token));
        Ok(())
    }

    /// Server side: an RST from a subscriber evicts it, an ACK clears the
    /// lost-notification counter.
    pub fn receive_empty(
        &self,
        empty: &Message,
        transaction: &Arc<Transaction>,
    ) -> Result<(), Error> {
        match empty.kind {
            Some(MessageType::Reset) => {
                let (source, token) = {
                    let state = transaction.lock();
                    (state.request.source, state.request.token.clone())
                };

                let source =
                    source.ok_or_else(|| Error::silent("request source cannot be computed"))?;

                log::info!("remove subscriber: peer={}", source);
                self.relations.lock().remove(&TokenKey::new(source, &token));
                transaction.lock().completed = true;
            }
            Some(MessageType::Acknowledgement) => {
                transaction.lock().notification_not_acknowledged = 0;
            }
            _ => {}
        }

        Ok(())
    }

    /// Server side, outbound pass: stamp the observe counter onto a 2.05
    /// from an observable resource, or tear the relation down when it can
    /// no longer be served.
    pub fn send_response(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let (source, token, code, observable, resource_content_type, observe_count) = {
            let state = transaction.lock();
            (
                state.request.source,
                state.request.token.clone(),
                state.response.as_ref().map(|r| r.code),
                state.resource.as_ref().map(|r| r.observable).unwrap_or(false),
                state.resource.as_ref().and_then(|r| r.content_type),
                state.resource.as_ref().map(|r| r.observe_count),
            )
        };

        let source = source.ok_or_else(|| Error::silent("request source cannot be computed"))?;
        let key = TokenKey::new(source, &token);

        let mut relations = self.relations.lock();
        if !relations.contains(&key) {
            return Ok(());
        }

        if code == Some(Code::Content) {
            if !observable {
                relations.remove(&key);
                return Ok(());
            }

            {
                let item = relations.get_mut(&key).unwrap();
                if item.content_type_known && item.content_type != resource_content_type {
                    relations.remove(&key);
                    drop(relations);
                    return Err(Error::Observe {
                        reason: "content-type changed".to_string(),
                        code: Code::NotAcceptable,
                        transaction: Some(transaction.clone()),
                    });
                }
            }

            let pmin = {
                let mut state = transaction.lock();
                let response = state
                    .response
                    .as_mut()
                    .ok_or_else(|| Error::silent("transaction has no response"))?;

                response.set_observe(observe_count.unwrap_or(0));
                let pmin = response.max_age();
                state.request.clear_observe();
                pmin
            };

            let item = relations.get_mut(&key).unwrap();
            item.allowed = true;
            item.transaction = Some(transaction.clone());
            item.timestamp = Instant::now();
            item.content_type = resource_content_type;
            item.content_type_known = true;
            if pmin.is_some() {
                item.pmin = pmin;
            }
        } else if code.map(|c| c.is_error()).unwrap_or(false) {
            relations.remove(&key);
        }

        Ok(())
    }

    /// Prepare notifications for every observer pinned to `resource`.
    ///
    /// Clears the stale MID so the message layer assigns a fresh one and
    /// decides the transport type: CON when the registration was CON or
    /// too many NONs went out in a row, NON otherwise. The returned
    /// transactions go back through the outbound pipeline.
    pub fn notify(&self, resource: &Resource) -> Vec<Arc<Transaction>> {
        let mut out = Vec::new();
        let mut relations = self.relations.lock();

        for (_, item) in relations.iter_mut() {
            let Some(transaction) = item.transaction.clone() else {
                continue;
            };

            {
                let mut state = transaction.lock();
                let interested = state
                    .resource
                    .as_ref()
                    .map(|r| r.path == resource.path)
                    .unwrap_or(false);

                if !interested {
                    continue;
                }

                Self::stamp_notification(&mut state, item);
                state.resource = Some(resource.clone());
            }

            out.push(transaction);
        }

        out
    }

    /// Prepare a refresh for every relation, due or not; the sweeper
    /// decides which ones actually go out.
    pub fn notify_all(&self) -> Vec<Arc<Transaction>> {
        let mut out = Vec::new();
        let mut relations = self.relations.lock();

        for (_, item) in relations.iter_mut() {
            let Some(transaction) = item.transaction.clone() else {
                continue;
            };

            Self::stamp_notification(&mut transaction.lock(), item);
            out.push(transaction);
        }

        out
    }

    fn stamp_notification(state: &mut TransactionState, item: &mut ObserveItem) {
        if item.non_counter > MAX_NON_NOTIFICATIONS
            || state.request.kind == Some(MessageType::Confirmable)
        {
            state.notification_type = Some(MessageType::Confirmable);
            item.non_counter = 0;
        } else if state.request.kind == Some(MessageType::NonConfirmable) {
            item.non_counter += 1;
            state.notification_type = Some(MessageType::NonConfirmable);
        }

        if let Some(response) = state.response.as_mut() {
            response.mid = None;
        }
    }

    /// Evict the subscriber a notification was addressed to.
    pub fn remove_subscriber(&self, message: &Message) -> Result<(), Error> {
        let destination = message
            .destination
            .ok_or_else(|| Error::silent("message destination cannot be computed"))?;
        let key = TokenKey::new(destination, &message.token);

        log::debug!("remove subscriber: peer={}", destination);
        let item = self.relations.lock().remove(&key);
        if let Some(item) = item {
            if let Some(transaction) = item.transaction {
                transaction.lock().completed = true;
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.relations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.lock().is_empty()
    }
}
