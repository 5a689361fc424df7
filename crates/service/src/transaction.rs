//! The shared per-exchange state object.
//!
//! A transaction is created by the message layer when a request enters or
//! leaves the endpoint, is referenced by every layer for the lifetime of
//! the exchange, and falls out of the TTL tables after EXCHANGE_LIFETIME.
//! Tasks coordinate through it: the response slot plus its notifier stand
//! in for a condition variable, the separate-ACK event is a sticky flag
//! with a notifier, and the retransmit and separate task handles allow
//! cancellation from the matching side.

use crate::resource::Resource;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use codec::{Message, MessageType};
use parking_lot::{Mutex, MutexGuard};
use tokio::{sync::Notify, task::JoinHandle, time::timeout};

/// Exchange key by message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidKey {
    pub host: IpAddr,
    pub port: u16,
    pub mid: u16,
}

impl MidKey {
    pub fn new(addr: SocketAddr, mid: u16) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            mid,
        }
    }

    pub fn with_host(host: IpAddr, addr: SocketAddr, mid: u16) -> Self {
        Self {
            host,
            port: addr.port(),
            mid,
        }
    }
}

/// Exchange key by token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub host: IpAddr,
    pub port: u16,
    pub token: Vec<u8>,
}

impl TokenKey {
    pub fn new(addr: SocketAddr, token: &[u8]) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            token: token.to_vec(),
        }
    }

    pub fn with_host(host: IpAddr, addr: SocketAddr, token: &[u8]) -> Self {
        Self {
            host,
            port: addr.port(),
            token: token.to_vec(),
        }
    }
}

pub struct TransactionState {
    pub request: Message,
    pub response: Option<Message>,
    /// Snapshot of the resource the request was dispatched to.
    pub resource: Option<Resource>,
    pub timestamp: Instant,
    /// A blockwise transfer is mid-flight; the request layer is skipped.
    pub block_transfer: bool,
    /// The response is an observe notification.
    pub notification: bool,
    /// Message type forced by the observe layer for the next notification.
    pub notification_type: Option<MessageType>,
    pub notification_not_acknowledged: u32,
    pub completed: bool,
    pub retransmit_stop: bool,
    pub retransmit_task: Option<JoinHandle<()>>,
    pub separate_task: Option<JoinHandle<()>>,
    pub separate_timer: Option<JoinHandle<()>>,
    separate_triggered: bool,
}

pub struct Transaction {
    state: Mutex<TransactionState>,
    response_available: Notify,
    send_separate: Notify,
}

impl Transaction {
    pub fn new(request: Message) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransactionState {
                request,
                response: None,
                resource: None,
                timestamp: Instant::now(),
                block_transfer: false,
                notification: false,
                notification_type: None,
                notification_not_acknowledged: 0,
                completed: false,
                retransmit_stop: false,
                retransmit_task: None,
                separate_task: None,
                separate_timer: None,
                separate_triggered: false,
            }),
            response_available: Notify::new(),
            send_separate: Notify::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock()
    }

    /// Deposit a response and wake the waiter. A late response after the
    /// waiter gave up is simply overwritten by the next exchange.
    pub fn signal_response(&self) {
        self.response_available.notify_waiters();
    }

    pub fn clear_response(&self) {
        self.state.lock().response = None;
    }

    /// Wait until a response has been deposited, up to `timeout`. Expiry
    /// returns `None` without tearing the transaction down; the caller may
    /// wait again.
    pub async fn wait_response(&self, wait: Duration) -> Option<Message> {
        let deadline = Instant::now() + wait;

        loop {
            let mut notified = std::pin::pin!(self.response_available.notified());
            notified.as_mut().enable();

            if let Some(response) = self.state.lock().response.clone() {
                return Some(response);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            if timeout(deadline - now, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Arm the "send the separate empty ACK now" event. Sticky, like the
    /// event it models: a task that starts waiting afterwards fires
    /// immediately.
    pub fn trigger_separate(&self) {
        self.state.lock().separate_triggered = true;
        self.send_separate.notify_waiters();
    }

    pub async fn wait_send_separate(&self) {
        loop {
            let mut notified = std::pin::pin!(self.send_separate.notified());
            notified.as_mut().enable();

            if self.state.lock().separate_triggered {
                return;
            }

            notified.await;
        }
    }

    /// Stop and cancel the retransmission loop, if one is running.
    pub fn stop_retransmit(&self) {
        let task = {
            let mut state = self.state.lock();
            state.retransmit_stop = true;
            state.retransmit_task.take()
        };

        if let Some(task) = task {
            task.abort();
        }
    }

    /// Cancel the separate-ACK machinery once a piggy-backed response is
    /// certain.
    pub fn cancel_separate(&self) {
        let (task, timer) = {
            let mut state = self.state.lock();
            (state.separate_task.take(), state.separate_timer.take())
        };

        if let Some(task) = task {
            task.abort();
        }

        if let Some(timer) = timer {
            timer.abort();
        }
    }

    /// Fire the separate-ACK task and wait for it to finish sending.
    pub async fn flush_separate(&self) {
        self.trigger_separate();
        let task = self.state.lock().separate_task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "Transaction {{ request: {}, response: {} }}",
            state.request,
            state
                .response
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}
