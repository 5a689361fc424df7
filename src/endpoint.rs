//! The endpoint driver: socket I/O, the per-datagram pipeline, and the
//! timer-driven tasks (retransmission, separate ACK) that keep exchanges
//! honest.
//!
//! One task pumps the socket; every datagram is handed to a short-lived
//! handler task that runs the full layer pipeline to completion and maps
//! layer errors to wire behaviour.

use crate::retransmit;

use std::{net::SocketAddr, sync::Arc};

use codec::{Message, MessageType};
use service::{
    Error, Related,
    layers::{BlockLayer, MessageLayer, ObserveLayer, RequestLayer},
    params::{RECEIVING_BUFFER, SEPARATE_TIMEOUT},
    transaction::Transaction,
};
use tokio::{net::UdpSocket, sync::watch};

/// The four protocol layers, shared by every handler task.
pub struct Stack {
    pub message: MessageLayer,
    pub block: BlockLayer,
    pub observe: ObserveLayer,
    pub request: RequestLayer,
}

impl Stack {
    pub fn new(starting_mid: Option<u16>) -> Self {
        Self {
            message: MessageLayer::new(starting_mid),
            block: BlockLayer::default(),
            observe: ObserveLayer::default(),
            request: RequestLayer::default(),
        }
    }
}

pub struct Endpoint {
    socket: Arc<UdpSocket>,
    pub stack: Stack,
    local: SocketAddr,
    stop: watch::Sender<bool>,
}

impl Endpoint {
    /// Bind the endpoint socket. With `multicast` the socket additionally
    /// joins the all-CoAP-nodes group for its address family.
    pub async fn bind(
        listen: SocketAddr,
        multicast: bool,
        starting_mid: Option<u16>,
    ) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(listen).await?;
        let local = socket.local_addr()?;

        if multicast {
            match local {
                SocketAddr::V4(_) => {
                    socket.join_multicast_v4(
                        service::params::ALL_COAP_NODES,
                        std::net::Ipv4Addr::UNSPECIFIED,
                    )?;
                }
                SocketAddr::V6(_) => {
                    socket.join_multicast_v6(&service::params::ALL_COAP_NODES_IPV6, 0)?;
                }
            }

            log::info!("joined all-coap-nodes group: addr={}", local);
        }

        let (stop, _) = watch::channel(false);
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            stack: Stack::new(starting_mid),
            local,
            stop,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Start the receive task: one datagram, one handler task.
    pub fn spawn_receiver(self: &Arc<Self>) {
        let endpoint = self.clone();
        let socket = self.socket.clone();
        let mut stopped = self.stop.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECEIVING_BUFFER];

            loop {
                let received = tokio::select! {
                    received = socket.recv_from(&mut buf) => received,
                    _ = stopped.changed() => break,
                };

                let (size, source) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // remote shutdowns surface here on some platforms
                        log::warn!("udp receive failed: err={}", e);
                        continue;
                    }
                };

                if size < 4 {
                    continue;
                }

                let endpoint = endpoint.clone();
                let data = buf[..size].to_vec();
                tokio::spawn(async move {
                    endpoint.handle_datagram(data, source).await;
                });
            }

            log::info!("udp receiver closed: addr={}", endpoint.local);
        });
    }

    pub async fn handle_datagram(self: &Arc<Self>, data: Vec<u8>, source: SocketAddr) {
        if let Err(error) = self.process_datagram(data, source).await {
            self.handle_error(error, Some(source)).await;
        }
    }

    async fn process_datagram(
        self: &Arc<Self>,
        data: Vec<u8>,
        source: SocketAddr,
    ) -> Result<(), Error> {
        let message = Message::decode(&data, source)?;
        log::debug!("handle datagram: source={}, message={}", source, message);

        if message.is_request() {
            if matches!(
                message.kind,
                Some(MessageType::Acknowledgement) | Some(MessageType::Reset),
            ) {
                return Err(Error::protocol(
                    "requests cannot be carried in rst or ack messages",
                    message.mid,
                ));
            }

            let transaction = self.stack.message.receive_request(message)?;
            self.handle_request(transaction).await
        } else if message.is_response() {
            if message.kind == Some(MessageType::Reset) {
                return Err(Error::protocol(
                    "responses cannot be carried in rst messages",
                    message.mid,
                ));
            }

            let transaction = self.stack.message.receive_response(message)?;
            self.handle_response(transaction).await
        } else {
            if message.kind == Some(MessageType::NonConfirmable) {
                return Err(Error::protocol("non messages cannot be empty", message.mid));
            }

            let transaction = self.stack.message.receive_empty(&message)?;
            self.handle_empty(transaction, message).await
        }
    }

    /// Server side of the pipeline.
    async fn handle_request(self: &Arc<Self>, transaction: Arc<Transaction>) -> Result<(), Error> {
        if transaction.lock().request.duplicated {
            log::warn!("duplicate request");
            let cached = transaction.lock().response.clone();
            match cached {
                // the handler is still running, re-arm the separate ACK
                None => transaction.trigger_separate(),
                Some(_) => {
                    transaction.cancel_separate();
                    self.stack.message.send_response(&transaction)?;
                    let response = transaction.lock().response.clone();
                    if let Some(response) = response {
                        self.send_message(&response).await?;
                    }
                }
            }

            return Ok(());
        }

        self.spawn_separate_tasks(&transaction);

        self.stack.block.receive_request(&transaction)?;
        if transaction.lock().block_transfer {
            // mid-transfer: 2.31 Continue without touching the upper layers
            transaction.cancel_separate();
            self.stack.block.send_response(&transaction)?;
            self.stack.message.send_response(&transaction)?;

            let response = transaction.lock().response.clone();
            if let Some(response) = response {
                self.send_message(&response).await?;
            }

            return Ok(());
        }

        self.stack.observe.receive_request(&transaction)?;
        self.stack.request.receive_request(&transaction).await?;

        {
            let mut state = transaction.lock();
            let local = self.local;
            if let Some(response) = state.response.as_mut() {
                response.source = Some(local);
            }
        }

        self.stack.observe.send_response(&transaction)?;
        self.stack.block.send_response(&transaction)?;

        transaction.cancel_separate();
        self.stack.message.send_response(&transaction)?;

        let response = transaction.lock().response.clone();
        if let Some(response) = response {
            if response.kind == Some(MessageType::Confirmable) {
                retransmit::spawn(self, &transaction, Related::Response);
            }

            self.send_message(&response).await?;
        }

        let resource = transaction.lock().resource.clone();
        if let Some(resource) = resource {
            if resource.changed {
                resource.notify();
            }
        }

        Ok(())
    }

    /// Client side of the pipeline: pair, ACK confirmable responses, run
    /// the inbound passes, wake the waiter.
    async fn handle_response(self: &Arc<Self>, transaction: Arc<Transaction>) -> Result<(), Error> {
        transaction.stop_retransmit();

        let confirmable = {
            let state = transaction.lock();
            state
                .response
                .as_ref()
                .map(|r| r.kind == Some(MessageType::Confirmable))
                .unwrap_or(false)
        };

        if confirmable {
            let ack = self.stack.message.send_empty(&transaction, Related::Response)?;
            self.send_message(&ack).await?;
        }

        self.stack.block.receive_response(&transaction)?;
        self.stack.observe.receive_response(&transaction)?;

        transaction.signal_response();
        Ok(())
    }

    async fn handle_empty(
        self: &Arc<Self>,
        transaction: Arc<Transaction>,
        message: Message,
    ) -> Result<(), Error> {
        let rejected = transaction.lock().request.rejected;
        if !rejected {
            self.stack.observe.receive_empty(&message, &transaction)?;
            transaction.stop_retransmit();
        }

        // A locally-originated exchange (ping, CON request) surfaces the
        // empty message to its waiter; a served exchange keeps its cached
        // response for duplicate replay.
        let locally_originated = transaction.lock().request.source.is_none();
        if locally_originated {
            transaction.lock().response = Some(message);
        }

        transaction.signal_response();
        Ok(())
    }

    /// Re-run an observer's exchange through the pipeline and send the
    /// resulting notification.
    pub async fn renotify(self: &Arc<Self>, transaction: &Arc<Transaction>) -> Result<(), Error> {
        {
            let mut state = transaction.lock();
            state.response = None;
            state.request.clear_block2();
        }

        self.stack.block.receive_request(transaction)?;
        self.stack.observe.receive_request(transaction)?;
        self.stack.request.receive_request(transaction).await?;

        {
            let mut state = transaction.lock();
            let local = self.local;
            if let Some(response) = state.response.as_mut() {
                response.source = Some(local);
            }
        }

        self.stack.observe.send_response(transaction)?;
        self.stack.block.send_response(transaction)?;
        self.stack.message.send_response(transaction)?;

        let response = transaction.lock().response.clone();
        if let Some(response) = response {
            if response.kind == Some(MessageType::Confirmable) {
                retransmit::spawn(self, transaction, Related::Response);
            }

            self.send_message(&response).await?;
        }

        Ok(())
    }

    /// Map a layer error to its wire behaviour.
    pub async fn handle_error(self: &Arc<Self>, error: Error, source: Option<SocketAddr>) {
        match error {
            Error::Protocol { reason, mid } => {
                log::warn!("protocol error: reason={}", reason);
                if let (Some(mid), Some(destination)) = (mid, source) {
                    let mut rst = Message::new();
                    rst.kind = Some(MessageType::Reset);
                    rst.mid = Some(mid);
                    rst.destination = Some(destination);
                    let _ = self.send_message(&rst).await;
                }
            }
            Error::Pong { message } => {
                // classic ping: empty CON answered with RST
                if message.kind == Some(MessageType::Confirmable) {
                    let mut rst = Message::new();
                    rst.kind = Some(MessageType::Reset);
                    rst.mid = message.mid;
                    rst.destination = message.source;
                    let _ = self.send_message(&rst).await;
                }
            }
            Error::Internal {
                reason,
                code,
                transaction,
                ..
            } => {
                log::error!("internal error: reason={}, code={}", reason, code);
                if let Some(transaction) = transaction {
                    transaction.cancel_separate();
                    {
                        let mut state = transaction.lock();
                        let mut response = Message::response_to(&state.request);
                        if response.destination.is_none() {
                            response.destination = source;
                        }

                        response.code = code;
                        response.payload = reason.into_bytes();
                        state.response = Some(response);
                    }

                    if self.stack.message.send_response(&transaction).is_ok() {
                        let response = transaction.lock().response.clone();
                        if let Some(response) = response {
                            let _ = self.send_message(&response).await;
                        }
                    }
                }
            }
            Error::Observe {
                reason,
                code,
                transaction,
            } => {
                log::error!("observe error: reason={}, code={}", reason, code);
                if let Some(transaction) = transaction {
                    transaction.cancel_separate();
                    {
                        let mut state = transaction.lock();
                        if let Some(response) = state.response.as_mut() {
                            response.clear_options();
                            response.payload = reason.into_bytes();
                            response.kind = Some(MessageType::Confirmable);
                            response.code = code;
                        }
                    }

                    if self.stack.message.send_response(&transaction).is_ok() {
                        let response = transaction.lock().response.clone();
                        if let Some(response) = response {
                            let _ = self.send_message(&response).await;
                        }
                    }
                }
            }
            Error::Silent { reason } => {
                log::warn!("{}", reason);
            }
        }
    }

    /// Encode and put one message on the wire.
    pub async fn send_message(&self, message: &Message) -> Result<(), Error> {
        let destination = message
            .destination
            .ok_or_else(|| Error::silent("message destination cannot be computed"))?;

        let bytes = message.encode().map_err(Error::from)?;
        self.socket
            .send_to(&bytes, destination)
            .await
            .map_err(|e| Error::silent(format!("udp send failed: {}", e)))?;

        Ok(())
    }

    /// Arm the separate-response machinery for a fresh request: a task
    /// that sends the empty ACK once the event fires, and the timer that
    /// fires the event when the handler overruns SEPARATE_TIMEOUT.
    fn spawn_separate_tasks(self: &Arc<Self>, transaction: &Arc<Transaction>) {
        let ack_task = {
            let endpoint = self.clone();
            let transaction = transaction.clone();
            tokio::spawn(async move {
                transaction.wait_send_separate().await;

                let pending = {
                    let state = transaction.lock();
                    !state.request.acknowledged
                        && state.request.kind == Some(MessageType::Confirmable)
                };

                if pending {
                    log::debug!("send empty ack");
                    if let Ok(ack) = endpoint
                        .stack
                        .message
                        .send_empty(&transaction, Related::Request)
                    {
                        let _ = endpoint.send_message(&ack).await;
                    }
                }
            })
        };

        let timer = {
            let transaction = transaction.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SEPARATE_TIMEOUT).await;

                let pending = {
                    let state = transaction.lock();
                    !state.request.acknowledged
                        && state.request.kind == Some(MessageType::Confirmable)
                };

                if pending {
                    transaction.trigger_separate();
                }
            })
        };

        let mut state = transaction.lock();
        state.separate_task = Some(ack_task);
        state.separate_timer = Some(timer);
    }
}
