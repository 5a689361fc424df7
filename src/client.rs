//! The client front-end: request helpers that hide token handling, the
//! separate-response dance and blockwise continuation.

use crate::{endpoint::Endpoint, retransmit};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use codec::{BlockValue, Code, ContentFormat, Message, MessageType};
use service::{Error, Related, params::MAX_LATENCY, transaction::Transaction};

use rand::Rng;
use tokio::sync::{mpsc::UnboundedSender, watch};

pub struct CoapClient {
    endpoint: Arc<Endpoint>,
    remote: SocketAddr,
}

impl CoapClient {
    /// Open a client endpoint towards `remote` on an ephemeral local
    /// port of the matching address family.
    pub async fn connect(remote: SocketAddr) -> anyhow::Result<Self> {
        let listen: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };

        let endpoint = Endpoint::bind(listen, false, None).await?;
        endpoint.spawn_receiver();

        Ok(Self { endpoint, remote })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn stop(&self) {
        self.endpoint.stop();
    }

    /// A request skeleton towards this client's peer, with a fresh token.
    pub fn request(&self, code: Code, path: &str) -> Message {
        let mut request = Message::request(MessageType::Confirmable, code, self.remote);
        request.set_uri_path(path);
        request.token = rand::rng().random::<[u8; 4]>().to_vec();
        request
    }

    /// Run a request through the outbound pipeline and send it. The
    /// returned transaction collects whatever comes back.
    pub async fn send_request(&self, mut request: Message) -> Result<Arc<Transaction>, Error> {
        self.endpoint.stack.observe.send_request(&request)?;
        self.endpoint.stack.block.send_request(&mut request)?;
        let transaction = self.endpoint.stack.message.send_request(request)?;

        let confirmable =
            transaction.lock().request.kind == Some(MessageType::Confirmable);
        if confirmable {
            retransmit::spawn(&self.endpoint, &transaction, Related::Request);
        }

        let message = transaction.lock().request.clone();
        self.endpoint.send_message(&message).await?;
        Ok(transaction)
    }

    /// Wait for a response on the transaction, skipping over the empty
    /// ACK that announces a separate response.
    pub async fn receive_response(
        &self,
        transaction: &Arc<Transaction>,
        timeout: Duration,
    ) -> Option<Message> {
        let response = transaction.wait_response(timeout).await?;
        if response.code == Code::Empty
            && response.kind == Some(MessageType::Acknowledgement)
        {
            // separate response will follow
            transaction.clear_response();
            return transaction.wait_response(timeout).await;
        }

        Some(response)
    }

    pub async fn get(&self, path: &str, timeout: Duration) -> anyhow::Result<Option<Message>> {
        self.execute(self.request(Code::Get, path), timeout).await
    }

    pub async fn get_non(&self, path: &str, timeout: Duration) -> anyhow::Result<Option<Message>> {
        let mut request = self.request(Code::Get, path);
        request.kind = Some(MessageType::NonConfirmable);
        self.execute(request, timeout).await
    }

    /// Fetch `/.well-known/core`.
    pub async fn discover(&self, timeout: Duration) -> anyhow::Result<Option<Message>> {
        self.execute(self.request(Code::Get, "/.well-known/core"), timeout)
            .await
    }

    pub async fn put(
        &self,
        path: &str,
        payload: impl Into<Vec<u8>>,
        format: Option<ContentFormat>,
        timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let mut request = self.request(Code::Put, path);
        request.payload = payload.into();
        if let Some(format) = format {
            request.set_content_format(format);
        }

        self.execute(request, timeout).await
    }

    pub async fn put_non(
        &self,
        path: &str,
        payload: impl Into<Vec<u8>>,
        format: Option<ContentFormat>,
        timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let mut request = self.request(Code::Put, path);
        request.kind = Some(MessageType::NonConfirmable);
        request.payload = payload.into();
        if let Some(format) = format {
            request.set_content_format(format);
        }

        self.execute(request, timeout).await
    }

    pub async fn post(
        &self,
        path: &str,
        payload: impl Into<Vec<u8>>,
        format: Option<ContentFormat>,
        timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let mut request = self.request(Code::Post, path);
        request.payload = payload.into();
        if let Some(format) = format {
            request.set_content_format(format);
        }

        self.execute(request, timeout).await
    }

    pub async fn post_non(
        &self,
        path: &str,
        payload: impl Into<Vec<u8>>,
        format: Option<ContentFormat>,
        timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let mut request = self.request(Code::Post, path);
        request.kind = Some(MessageType::NonConfirmable);
        request.payload = payload.into();
        if let Some(format) = format {
            request.set_content_format(format);
        }

        self.execute(request, timeout).await
    }

    pub async fn delete(&self, path: &str, timeout: Duration) -> anyhow::Result<Option<Message>> {
        self.execute(self.request(Code::Delete, path), timeout).await
    }

    pub async fn delete_non(
        &self,
        path: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let mut request = self.request(Code::Delete, path);
        request.kind = Some(MessageType::NonConfirmable);
        self.execute(request, timeout).await
    }

    /// Execute a prepared request, driving any blockwise continuation to
    /// completion.
    pub async fn execute(
        &self,
        request: Message,
        timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let full_payload = request.payload.clone();

        let transaction = self.send_request(request.clone()).await?;
        let response = self.receive_response(&transaction, timeout).await;

        let response = self.finalize_block2(request.clone(), response, timeout).await?;
        let response = self
            .finalize_block1(request, full_payload, response, timeout)
            .await?;

        Ok(response)
    }

    /// Keep requesting subsequent Block2 slices until M=0, accumulating
    /// the body.
    async fn finalize_block2(
        &self,
        mut request: Message,
        response: Option<Message>,
        timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let Some(mut current) = response else {
            return Ok(None);
        };

        let mut payload = current.payload.clone();

        while let Some(block2) = current.block2() {
            if !block2.more {
                break;
            }

            request.mid = None;
            request.clear_block2();
            request.set_block2(BlockValue::new(block2.num + 1, false, block2.size)?);

            let transaction = self.send_request(request.clone()).await?;
            match self.receive_response(&transaction, timeout).await {
                None => return Ok(None),
                Some(next) => {
                    payload.extend_from_slice(&next.payload);
                    current = next;
                }
            }
        }

        current.payload = payload;
        Ok(Some(current))
    }

    /// Feed the remaining Block1 slices after the first acknowledgement,
    /// honouring a server that scaled the block size down.
    async fn finalize_block1(
        &self,
        mut request: Message,
        full_payload: Vec<u8>,
        mut response: Option<Message>,
        timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let mut start = 0usize;

        while let Some(current) = response.as_ref() {
            let Some(block1) = current.block1() else {
                break;
            };

            start += block1.size as usize;
            let remaining = &full_payload[start.min(full_payload.len())..];
            let more = remaining.len() > block1.size as usize;

            request.mid = None;
            request.clear_block1();
            request.set_block1(BlockValue::new(block1.num + 1, more, block1.size)?);
            request.payload = remaining[..remaining.len().min(block1.size as usize)].to_vec();

            let transaction = self.send_request(request.clone()).await?;
            response = self.receive_response(&transaction, timeout).await;

            if !more {
                break;
            }
        }

        Ok(response)
    }

    /// Register as an observer on `path`, pushing the initial response
    /// and every notification into `sink` until `stop` flips.
    ///
    /// A missed notification deadline triggers one fresh registration
    /// before the stream is abandoned.
    pub async fn observe(
        &self,
        path: &str,
        sink: UnboundedSender<Message>,
        mut stop: watch::Receiver<bool>,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let mut request = self.request(Code::Get, path);
        request.set_observe(0);

        let mut transaction = self.send_request(request.clone()).await?;
        let mut response = self.receive_response(&transaction, timeout).await;
        response = self.finalize_block2(request.clone(), response, timeout).await?;

        if let Some(response) = response.as_ref() {
            let _ = sink.send(response.clone());
        }

        let mut reregister = false;
        while !*stop.borrow() {
            if reregister {
                let mut renewal = request.clone();
                renewal.mid = None;
                transaction = self.send_request(renewal).await?;
                let renewed = match self.receive_response(&transaction, timeout).await {
                    Some(renewed) => {
                        self.finalize_block2(request.clone(), Some(renewed), timeout)
                            .await?
                    }
                    None => break,
                };

                let Some(renewed) = renewed else {
                    break;
                };

                let _ = sink.send(renewed.clone());
                response = Some(renewed);
                reregister = false;
                continue;
            }

            let max_delay = response
                .as_ref()
                .and_then(|r| r.max_age())
                .map(|age| Duration::from_secs(age as u64) + MAX_LATENCY)
                .unwrap_or(timeout);

            transaction.clear_response();

            let next = tokio::select! {
                next = self.receive_response(&transaction, max_delay) => next,
                _ = stop.changed() => break,
            };

            match next {
                Some(next) => {
                    let next = self
                        .finalize_block2(request.clone(), Some(next), max_delay)
                        .await?;
                    if let Some(next) = next {
                        let _ = sink.send(next.clone());
                        response = Some(next);
                    }

                    reregister = false;
                }
                None => {
                    if reregister {
                        break;
                    }

                    reregister = true;
                }
            }
        }

        Ok(())
    }

    /// Observe with a callback; the stream ends when the callback returns
    /// false.
    pub async fn observe_with(
        &self,
        path: &str,
        mut callback: impl FnMut(Message) -> bool + Send,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let (sink, mut source) = tokio::sync::mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);

        let stream = self.observe(path, sink, stop_rx, timeout);
        tokio::pin!(stream);

        loop {
            tokio::select! {
                result = &mut stream => return result,
                notification = source.recv() => match notification {
                    Some(notification) => {
                        if !callback(notification) {
                            let _ = stop.send(true);
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// CoAP ping: an empty CON the peer must answer with RST.
    pub async fn ping(&self, timeout: Duration) -> anyhow::Result<bool> {
        let mut message = Message::new();
        message.destination = Some(self.remote);

        let transaction = self.endpoint.stack.message.send_ping(message)?;
        let message = transaction.lock().request.clone();
        self.endpoint.send_message(&message).await?;

        Ok(transaction
            .wait_response(timeout)
            .await
            .map(|reply| reply.kind == Some(MessageType::Reset))
            .unwrap_or(false))
    }
}
