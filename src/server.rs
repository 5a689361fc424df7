//! The server front-end: resource registration, the notify dispatcher and
//! the max-age sweeper.

use crate::endpoint::Endpoint;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use codec::MessageType;
use service::{
    params::{MAX_LOST_NOTIFICATION, MINIMUM_OBSERVE_INTERVAL, OBSERVING_JITTER},
    resource::Resource,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

pub struct CoapServer {
    endpoint: Arc<Endpoint>,
    notify_queue: UnboundedSender<Resource>,
}

impl CoapServer {
    /// Bind the server and start its tasks: the receiver, the notify
    /// dispatcher and the max-age sweeper.
    pub async fn create_server(
        listen: SocketAddr,
        multicast: bool,
        starting_mid: Option<u16>,
    ) -> anyhow::Result<Self> {
        let endpoint = Endpoint::bind(listen, multicast, starting_mid).await?;
        endpoint.spawn_receiver();

        let (notify_queue, receiver) = unbounded_channel();
        tokio::spawn(notify_dispatcher(endpoint.clone(), receiver));
        tokio::spawn(max_age_sweeper(endpoint.clone()));

        log::info!(
            "coap server listening: addr={}, multicast={}",
            endpoint.local_addr(),
            multicast,
        );

        Ok(Self {
            endpoint,
            notify_queue,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Attach a resource; its notify handle is wired to this server's
    /// dispatcher. Refused when the path is taken.
    pub fn add_resource(&self, path: &str, mut resource: Resource) -> bool {
        resource.notify_queue = Some(self.notify_queue.clone());
        self.endpoint.stack.request.add_resource(path, resource)
    }

    pub fn remove_resource(&self, path: &str) -> bool {
        self.endpoint.stack.request.remove_resource(path)
    }

    pub fn get_resources(&self, prefix: Option<&str>) -> Vec<String> {
        self.endpoint.stack.request.get_resources(prefix)
    }

    /// Push the resource under `path` to its observers.
    pub fn notify(&self, path: &str) -> bool {
        match self.endpoint.stack.request.get_resource(path) {
            Some(resource) => self.notify_queue.send(resource).is_ok(),
            None => false,
        }
    }

    pub fn stop(&self) {
        self.endpoint.stop();
    }

    /// Block until `stop` is called.
    pub async fn wait_stopped(&self) {
        let mut stopped = self.endpoint.stopped();
        while !*stopped.borrow() {
            if stopped.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Drain the notify queue: every changed resource is fanned out to its
/// observers through the block, observe and message layers again.
async fn notify_dispatcher(endpoint: Arc<Endpoint>, mut queue: UnboundedReceiver<Resource>) {
    let mut stopped = endpoint.stopped();

    loop {
        let resource = tokio::select! {
            resource = queue.recv() => resource,
            _ = stopped.changed() => break,
        };

        let Some(resource) = resource else {
            break;
        };

        for transaction in endpoint.stack.observe.notify(&resource) {
            log::debug!("notify resource: path={}", resource.path);
            if let Err(error) = endpoint.renotify(&transaction).await {
                endpoint.handle_error(error, None).await;
            }
        }
    }
}

/// Refresh observers whose notifications are about to outlive their
/// Max-Age, evicting those that stopped acknowledging. Sleeps until the
/// earliest upcoming deadline.
async fn max_age_sweeper(endpoint: Arc<Endpoint>) {
    let mut stopped = endpoint.stopped();

    loop {
        let mut sleep_for = MINIMUM_OBSERVE_INTERVAL;

        for transaction in endpoint.stack.observe.notify_all() {
            let verdict = {
                let state = transaction.lock();
                match state.response.as_ref() {
                    None => continue,
                    Some(response) => {
                        let max_age = Duration::from_secs(response.max_age().unwrap_or(60) as u64);
                        let sent = response.timestamp.unwrap_or_else(Instant::now);

                        (sent + max_age, max_age, response.kind, response.acknowledged)
                    }
                }
            };

            let (deadline, max_age, kind, acknowledged) = verdict;
            let due = Instant::now() + OBSERVING_JITTER >= deadline;
            let mut notify_in = deadline.saturating_duration_since(Instant::now());

            if due {
                if kind == Some(MessageType::NonConfirmable) || acknowledged {
                    match endpoint.renotify(&transaction).await {
                        Ok(()) => {
                            let mut state = transaction.lock();
                            if let Some(response) = state.response.as_mut() {
                                notify_in =
                                    Duration::from_secs(response.max_age().unwrap_or(60) as u64);
                                response.acknowledged = false;
                            }
                        }
                        Err(error) => {
                            endpoint.handle_error(error, None).await;
                            continue;
                        }
                    }
                } else {
                    // the previous CON notification is still in the air
                    let (lost, response) = {
                        let mut state = transaction.lock();
                        state.notification_not_acknowledged += 1;
                        (state.notification_not_acknowledged, state.response.clone())
                    };

                    log::debug!("notification has not been acknowledged: lost={}", lost);
                    notify_in = max_age;

                    if lost > MAX_LOST_NOTIFICATION {
                        if let Some(response) = response {
                            let _ = endpoint.stack.observe.remove_subscriber(&response);
                        }
                    }
                }
            }

            if notify_in < sleep_for {
                sleep_for = notify_in;
            }
        }

        // never spin on an immediately-due deadline
        sleep_for = sleep_for.max(Duration::from_millis(200));

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = stopped.changed() => break,
        }
    }
}
