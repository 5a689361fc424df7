//! Confirmable-message retransmission: exponential backoff from a random
//! initial timeout, capped at MAX_RETRANSMIT attempts.

use crate::endpoint::Endpoint;

use std::{sync::Arc, time::Duration};

use service::{
    Related,
    params::{ACK_RANDOM_FACTOR, ACK_TIMEOUT, MAX_RETRANSMIT},
    transaction::Transaction,
};

use rand::Rng;

/// The initial timeout, uniformly drawn from
/// [ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR].
fn initial_timeout() -> Duration {
    let base = ACK_TIMEOUT.as_secs_f64();
    Duration::from_secs_f64(rand::rng().random_range(base..=base * ACK_RANDOM_FACTOR))
}

/// Spawn the retransmission loop for the transaction's request or
/// response. The task self-cancels on acknowledgement or rejection and is
/// aborted by the matching side; after MAX_RETRANSMIT fruitless attempts
/// the message is declared timed out and, if it carried an Observe
/// option, the observer is evicted.
pub fn spawn(endpoint: &Arc<Endpoint>, transaction: &Arc<Transaction>, related: Related) {
    let endpoint = endpoint.clone();
    let txn = transaction.clone();

    let task = tokio::spawn(async move {
        let mut wait = initial_timeout();
        let mut count = 0u32;

        loop {
            let settled = {
                let state = txn.lock();
                let message = match related {
                    Related::Request => Some(&state.request),
                    Related::Response => state.response.as_ref(),
                };

                let Some(message) = message else {
                    return;
                };

                message.acknowledged || message.rejected || state.retransmit_stop
            };

            if settled || count >= MAX_RETRANSMIT {
                break;
            }

            tokio::time::sleep(wait).await;

            let resend = {
                let state = txn.lock();
                let message = match related {
                    Related::Request => Some(&state.request),
                    Related::Response => state.response.as_ref(),
                };

                message
                    .filter(|m| !m.acknowledged && !m.rejected)
                    .cloned()
            };

            if let Some(message) = resend {
                count += 1;
                wait *= 2;
                log::warn!("retransmit message #{}, next attempt in {:?}", count, wait);
                let _ = endpoint.send_message(&message).await;
            }
        }

        let gave_up = {
            let mut state = txn.lock();
            let message = match related {
                Related::Request => Some(&mut state.request),
                Related::Response => state.response.as_mut(),
            };

            let Some(message) = message else {
                return;
            };

            let gave_up = if message.acknowledged || message.rejected {
                message.timed_out = false;
                None
            } else {
                log::error!("give up on message: {}", message);
                message.timed_out = true;
                Some(message.clone())
            };

            state.retransmit_stop = false;
            gave_up
        };

        if let Some(message) = gave_up {
            if message.observe().is_some() {
                let _ = endpoint.stack.observe.remove_subscriber(&message);
            }
        }
    });

    transaction.lock().retransmit_task = Some(task);
}
