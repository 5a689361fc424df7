//! Dispatch onto resource handlers and the CoRE link-format discovery
//! rendering (RFC 6690).

use crate::{
    Error, Related,
    resource::{DeleteOutcome, HandlerOutcome, Resource},
    transaction::Transaction,
};

use std::{collections::BTreeMap, sync::Arc};

use codec::{Code, Message};

/// Drive a handler outcome to completion.
///
/// Immediate results pass through, futures are awaited, closures run on
/// the blocking pool so a synchronous handler cannot stall the driver. A
/// continuation means "separate response": the empty ACK is flushed first
/// and the continuation awaited for the real payload.
pub async fn invoke(
    transaction: &Arc<Transaction>,
    outcome: HandlerOutcome,
) -> Result<(Resource, Message), Error> {
    match outcome {
        HandlerOutcome::Immediate(resource, response) => Ok((resource, response)),
        HandlerOutcome::Async(future) => Ok(future.await),
        HandlerOutcome::Blocking(call) => {
            tokio::task::spawn_blocking(call).await.map_err(|_| {
                Error::internal(
                    "resource handler is not correctly implemented",
                    Code::InternalServerError,
                    Some(transaction.clone()),
                    Related::Request,
                )
            })
        }
        HandlerOutcome::Separate(continuation) => {
            flush_separate(transaction).await;
            Ok(continuation().await)
        }
    }
}

pub async fn invoke_delete(
    transaction: &Arc<Transaction>,
    outcome: DeleteOutcome,
) -> Result<(bool, Message), Error> {
    match outcome {
        DeleteOutcome::Immediate(deleted, response) => Ok((deleted, response)),
        DeleteOutcome::Async(future) => Ok(future.await),
        DeleteOutcome::Blocking(call) => {
            tokio::task::spawn_blocking(call).await.map_err(|_| {
                Error::internal(
                    "resource handler is not correctly implemented",
                    Code::InternalServerError,
                    Some(transaction.clone()),
                    Related::Request,
                )
            })
        }
        DeleteOutcome::Separate(continuation) => {
            flush_separate(transaction).await;
            Ok(continuation().await)
        }
    }
}

async fn flush_separate(transaction: &Arc<Transaction>) {
    let unacknowledged = {
        let state = transaction.lock();
        !state.request.acknowledged
    };

    if unacknowledged {
        transaction.flush_separate().await;
    }
}

/// If-Match precondition (RFC 7252, section 5.10.8.1). The empty value is
/// the wildcard matching any existing representation.
pub fn if_match_failed(request: &Message, etag: Option<&[u8]>) -> bool {
    let if_match = request.if_match();
    if if_match.is_empty() {
        return false;
    }

    if if_match.iter().any(|value| value.is_empty()) {
        return false;
    }

    match etag {
        Some(etag) => !if_match.iter().any(|value| *value == etag),
        None => true,
    }
}

/// Replace the response with 4.06 Not Acceptable when the representation
/// cannot honour the request's Accept.
pub fn not_acceptable(request: &Message) -> Message {
    let mut response = Message::response_to(request);
    response.code = Code::NotAcceptable;
    response.payload = b"Request representation is not acceptable.".to_vec();
    response
}

/// One CoRE link-format entry: `</path>;attr=...;attr=...`, attributes in
/// name order, bare names for empty values, digits unquoted.
pub fn link_entry(resource: &Resource) -> String {
    let mut entry = format!("<{}>", resource.path);

    for (name, value) in &resource.attributes {
        if value.is_empty() {
            entry.push_str(&format!(";{}", name));
        } else if value.chars().all(|c| c.is_ascii_digit()) {
            entry.push_str(&format!(";{}={}", name, value));
        } else {
            entry.push_str(&format!(";{}=\"{}\"", name, value));
        }
    }

    entry
}

/// The URI-Query filter of the discovery endpoint.
///
/// Each `key=value` pair must hold: `href` matches against the path, any
/// other key against the whitespace-separated attribute values. A value
/// ending in `*` is a prefix match; `*` alone accepts anything; a bare key
/// only requires the attribute to exist.
pub fn matches_filter(
    query: Option<&str>,
    attributes: &BTreeMap<String, String>,
    path: &str,
) -> bool {
    let Some(query) = query else {
        return true;
    };

    for pair in query.trim_start_matches('?').split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next().unwrap_or_default();
        let value = parts.next();

        if name != "href" && !attributes.contains_key(name) {
            return false;
        }

        let Some(value) = value else {
            continue;
        };

        let star = value.find('*');
        if star == Some(0) {
            continue;
        }

        if name == "href" {
            return match star {
                None => path == value,
                Some(pos) => path.starts_with(&value[..pos]),
            };
        }

        let candidates = attributes.get(name).unwrap();
        let found = candidates.split(' ').any(|candidate| match star {
            None => candidate == value,
            Some(pos) => candidate.starts_with(&value[..pos]),
        });

        if !found {
            return false;
        }
    }

    true
}
