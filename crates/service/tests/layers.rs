use anyhow::Result;
use codec::{BlockValue, Code, ContentFormat, Message, MessageType};
use coap_endpoint_service::{
    Error, Related,
    layers::{BlockLayer, MessageLayer, ObserveLayer, RequestLayer},
    resource::{Handler, HandlerOutcome, Resource},
    transaction::Transaction,
};

use std::net::SocketAddr;

fn peer() -> SocketAddr {
    "127.0.0.1:40001".parse().unwrap()
}

fn local() -> SocketAddr {
    "127.0.0.1:5683".parse().unwrap()
}

fn inbound(code: Code, path: &str, mid: u16, token: &[u8]) -> Message {
    let mut message = Message::new();
    message.kind = Some(MessageType::Confirmable);
    message.code = code;
    message.mid = Some(mid);
    message.token = token.to_vec();
    message.source = Some(peer());
    message.destination = Some(local());
    message.set_uri_path(path);
    message
}

struct Echo;

impl Handler for Echo {
    fn handle_get(
        &self,
        resource: &Resource,
        _request: &Message,
        mut response: Message,
    ) -> HandlerOutcome {
        response.payload = resource.payload.clone();
        if let Some(format) = resource.content_type {
            response.set_content_format(format);
        }

        HandlerOutcome::Immediate(resource.clone(), response)
    }

    fn handle_put(
        &self,
        resource: &Resource,
        request: &Message,
        response: Message,
    ) -> HandlerOutcome {
        let mut updated = resource.clone();
        updated.payload = request.payload.clone();
        updated.content_type = request.content_format();
        HandlerOutcome::Immediate(updated, response)
    }
}

#[test]
fn test_mid_allocation_wraps() {
    let layer = MessageLayer::new(Some(65533));

    assert_eq!(layer.fetch_mid(), 65533);
    assert_eq!(layer.fetch_mid(), 65534);
    // 65535 is unreachable, the generator wraps modulo 65535
    assert_eq!(layer.fetch_mid(), 0);
}

#[test]
fn test_duplicate_request_detection() -> Result<()> {
    let layer = MessageLayer::new(Some(1));

    let first = layer.receive_request(inbound(Code::Get, "test", 7, b"tk"))?;
    assert!(!first.lock().request.duplicated);

    let second = layer.receive_request(inbound(Code::Get, "test", 7, b"tk"))?;
    assert!(second.lock().request.duplicated);

    Ok(())
}

#[test]
fn test_mid_reuse_with_other_token_is_protocol_error() {
    let layer = MessageLayer::new(Some(1));

    layer
        .receive_request(inbound(Code::Get, "test", 7, b"tk"))
        .unwrap();

    match layer.receive_request(inbound(Code::Get, "test", 7, b"other")) {
        Err(Error::Protocol { mid, .. }) => assert_eq!(mid, Some(7)),
        _ => panic!("expected a protocol error"),
    }
}

#[test]
fn test_piggybacked_ack_derivation() -> Result<()> {
    let layer = MessageLayer::new(Some(100));

    let transaction = layer.receive_request(inbound(Code::Get, "test", 42, b"tk"))?;
    {
        let mut state = transaction.lock();
        let response = {
            let mut response = Message::response_to(&state.request);
            response.code = Code::Content;
            response
        };
        state.response = Some(response);
    }

    layer.send_response(&transaction)?;

    let state = transaction.lock();
    let response = state.response.as_ref().unwrap();
    assert_eq!(response.kind, Some(MessageType::Acknowledgement));
    assert_eq!(response.mid, Some(42));
    assert_eq!(response.token, b"tk".to_vec());
    Ok(())
}

#[test]
fn test_separate_response_gets_fresh_mid() -> Result<()> {
    let layer = MessageLayer::new(Some(100));

    let transaction = layer.receive_request(inbound(Code::Get, "separate", 42, b"tk"))?;
    {
        let mut state = transaction.lock();
        // the empty ACK already went out
        state.request.acknowledged = true;
        let mut response = Message::response_to(&state.request);
        response.code = Code::Content;
        state.response = Some(response);
    }

    layer.send_response(&transaction)?;

    let state = transaction.lock();
    let response = state.response.as_ref().unwrap();
    assert_eq!(response.kind, Some(MessageType::Confirmable));
    assert_eq!(response.mid, Some(100));
    Ok(())
}

#[test]
fn test_non_request_gets_non_response() -> Result<()> {
    let layer = MessageLayer::new(Some(100));

    let mut request = inbound(Code::Get, "test", 9, b"tk");
    request.kind = Some(MessageType::NonConfirmable);

    let transaction = layer.receive_request(request)?;
    {
        let mut state = transaction.lock();
        let mut response = Message::response_to(&state.request);
        response.code = Code::Content;
        state.response = Some(response);
    }

    layer.send_response(&transaction)?;

    assert_eq!(
        transaction.lock().response.as_ref().unwrap().kind,
        Some(MessageType::NonConfirmable),
    );
    Ok(())
}

#[test]
fn test_deferred_empty_ack() -> Result<()> {
    let layer = MessageLayer::new(Some(300));

    let transaction = layer.receive_request(inbound(Code::Get, "separate", 91, b"sp"))?;
    let ack = layer.send_empty(&transaction, Related::Request)?;

    assert_eq!(ack.kind, Some(MessageType::Acknowledgement));
    assert_eq!(ack.code, Code::Empty);
    assert_eq!(ack.mid, Some(91));
    assert_eq!(ack.destination, Some(peer()));
    assert!(transaction.lock().request.acknowledged);
    Ok(())
}

#[test]
fn test_unmatched_empty_con_is_pong() {
    let layer = MessageLayer::new(Some(1));

    let mut ping = Message::new();
    ping.kind = Some(MessageType::Confirmable);
    ping.mid = Some(77);
    ping.source = Some(peer());

    match layer.receive_empty(&ping) {
        Err(Error::Pong { message }) => assert_eq!(message.mid, Some(77)),
        _ => panic!("expected a pong"),
    }
}

#[test]
fn test_empty_resolution_against_outstanding_request() -> Result<()> {
    let layer = MessageLayer::new(Some(500));

    let mut request = Message::request(MessageType::Confirmable, Code::Get, peer());
    request.token = b"q1".to_vec();
    let transaction = layer.send_request(request)?;
    let mid = transaction.lock().request.mid;

    let mut ack = Message::new();
    ack.kind = Some(MessageType::Acknowledgement);
    ack.mid = mid;
    ack.source = Some(peer());
    layer.receive_empty(&ack)?;
    assert!(transaction.lock().request.acknowledged);

    // a reset rejects the next exchange instead
    let mut request = Message::request(MessageType::Confirmable, Code::Get, peer());
    request.token = b"q2".to_vec();
    let transaction = layer.send_request(request)?;
    let mid = transaction.lock().request.mid;

    let mut rst = Message::new();
    rst.kind = Some(MessageType::Reset);
    rst.mid = mid;
    rst.source = Some(peer());
    layer.receive_empty(&rst)?;
    assert!(transaction.lock().request.rejected);
    Ok(())
}

#[test]
fn test_implicit_ack_on_empty_con() -> Result<()> {
    let layer = MessageLayer::new(Some(600));

    let mut request = Message::request(MessageType::Confirmable, Code::Get, peer());
    request.token = b"q3".to_vec();
    let transaction = layer.send_request(request)?;
    let mid = transaction.lock().request.mid;

    let mut con = Message::new();
    con.kind = Some(MessageType::Confirmable);
    con.mid = mid;
    con.token = b"q3".to_vec();
    con.source = Some(peer());
    layer.receive_empty(&con)?;

    assert!(transaction.lock().request.acknowledged);
    Ok(())
}

#[test]
fn test_multicast_request_matches_unicast_response() -> Result<()> {
    let layer = MessageLayer::new(Some(700));

    let mut request =
        Message::request(MessageType::NonConfirmable, Code::Get, "224.0.1.187:5683".parse()?);
    request.token = b"mc".to_vec();
    let transaction = layer.send_request(request)?;

    // an individual node answers from its own unicast address
    let mut response = Message::new();
    response.kind = Some(MessageType::NonConfirmable);
    response.code = Code::Content;
    response.mid = Some(9999);
    response.token = b"mc".to_vec();
    response.source = Some("192.0.2.7:5683".parse()?);
    response.payload = b"node".to_vec();

    let matched = layer.receive_response(response)?;
    assert!(std::sync::Arc::ptr_eq(&matched, &transaction));
    assert_eq!(
        matched.lock().response.as_ref().unwrap().payload,
        b"node".to_vec(),
    );
    Ok(())
}

#[test]
fn test_block1_upload_sequence() -> Result<()> {
    let layer = BlockLayer::default();
    let body: Vec<u8> = (0..1601u32).map(|i| i as u8).collect();

    // first slice
    let mut request = inbound(Code::Put, "large-update", 1, b"b1");
    request.set_block1(BlockValue::new(0, true, 1024)?);
    request.payload = body[..1024].to_vec();
    let transaction = Transaction::new(request);

    layer.receive_request(&transaction)?;
    assert!(transaction.lock().block_transfer);

    layer.send_response(&transaction)?;
    {
        let state = transaction.lock();
        let response = state.response.as_ref().unwrap();
        assert_eq!(response.code, Code::Continue);
        assert_eq!(response.block1(), Some(BlockValue::new(0, true, 1024)?));
    }

    // final slice
    let mut request = inbound(Code::Put, "large-update", 2, b"b1");
    request.set_block1(BlockValue::new(1, false, 1024)?);
    request.payload = body[1024..].to_vec();
    let transaction = Transaction::new(request);

    layer.receive_request(&transaction)?;
    {
        let mut state = transaction.lock();
        assert!(!state.block_transfer);
        assert_eq!(state.request.payload, body);

        let mut response = Message::response_to(&state.request);
        response.code = Code::Changed;
        state.response = Some(response);
    }

    layer.send_response(&transaction)?;
    {
        let state = transaction.lock();
        let response = state.response.as_ref().unwrap();
        assert_eq!(response.code, Code::Changed);
        assert_eq!(response.block1(), Some(BlockValue::new(1, false, 1024)?));
    }

    Ok(())
}

#[test]
fn test_block1_num_mismatch_is_entity_incomplete() -> Result<()> {
    let layer = BlockLayer::default();

    let mut request = inbound(Code::Put, "large-update", 1, b"b2");
    request.set_block1(BlockValue::new(0, true, 1024)?);
    request.payload = vec![0u8; 1024];
    layer.receive_request(&Transaction::new(request))?;

    // continuation skips a block
    let mut request = inbound(Code::Put, "large-update", 2, b"b2");
    request.set_block1(BlockValue::new(5, true, 1024)?);
    request.payload = vec![0u8; 1024];

    match layer.receive_request(&Transaction::new(request)) {
        Err(Error::Internal { code, .. }) => assert_eq!(code, Code::RequestEntityIncomplete),
        _ => panic!("expected entity incomplete"),
    }

    Ok(())
}

#[test]
fn test_block2_download_with_early_negotiation() -> Result<()> {
    let layer = BlockLayer::default();
    let body: Vec<u8> = (0..1601u32).map(|i| i as u8).collect();

    let mut request = inbound(Code::Get, "large", 1, b"b3");
    request.set_block2(BlockValue::new(0, false, 1024)?);
    let transaction = Transaction::new(request);

    layer.receive_request(&transaction)?;
    assert!(!transaction.lock().block_transfer);

    {
        let mut state = transaction.lock();
        let mut response = Message::response_to(&state.request);
        response.code = Code::Content;
        response.payload = body.clone();
        state.response = Some(response);
    }

    layer.send_response(&transaction)?;
    {
        let state = transaction.lock();
        let response = state.response.as_ref().unwrap();
        assert_eq!(response.payload, body[..1024].to_vec());
        assert_eq!(response.block2(), Some(BlockValue::new(0, true, 1024)?));
    }

    // the client asks for the second block with the same token
    let mut request = inbound(Code::Get, "large", 2, b"b3");
    request.set_block2(BlockValue::new(1, false, 1024)?);
    let transaction = Transaction::new(request);

    layer.receive_request(&transaction)?;
    {
        let mut state = transaction.lock();
        let mut response = Message::response_to(&state.request);
        response.code = Code::Content;
        response.payload = body.clone();
        state.response = Some(response);
    }

    layer.send_response(&transaction)?;
    {
        let state = transaction.lock();
        let response = state.response.as_ref().unwrap();
        assert_eq!(response.payload, body[1024..].to_vec());
        assert_eq!(response.block2(), Some(BlockValue::new(1, false, 1024)?));
    }

    Ok(())
}

#[test]
fn test_observe_stripped_beyond_first_block() -> Result<()> {
    let layer = BlockLayer::default();

    let mut request = inbound(Code::Get, "large-obs", 1, b"b4");
    request.set_block2(BlockValue::new(1, false, 512)?);
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction)?;

    {
        let mut state = transaction.lock();
        let mut response = Message::response_to(&state.request);
        response.code = Code::Content;
        response.set_observe(4);
        response.payload = vec![0u8; 1601];
        state.response = Some(response);
    }

    layer.send_response(&transaction)?;

    let state = transaction.lock();
    let response = state.response.as_ref().unwrap();
    assert_eq!(response.observe(), None);
    assert!(response.block2().is_some());
    Ok(())
}

fn observed_resource() -> Resource {
    Resource::new("obs", Echo)
        .with_payload("5")
        .with_content_type(ContentFormat::TextPlain)
}

fn register_observer(layer: &ObserveLayer, mid: u16) -> Result<std::sync::Arc<Transaction>> {
    let mut request = inbound(Code::Get, "obs", mid, b"ob");
    request.set_observe(0);
    let transaction = Transaction::new(request);

    layer.receive_request(&transaction)?;

    {
        let mut state = transaction.lock();
        let mut response = Message::response_to(&state.request);
        response.code = Code::Content;
        response.payload = b"5".to_vec();
        response.set_content_format(ContentFormat::TextPlain);
        state.response = Some(response);
        state.resource = Some(observed_resource());
    }

    layer.send_response(&transaction)?;
    Ok(transaction)
}

#[test]
fn test_observe_registration_and_notify() -> Result<()> {
    let layer = ObserveLayer::default();
    let transaction = register_observer(&layer, 11)?;

    assert_eq!(layer.len(), 1);
    {
        let state = transaction.lock();
        let response = state.response.as_ref().unwrap();
        assert_eq!(response.observe(), Some(2));
        // the request side of the relation no longer carries the option
        assert_eq!(state.request.observe(), None);
    }

    let mut changed = observed_resource();
    changed.payload = b"6".to_vec();
    changed.bump_observe_count();

    let notified = layer.notify(&changed);
    assert_eq!(notified.len(), 1);

    let state = notified[0].lock();
    assert_eq!(state.response.as_ref().unwrap().mid, None);
    // CON registration forces CON notifications
    assert_eq!(state.notification_type, Some(MessageType::Confirmable));
    assert_eq!(
        state.resource.as_ref().unwrap().payload,
        b"6".to_vec(),
    );
    Ok(())
}

#[test]
fn test_observe_content_type_change_evicts() -> Result<()> {
    let layer = ObserveLayer::default();
    let transaction = register_observer(&layer, 12)?;

    // the resource representation switched to json
    {
        let mut state = transaction.lock();
        let mut resource = observed_resource();
        resource.content_type = Some(ContentFormat::Json);
        state.resource = Some(resource);

        let mut response = Message::response_to(&state.request);
        response.code = Code::Content;
        response.set_content_format(ContentFormat::Json);
        state.response = Some(response);
    }

    match layer.send_response(&transaction) {
        Err(Error::Observe { code, .. }) => assert_eq!(code, Code::NotAcceptable),
        _ => panic!("expected an observe error"),
    }

    assert!(layer.is_empty());
    Ok(())
}

#[test]
fn test_observe_rst_evicts_subscriber() -> Result<()> {
    let layer = ObserveLayer::default();
    let transaction = register_observer(&layer, 13)?;

    let mut rst = Message::new();
    rst.kind = Some(MessageType::Reset);
    rst.mid = Some(77);
    rst.source = Some(peer());

    layer.receive_empty(&rst, &transaction)?;

    assert!(layer.is_empty());
    assert!(transaction.lock().completed);
    Ok(())
}

#[tokio::test]
async fn test_request_layer_get() -> Result<()> {
    let layer = RequestLayer::default();
    layer.add_resource(
        "/test",
        Resource::new("test", Echo)
            .with_payload("Test")
            .with_content_type(ContentFormat::TextPlain),
    );

    let transaction = Transaction::new(inbound(Code::Get, "test", 21, b"rq"));
    layer.receive_request(&transaction).await?;

    let state = transaction.lock();
    let response = state.response.as_ref().unwrap();
    assert_eq!(response.code, Code::Content);
    assert_eq!(response.payload, b"Test".to_vec());
    assert_eq!(response.content_format(), Some(ContentFormat::TextPlain));
    Ok(())
}

#[tokio::test]
async fn test_request_layer_not_found_and_method_not_allowed() -> Result<()> {
    let layer = RequestLayer::default();
    layer.add_resource("/test", Resource::new("test", Echo).with_payload("Test"));

    let transaction = Transaction::new(inbound(Code::Get, "missing", 22, b"rq"));
    layer.receive_request(&transaction).await?;
    assert_eq!(
        transaction.lock().response.as_ref().unwrap().code,
        Code::NotFound,
    );

    // Echo has no POST handler
    let transaction = Transaction::new(inbound(Code::Post, "test", 23, b"rq"));
    layer.receive_request(&transaction).await?;
    assert_eq!(
        transaction.lock().response.as_ref().unwrap().code,
        Code::MethodNotAllowed,
    );
    Ok(())
}

#[tokio::test]
async fn test_etag_validation_yields_valid() -> Result<()> {
    let layer = RequestLayer::default();
    layer.add_resource(
        "/tagged",
        Resource::new("tagged", Echo)
            .with_payload("body")
            .with_etag(*b"v1"),
    );

    let mut request = inbound(Code::Get, "tagged", 24, b"rq");
    request.add_etag(b"v1");
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;

    {
        let state = transaction.lock();
        let response = state.response.as_ref().unwrap();
        assert_eq!(response.code, Code::Valid);
        assert!(response.payload.is_empty());
    }

    // a stale validator still gets the representation
    let mut request = inbound(Code::Get, "tagged", 25, b"rq");
    request.add_etag(b"v0");
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;

    let state = transaction.lock();
    let response = state.response.as_ref().unwrap();
    assert_eq!(response.code, Code::Content);
    assert_eq!(response.payload, b"body".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_put_preconditions() -> Result<()> {
    let layer = RequestLayer::default();
    layer.add_resource(
        "/guarded",
        Resource::new("guarded", Echo)
            .with_payload("old")
            .with_etag(*b"v1"),
    );

    // If-None-Match against an existing resource always fails
    let mut request = inbound(Code::Put, "guarded", 26, b"rq");
    request.set_if_none_match();
    request.payload = b"new".to_vec();
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;
    assert_eq!(
        transaction.lock().response.as_ref().unwrap().code,
        Code::PreconditionFailed,
    );

    // If-Match with a stale tag fails
    let mut request = inbound(Code::Put, "guarded", 27, b"rq");
    request.add_if_match(b"v0");
    request.payload = b"new".to_vec();
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;
    assert_eq!(
        transaction.lock().response.as_ref().unwrap().code,
        Code::PreconditionFailed,
    );

    // the empty wildcard matches any existing representation
    let mut request = inbound(Code::Put, "guarded", 28, b"rq");
    request.add_if_match(b"");
    request.payload = b"new".to_vec();
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;
    assert_eq!(
        transaction.lock().response.as_ref().unwrap().code,
        Code::Changed,
    );

    Ok(())
}

#[tokio::test]
async fn test_put_creates_child_under_factory() -> Result<()> {
    let layer = RequestLayer::default();

    let parent = Resource::new("storage", Echo)
        .with_children(std::sync::Arc::new(|| Resource::new("child", Echo)));
    layer.add_resource("/storage", parent);

    let mut request = inbound(Code::Put, "storage/new", 29, b"rq");
    request.payload = b"stored".to_vec();
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;

    assert_eq!(
        transaction.lock().response.as_ref().unwrap().code,
        Code::Created,
    );

    let child = layer.get_resource("/storage/new").unwrap();
    assert_eq!(child.payload, b"stored".to_vec());

    // no factory above this path
    let transaction = Transaction::new(inbound(Code::Put, "elsewhere/new", 30, b"rq"));
    layer.receive_request(&transaction).await?;
    assert_eq!(
        transaction.lock().response.as_ref().unwrap().code,
        Code::NotFound,
    );
    Ok(())
}

#[tokio::test]
async fn test_accept_mismatch_is_not_acceptable() -> Result<()> {
    let layer = RequestLayer::default();
    layer.add_resource(
        "/test",
        Resource::new("test", Echo)
            .with_payload("Test")
            .with_content_type(ContentFormat::TextPlain),
    );

    let mut request = inbound(Code::Get, "test", 31, b"rq");
    request.set_accept(ContentFormat::Json);
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;

    assert_eq!(
        transaction.lock().response.as_ref().unwrap().code,
        Code::NotAcceptable,
    );
    Ok(())
}

#[tokio::test]
async fn test_discovery_rendering_and_filters() -> Result<()> {
    let layer = RequestLayer::default();
    layer.add_resource(
        "/sensors/temp",
        Resource::new("temp", Echo).with_attribute("rt", "temperature"),
    );
    layer.add_resource(
        "/sensors/hum",
        Resource::new("hum", Echo).with_attribute("rt", "humidity"),
    );
    layer.add_resource("/hidden", Resource::new("hidden", Echo).visible(false));

    let transaction = Transaction::new(inbound(Code::Get, "/.well-known/core", 32, b"rq"));
    layer.receive_request(&transaction).await?;

    {
        let state = transaction.lock();
        let response = state.response.as_ref().unwrap();
        assert_eq!(response.code, Code::Content);
        assert_eq!(response.content_format(), Some(ContentFormat::LinkFormat));

        let body = String::from_utf8(response.payload.clone())?;
        assert_eq!(
            body,
            "</sensors/hum>;obs;rt=\"humidity\",</sensors/temp>;obs;rt=\"temperature\"",
        );
    }

    // rt filter with a prefix match
    let mut request = inbound(Code::Get, "/.well-known/core", 33, b"rq");
    request.set_uri_query("rt=temp*");
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;

    {
        let state = transaction.lock();
        let body = String::from_utf8(state.response.as_ref().unwrap().payload.clone())?;
        assert_eq!(body, "</sensors/temp>;obs;rt=\"temperature\"");
    }

    // href filter
    let mut request = inbound(Code::Get, "/.well-known/core", 34, b"rq");
    request.set_uri_query("href=/sensors/hum");
    let transaction = Transaction::new(request);
    layer.receive_request(&transaction).await?;

    let state = transaction.lock();
    let body = String::from_utf8(state.response.as_ref().unwrap().payload.clone())?;
    assert_eq!(body, "</sensors/hum>;obs;rt=\"humidity\"");
    Ok(())
}
