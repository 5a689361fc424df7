use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use codec::{Code, ContentFormat, Message, MessageType};
use coap_endpoint::{client::CoapClient, server::CoapServer};
use service::resource::{Handler, HandlerOutcome, Resource};

use tokio::{
    net::UdpSocket,
    sync::{mpsc::unbounded_channel, watch},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(10);

fn lorem(len: usize) -> Vec<u8> {
    "Lorem ipsum dolor sit amet, consectetur adipiscing elit. "
        .repeat(1 + len / 57)
        .into_bytes()[..len]
        .to_vec()
}

struct Basic;

impl Handler for Basic {
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

struct Separate;

impl Handler for Separate {
    fn handle_get(
        &self,
        resource: &Resource,
        _request: &Message,
        mut response: Message,
    ) -> HandlerOutcome {
        let resource = resource.clone();
        HandlerOutcome::Separate(Box::new(move || {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                response.payload = b"Separate".to_vec();
                response.set_content_format(ContentFormat::TextPlain);
                (resource, response)
            })
        }))
    }
}

async fn test_server() -> Result<(CoapServer, SocketAddr)> {
    let server = CoapServer::create_server("127.0.0.1:0".parse()?, false, Some(1000)).await?;

    server.add_resource(
        "/test",
        Resource::new("test", Basic)
            .with_payload("Test")
            .with_content_type(ContentFormat::TextPlain)
            .with_attribute("rt", "test"),
    );

    server.add_resource("/separate", Resource::new("separate", Separate));
    server.add_resource(
        "/large",
        Resource::new("large", Basic).with_payload(lorem(1601)),
    );
    server.add_resource("/large-update", Resource::new("large-update", Basic));
    server.add_resource(
        "/obs",
        Resource::new("obs", Basic)
            .with_payload("5")
            .with_content_type(ContentFormat::TextPlain),
    );

    let addr = server.local_addr();
    Ok((server, addr))
}

#[tokio::test]
async fn test_get_piggybacked() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let response = client.get("/test", WAIT).await?.expect("no response");

    assert_eq!(response.code, Code::Content);
    assert_eq!(response.kind, Some(MessageType::Acknowledgement));
    assert_eq!(response.payload, b"Test".to_vec());
    assert_eq!(response.content_format(), Some(ContentFormat::TextPlain));
    Ok(())
}

#[tokio::test]
async fn test_get_non_confirmable() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let response = client.get_non("/test", WAIT).await?.expect("no response");

    assert_eq!(response.code, Code::Content);
    assert_eq!(response.kind, Some(MessageType::NonConfirmable));
    assert_eq!(response.payload, b"Test".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_get_not_found() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let response = client.get("/missing", WAIT).await?.expect("no response");
    assert_eq!(response.code, Code::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_separate_response() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let response = client.get("/separate", WAIT).await?.expect("no response");

    // the empty ACK was consumed by the client; the payload arrives in a
    // CON response the client acknowledged
    assert_eq!(response.code, Code::Content);
    assert_eq!(response.kind, Some(MessageType::Confirmable));
    assert_eq!(response.payload, b"Separate".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_fast_and_slow() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let fast = CoapClient::connect(addr).await?;
    let slow = CoapClient::connect(addr).await?;

    let slow_task = tokio::spawn(async move { slow.get("/separate", WAIT).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let fast_response = fast.get("/test", WAIT).await?.expect("no response");
    assert_eq!(fast_response.payload, b"Test".to_vec());
    // the fast exchange is not blocked behind the slow handler
    assert!(started.elapsed() < Duration::from_secs(1));

    let slow_response = slow_task.await??.expect("no response");
    assert_eq!(slow_response.payload, b"Separate".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_block2_download() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let response = client.get("/large", WAIT).await?.expect("no response");

    assert_eq!(response.code, Code::Content);
    assert_eq!(response.payload, lorem(1601));
    Ok(())
}

#[tokio::test]
async fn test_block2_early_negotiation() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let mut request = client.request(Code::Get, "/large");
    request.set_block2(codec::BlockValue::new(0, false, 512)?);

    let response = client.execute(request, WAIT).await?.expect("no response");
    assert_eq!(response.payload, lorem(1601));
    Ok(())
}

#[tokio::test]
async fn test_block1_upload_then_download() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let body = lorem(1601);
    let response = client
        .put(
            "/large-update",
            body.clone(),
            Some(ContentFormat::TextPlain),
            WAIT,
        )
        .await?
        .expect("no response");

    assert_eq!(response.code, Code::Changed);

    let read_back = client.get("/large-update", WAIT).await?.expect("no response");
    assert_eq!(read_back.payload, body);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_request_is_replayed() -> Result<()> {
    let (_server, addr) = test_server().await?;

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let mut request = Message::request(MessageType::Confirmable, Code::Get, addr);
    request.mid = Some(4242);
    request.token = vec![0x09];
    request.set_uri_path("test");
    let wire = request.encode()?;

    let mut buf = [0u8; 2048];

    socket.send_to(&wire, addr).await?;
    let (first_len, _) = timeout(WAIT, socket.recv_from(&mut buf)).await??;
    let first = buf[..first_len].to_vec();

    socket.send_to(&wire, addr).await?;
    let (second_len, _) = timeout(WAIT, socket.recv_from(&mut buf)).await??;
    let second = buf[..second_len].to_vec();

    // the cached response is replayed byte for byte
    assert_eq!(first, second);

    let decoded = Message::decode(&first, addr)?;
    assert_eq!(decoded.mid, Some(4242));
    assert_eq!(decoded.code, Code::Content);
    Ok(())
}

#[tokio::test]
async fn test_token_mismatch_is_reset() -> Result<()> {
    let (_server, addr) = test_server().await?;

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let mut request = Message::request(MessageType::Confirmable, Code::Get, addr);
    request.mid = Some(777);
    request.token = vec![0x01];
    request.set_uri_path("test");
    socket.send_to(&request.encode()?, addr).await?;

    let mut buf = [0u8; 2048];
    timeout(WAIT, socket.recv_from(&mut buf)).await??;

    // same MID, different token
    request.token = vec![0x02];
    socket.send_to(&request.encode()?, addr).await?;

    let (len, _) = timeout(WAIT, socket.recv_from(&mut buf)).await??;
    let reply = Message::decode(&buf[..len], addr)?;

    assert_eq!(reply.kind, Some(MessageType::Reset));
    assert_eq!(reply.mid, Some(777));
    Ok(())
}

#[tokio::test]
async fn test_discovery() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let response = client.discover(WAIT).await?.expect("no response");

    assert_eq!(response.code, Code::Content);
    assert_eq!(response.content_format(), Some(ContentFormat::LinkFormat));

    let body = String::from_utf8(response.payload)?;
    assert!(body.contains("</test>"));
    assert!(body.contains("rt=\"test\""));
    assert!(body.contains("</obs>"));
    Ok(())
}

#[tokio::test]
async fn test_ping() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    assert!(client.ping(WAIT).await?);
    Ok(())
}

#[tokio::test]
async fn test_observe_notifications_and_eviction() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let observer = CoapClient::connect(addr).await?;
    let mutator = CoapClient::connect(addr).await?;

    let (sink, mut stream) = unbounded_channel();
    let (stop, stop_rx) = watch::channel(false);

    let observing = tokio::spawn(async move {
        let _ = observer.observe("/obs", sink, stop_rx, WAIT).await;
    });

    let first = timeout(WAIT, stream.recv()).await?.expect("no registration");
    assert_eq!(first.code, Code::Content);
    assert_eq!(first.payload, b"5".to_vec());
    assert_eq!(first.observe(), Some(2));

    // a change to the resource produces exactly one notification
    mutator
        .put("/obs", "6", Some(ContentFormat::TextPlain), WAIT)
        .await?
        .expect("no response");

    let second = timeout(WAIT, stream.recv()).await?.expect("no notification");
    assert_eq!(second.payload, b"6".to_vec());
    assert_eq!(second.observe(), Some(3));

    // a representation switch breaks the relation with 4.06
    mutator
        .put("/obs", "{\"value\":100}", Some(ContentFormat::Json), WAIT)
        .await?
        .expect("no response");

    let third = timeout(WAIT, stream.recv()).await?.expect("no error notification");
    assert_eq!(third.code, Code::NotAcceptable);

    let _ = stop.send(true);
    let _ = timeout(WAIT, observing).await;
    Ok(())
}

#[tokio::test]
async fn test_server_side_notify() -> Result<()> {
    let (server, addr) = test_server().await?;
    let observer = CoapClient::connect(addr).await?;

    let (sink, mut stream) = unbounded_channel();
    let (stop, stop_rx) = watch::channel(false);

    let observing = tokio::spawn(async move {
        let _ = observer.observe("/obs", sink, stop_rx, WAIT).await;
    });

    timeout(WAIT, stream.recv()).await?.expect("no registration");

    // application-triggered notification without any request
    assert!(server.notify("/obs"));

    let update = timeout(WAIT, stream.recv()).await?.expect("no notification");
    assert_eq!(update.code, Code::Content);
    assert_eq!(update.payload, b"5".to_vec());

    let _ = stop.send(true);
    let _ = timeout(WAIT, observing).await;
    Ok(())
}

#[tokio::test]
async fn test_observe_deregister() -> Result<()> {
    let (_server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let mut register = client.request(Code::Get, "/obs");
    register.set_observe(0);
    let response = client.execute(register, WAIT).await?.expect("no response");
    assert_eq!(response.observe(), Some(2));

    let mut deregister = client.request(Code::Get, "/obs");
    deregister.set_observe(1);
    let response = client.execute(deregister, WAIT).await?.expect("no response");

    // the relation is gone, the reply is a plain representation
    assert_eq!(response.code, Code::Content);
    assert_eq!(response.observe(), None);
    Ok(())
}

#[tokio::test]
async fn test_put_and_delete_round() -> Result<()> {
    let (server, addr) = test_server().await?;
    let client = CoapClient::connect(addr).await?;

    let response = client
        .put("/test", "updated", Some(ContentFormat::TextPlain), WAIT)
        .await?
        .expect("no response");
    assert_eq!(response.code, Code::Changed);

    let read_back = client.get("/test", WAIT).await?.expect("no response");
    assert_eq!(read_back.payload, b"updated".to_vec());

    // Basic has no DELETE handler
    let response = client.delete("/test", WAIT).await?.expect("no response");
    assert_eq!(response.code, Code::MethodNotAllowed);
    assert!(server.get_resources(Some("/test")).contains(&"/test".to_string()));
    Ok(())
}
