use anyhow::Result;
use coap_endpoint_codec::{
    BlockValue, Code, ContentFormat, Error, Message, MessageType,
    option::{CoapOption, OptionNumber},
};

use std::net::SocketAddr;

fn source() -> SocketAddr {
    "127.0.0.1:5683".parse().unwrap()
}

#[test]
#[rustfmt::skip]
fn test_decode_piggybacked_notification() -> Result<()> {
    // ACK 2.05, MID 0x1234, token AA BB, Observe 3, Content-Format 0,
    // Block2 1/0/1024, payload "He".
    let buffer = [
        0x62u8, 0x45, 0x12, 0x34, 0xAA, 0xBB,
        0x61, 0x03,
        0x60,
        0xB1, 0x16,
        0xFF, 0x48, 0x65,
    ];

    let message = Message::decode(&buffer, source())?;

    assert_eq!(message.kind, Some(MessageType::Acknowledgement));
    assert_eq!(message.code, Code::Content);
    assert_eq!(message.mid, Some(0x1234));
    assert_eq!(message.token, vec![0xAA, 0xBB]);
    assert_eq!(message.observe(), Some(3));
    assert_eq!(message.content_format(), Some(ContentFormat::TextPlain));
    assert_eq!(message.block2(), Some(BlockValue::new(1, false, 1024)?));
    assert_eq!(message.payload, b"He");

    // Round trip on every field that reaches the wire.
    assert_eq!(&message.encode()?[..], &buffer[..]);

    Ok(())
}

#[test]
#[rustfmt::skip]
fn test_decode_extended_option_delta() -> Result<()> {
    // CON GET, Uri-Path "x" followed by No-Response (258), whose delta of
    // 247 needs the one-byte extension field.
    let buffer = [
        0x40u8, 0x01, 0x00, 0x01,
        0xB1, 0x78,
        0xD1, 0xEA, 0x1A,
    ];

    let message = Message::decode(&buffer, source())?;

    assert_eq!(message.uri_path(), "x");
    assert!(message.no_response());
    assert_eq!(&message.encode()?[..], &buffer[..]);

    Ok(())
}

#[test]
fn test_two_byte_extension_round_trip() -> Result<()> {
    // A Proxy-Uri longer than 268 bytes forces the two-byte length
    // extension on encode.
    let uri = "coap://example.org/".repeat(20);
    assert!(uri.len() > 268);

    let mut message = Message::request(MessageType::Confirmable, Code::Get, source());
    message.mid = Some(7);
    message.set_proxy_uri(&uri);

    let wire = message.encode()?;
    let decoded = Message::decode(&wire, source())?;

    assert_eq!(decoded.proxy_uri().as_deref(), Some(uri.as_str()));
    Ok(())
}

#[test]
fn test_options_encoded_in_ascending_order() -> Result<()> {
    let mut message = Message::request(MessageType::Confirmable, Code::Get, source());
    message.mid = Some(1);
    message.set_accept(ContentFormat::Json);
    message.set_uri_path("sensors/temp");
    message.set_observe(0);

    let wire = message.encode()?;
    let decoded = Message::decode(&wire, source())?;

    let numbers: Vec<u16> = decoded.options().iter().map(|o| o.number).collect();
    let mut sorted = numbers.clone();
    sorted.sort();

    assert_eq!(numbers, sorted);
    assert_eq!(decoded.uri_path(), "sensors/temp");
    assert_eq!(decoded.observe(), Some(0));
    assert_eq!(decoded.accept(), Some(ContentFormat::Json));
    Ok(())
}

#[test]
#[rustfmt::skip]
fn test_decode_rejections() {
    // Token lengths 9-15 are reserved.
    assert_eq!(
        Message::decode(&[0x49, 0x01, 0x00, 0x10], source()),
        Err(Error::ReservedTokenLength { mid: 0x10 }),
    );

    // Only version 1 exists.
    assert_eq!(
        Message::decode(&[0x81, 0x01, 0x00, 0x11], source()),
        Err(Error::UnsupportedVersion { mid: 0x11 }),
    );

    // Code classes 1, 6 and 7 are reserved.
    assert_eq!(
        Message::decode(&[0x40, 0x25, 0x00, 0x12], source()),
        Err(Error::ReservedCodeClass { mid: 0x12 }),
    );

    // A payload marker must be followed by a payload.
    assert_eq!(
        Message::decode(&[0x40, 0x01, 0x00, 0x13, 0xFF], source()),
        Err(Error::PayloadMarkerOnly { mid: 0x13 }),
    );

    // Option 9 (OSCORE) is outside the registry and critical.
    assert_eq!(
        Message::decode(&[0x40, 0x01, 0x00, 0x14, 0x90], source()),
        Err(Error::UnknownCriticalOption { number: 9, mid: 0x14 }),
    );

    // The RST sent back names the offending MID.
    let err = Message::decode(&[0x40, 0x25, 0x00, 0x12], source()).unwrap_err();
    assert_eq!(err.mid(), Some(0x12));
}

#[test]
#[rustfmt::skip]
fn test_unknown_elective_option_skipped() -> Result<()> {
    // Uri-Path "x", then option 28 (Size2, elective, unknown here): the
    // decoder drops it and keeps the rest of the message.
    let buffer = [
        0x40u8, 0x01, 0x00, 0x15,
        0xB1, 0x78,
        0xD1, 0x04, 0x2A,
    ];

    let message = Message::decode(&buffer, source())?;

    assert_eq!(message.uri_path(), "x");
    assert_eq!(message.options().len(), 1);
    Ok(())
}

#[test]
fn test_block_value_packing() -> Result<()> {
    for num in [0u32, 1, 2, 42, 99_999, (1 << 20) - 1] {
        for more in [false, true] {
            for size in [16u16, 32, 64, 128, 256, 512, 1024] {
                let block = BlockValue::new(num, more, size)?;
                assert_eq!(BlockValue::unpack(block.pack())?, block);
                assert_eq!(BlockValue::from_bytes(&block.to_bytes())?, block);
            }
        }
    }

    // SZX 7 is reserved.
    assert_eq!(BlockValue::unpack(0x17), Err(Error::ReservedBlockSize));
    Ok(())
}

#[test]
fn test_empty_message_round_trip() -> Result<()> {
    let mut rst = Message::new();
    rst.kind = Some(MessageType::Reset);
    rst.mid = Some(0xBEEF);

    let wire = rst.encode()?;
    assert_eq!(&wire[..], &[0x70, 0x00, 0xBE, 0xEF]);

    let decoded = Message::decode(&wire, source())?;
    assert!(decoded.is_empty_message());
    assert_eq!(decoded.kind, Some(MessageType::Reset));
    Ok(())
}

#[test]
fn test_repeatable_options_preserved() -> Result<()> {
    let mut message = Message::request(MessageType::Confirmable, Code::Put, source());
    message.mid = Some(2);
    message.add_etag(b"v1");
    message.add_if_match(b"v1");
    message.add_if_match(b"v2");
    message.add_option(CoapOption::new(OptionNumber::IfMatch, Vec::new()));

    let decoded = Message::decode(&message.encode()?, source())?;

    assert_eq!(decoded.etags(), vec![b"v1".as_slice()]);
    assert_eq!(
        decoded.if_match(),
        vec![b"v1".as_slice(), b"v2".as_slice(), b"".as_slice()],
    );
    Ok(())
}
