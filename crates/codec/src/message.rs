use crate::{
    Error,
    block::BlockValue,
    code::Code,
    option::{self, CoapOption, ContentFormat, OptionNumber},
};

use std::{net::SocketAddr, time::Instant};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The four CoAP message types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

pub const VERSION: u8 = 1;
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// A CoAP message, plus the endpoints and the exchange status flags the
/// upper layers stamp on it while the exchange is alive.
///
/// The type and the MID stay unset (`None`) on locally created messages
/// until the message layer derives them; decode always fills them in.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub version: u8,
    pub kind: Option<MessageType>,
    pub code: Code,
    pub mid: Option<u16>,
    pub token: Vec<u8>,
    options: Vec<CoapOption>,
    pub payload: Vec<u8>,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    pub acknowledged: bool,
    pub rejected: bool,
    pub timed_out: bool,
    pub duplicated: bool,
    pub timestamp: Option<Instant>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            version: VERSION,
            kind: None,
            code: Code::Empty,
            mid: None,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
            source: None,
            destination: None,
            acknowledged: false,
            rejected: false,
            timed_out: false,
            duplicated: false,
            timestamp: None,
        }
    }
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request skeleton towards `destination`.
    pub fn request(kind: MessageType, code: Code, destination: SocketAddr) -> Self {
        Self {
            kind: Some(kind),
            code,
            destination: Some(destination),
            ..Self::default()
        }
    }

    /// The response skeleton for a received request: destination and token
    /// are mirrored, type and MID are left for the message layer.
    pub fn response_to(request: &Message) -> Self {
        Self {
            destination: request.source,
            token: request.token.clone(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.code.is_response()
    }

    #[inline]
    pub fn is_empty_message(&self) -> bool {
        self.code == Code::Empty
    }

    // ------------------------------------------------------------------
    // raw option access
    // ------------------------------------------------------------------

    /// Options in ascending number order (encode order).
    pub fn options(&self) -> Vec<&CoapOption> {
        let mut all: Vec<&CoapOption> = self.options.iter().collect();
        all.sort_by_key(|o| o.number);
        all
    }

    pub fn add_option(&mut self, option: CoapOption) {
        self.options.push(option);
    }

    /// Replace every instance of an option with a single new value.
    pub fn set_option(&mut self, option: CoapOption) {
        self.del_option(option.number);
        self.options.push(option);
    }

    pub fn del_option(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    pub fn clear_options(&mut self) {
        self.options.clear();
    }

    pub fn first_option(&self, number: OptionNumber) -> Option<&CoapOption> {
        let number = u16::from(number);
        self.options.iter().find(|o| o.number == number)
    }

    pub fn option_values(&self, number: OptionNumber) -> impl Iterator<Item = &CoapOption> {
        let number = u16::from(number);
        self.options.iter().filter(move |o| o.number == number)
    }

    pub fn has_option(&self, number: OptionNumber) -> bool {
        self.first_option(number).is_some()
    }

    // ------------------------------------------------------------------
    // typed accessors
    // ------------------------------------------------------------------

    /// Uri-Path segments joined with `/`, without the leading slash.
    ///
    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::Message;
    ///
    /// let mut message = Message::new();
    /// message.set_uri_path("/sensors/temp/");
    ///
    /// assert_eq!(message.uri_path(), "sensors/temp");
    /// assert_eq!(message.options().len(), 2);
    /// ```
    pub fn uri_path(&self) -> String {
        self.option_values(OptionNumber::UriPath)
            .map(|o| o.string_value())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn set_uri_path(&mut self, path: &str) {
        self.del_option(OptionNumber::UriPath.into());
        for segment in path.trim_matches('/').split('/') {
            if !segment.is_empty() {
                self.add_option(CoapOption::string(OptionNumber::UriPath, segment));
            }
        }
    }

    pub fn uri_query(&self) -> Option<String> {
        let queries: Vec<String> = self
            .option_values(OptionNumber::UriQuery)
            .map(|o| o.string_value())
            .collect();
        if queries.is_empty() {
            None
        } else {
            Some(queries.join("&"))
        }
    }

    pub fn set_uri_query(&mut self, query: &str) {
        self.del_option(OptionNumber::UriQuery.into());
        for q in query.split('&') {
            self.add_option(CoapOption::string(OptionNumber::UriQuery, q));
        }
    }

    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::Message;
    ///
    /// let mut message = Message::new();
    /// assert_eq!(message.observe(), None);
    ///
    /// message.set_observe(0);
    /// assert_eq!(message.observe(), Some(0));
    ///
    /// message.clear_observe();
    /// assert_eq!(message.observe(), None);
    /// ```
    pub fn observe(&self) -> Option<u32> {
        self.first_option(OptionNumber::Observe)
            .map(|o| o.uint_value())
    }

    pub fn set_observe(&mut self, value: u32) {
        self.set_option(CoapOption::uint(OptionNumber::Observe, value));
    }

    pub fn clear_observe(&mut self) {
        self.del_option(OptionNumber::Observe.into());
    }

    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::{BlockValue, Message};
    ///
    /// let mut message = Message::new();
    /// message.set_block1(BlockValue::new(3, true, 1024).unwrap());
    ///
    /// let block = message.block1().unwrap();
    /// assert_eq!(block.num, 3);
    /// assert!(block.more);
    /// assert_eq!(block.size, 1024);
    /// ```
    pub fn block1(&self) -> Option<BlockValue> {
        self.first_option(OptionNumber::Block1)
            .and_then(|o| BlockValue::from_bytes(&o.value).ok())
    }

    pub fn set_block1(&mut self, block: BlockValue) {
        self.set_option(CoapOption::new(OptionNumber::Block1, block.to_bytes()));
    }

    pub fn clear_block1(&mut self) {
        self.del_option(OptionNumber::Block1.into());
    }

    pub fn block2(&self) -> Option<BlockValue> {
        self.first_option(OptionNumber::Block2)
            .and_then(|o| BlockValue::from_bytes(&o.value).ok())
    }

    pub fn set_block2(&mut self, block: BlockValue) {
        self.set_option(CoapOption::new(OptionNumber::Block2, block.to_bytes()));
    }

    pub fn clear_block2(&mut self) {
        self.del_option(OptionNumber::Block2.into());
    }

    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::{ContentFormat, Message};
    ///
    /// let mut message = Message::new();
    /// message.set_content_format(ContentFormat::Json);
    ///
    /// assert_eq!(message.content_format(), Some(ContentFormat::Json));
    /// ```
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.first_option(OptionNumber::ContentFormat)
            .and_then(|o| ContentFormat::try_from(o.uint_value() as u16).ok())
    }

    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.set_option(CoapOption::uint(
            OptionNumber::ContentFormat,
            u16::from(format) as u32,
        ));
    }

    pub fn accept(&self) -> Option<ContentFormat> {
        self.first_option(OptionNumber::Accept)
            .and_then(|o| ContentFormat::try_from(o.uint_value() as u16).ok())
    }

    pub fn set_accept(&mut self, format: ContentFormat) {
        self.set_option(CoapOption::uint(
            OptionNumber::Accept,
            u16::from(format) as u32,
        ));
    }

    pub fn max_age(&self) -> Option<u32> {
        self.first_option(OptionNumber::MaxAge)
            .map(|o| o.uint_value())
    }

    pub fn set_max_age(&mut self, seconds: u32) {
        self.set_option(CoapOption::uint(OptionNumber::MaxAge, seconds));
    }

    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::Message;
    ///
    /// let mut message = Message::new();
    /// message.add_etag(b"v1");
    /// message.add_etag(b"v2");
    ///
    /// assert_eq!(message.etags(), vec![b"v1".as_slice(), b"v2".as_slice()]);
    /// ```
    pub fn etags(&self) -> Vec<&[u8]> {
        self.option_values(OptionNumber::ETag)
            .map(|o| o.value.as_slice())
            .collect()
    }

    pub fn add_etag(&mut self, etag: &[u8]) {
        self.add_option(CoapOption::new(OptionNumber::ETag, etag.to_vec()));
    }

    pub fn if_match(&self) -> Vec<&[u8]> {
        self.option_values(OptionNumber::IfMatch)
            .map(|o| o.value.as_slice())
            .collect()
    }

    pub fn add_if_match(&mut self, etag: &[u8]) {
        self.add_option(CoapOption::new(OptionNumber::IfMatch, etag.to_vec()));
    }

    pub fn if_none_match(&self) -> bool {
        self.has_option(OptionNumber::IfNoneMatch)
    }

    pub fn set_if_none_match(&mut self) {
        self.set_option(CoapOption::new(OptionNumber::IfNoneMatch, Vec::new()));
    }

    pub fn location_path(&self) -> String {
        self.option_values(OptionNumber::LocationPath)
            .map(|o| o.string_value())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn set_location_path(&mut self, path: &str) {
        self.del_option(OptionNumber::LocationPath.into());
        for segment in path.trim_matches('/').split('/') {
            if !segment.is_empty() {
                self.add_option(CoapOption::string(OptionNumber::LocationPath, segment));
            }
        }
    }

    pub fn location_query(&self) -> String {
        self.option_values(OptionNumber::LocationQuery)
            .map(|o| o.string_value())
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn set_location_query(&mut self, query: &str) {
        self.del_option(OptionNumber::LocationQuery.into());
        for q in query.split('&') {
            self.add_option(CoapOption::string(OptionNumber::LocationQuery, q));
        }
    }

    pub fn proxy_uri(&self) -> Option<String> {
        self.first_option(OptionNumber::ProxyUri)
            .map(|o| o.string_value())
    }

    pub fn set_proxy_uri(&mut self, uri: &str) {
        self.set_option(CoapOption::string(OptionNumber::ProxyUri, uri));
    }

    pub fn proxy_scheme(&self) -> Option<String> {
        self.first_option(OptionNumber::ProxyScheme)
            .map(|o| o.string_value())
    }

    pub fn set_proxy_scheme(&mut self, scheme: &str) {
        self.set_option(CoapOption::string(OptionNumber::ProxyScheme, scheme));
    }

    pub fn size1(&self) -> Option<u32> {
        self.first_option(OptionNumber::Size1)
            .map(|o| o.uint_value())
    }

    pub fn set_size1(&mut self, size: u32) {
        self.set_option(CoapOption::uint(OptionNumber::Size1, size));
    }

    pub fn no_response(&self) -> bool {
        self.has_option(OptionNumber::NoResponse)
    }

    /// Suppress all response classes (RFC 7967, section 2.1).
    pub fn set_no_response(&mut self) {
        self.set_option(CoapOption::uint(OptionNumber::NoResponse, 26));
    }

    // ------------------------------------------------------------------
    // wire format
    // ------------------------------------------------------------------

    /// Decode one datagram.
    ///
    /// Unknown elective options are skipped; a reserved version, token
    /// length, code class, option nibble, a critical option outside the
    /// registry, or a payload marker with nothing behind it reject the
    /// datagram with the inbound MID attached so the caller can RST.
    ///
    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::{Code, Message, MessageType};
    ///
    /// // CON GET, MID 0x30F9, token 0x7B, Uri-Path "test".
    /// let buffer = [
    ///     0x41u8, 0x01, 0x30, 0xF9, 0x7B, 0xB4, 0x74, 0x65, 0x73, 0x74,
    /// ];
    ///
    /// let message = Message::decode(&buffer, "127.0.0.1:5683".parse().unwrap()).unwrap();
    ///
    /// assert_eq!(message.kind, Some(MessageType::Confirmable));
    /// assert_eq!(message.code, Code::Get);
    /// assert_eq!(message.mid, Some(0x30F9));
    /// assert_eq!(message.token, vec![0x7B]);
    /// assert_eq!(message.uri_path(), "test");
    /// ```
    pub fn decode(data: &[u8], source: SocketAddr) -> Result<Self, Error> {
        if data.len() < 4 {
            return Err(Error::TooShort);
        }

        let mid = u16::from_be_bytes([data[2], data[3]]);
        let version = data[0] >> 6;
        let kind = MessageType::try_from((data[0] >> 4) & 0x03).unwrap();
        let tkl = (data[0] & 0x0F) as usize;

        if version != VERSION {
            return Err(Error::UnsupportedVersion { mid });
        }

        if tkl >= 9 {
            return Err(Error::ReservedTokenLength { mid });
        }

        if matches!(data[1] >> 5, 1 | 6 | 7) {
            return Err(Error::ReservedCodeClass { mid });
        }

        let code = Code::try_from(data[1]).map_err(|_| Error::UnknownCode { mid })?;

        if data.len() < 4 + tkl {
            return Err(Error::Truncated { mid });
        }

        let token = data[4..4 + tkl].to_vec();
        let mut message = Self {
            kind: Some(kind),
            code,
            mid: Some(mid),
            token,
            source: Some(source),
            ..Self::default()
        };

        // Option block: delta + length nibbles with the 13/14 extension
        // scheme, running option number accumulated across entries.
        let mut offset = 4 + tkl;
        let mut number = 0u32;

        while offset < data.len() {
            if data[offset] == PAYLOAD_MARKER {
                offset += 1;
                if offset == data.len() {
                    return Err(Error::PayloadMarkerOnly { mid });
                }

                message.payload = data[offset..].to_vec();
                break;
            }

            let field = data[offset];
            offset += 1;

            let (delta, used) = read_extended(field >> 4, &data[offset..], mid)?;
            offset += used;
            let (length, used) = read_extended(field & 0x0F, &data[offset..], mid)?;
            offset += used;

            number += delta;
            if number > u16::MAX as u32 {
                return Err(Error::MalformedOption { mid });
            }

            let length = length as usize;
            if data.len() - offset < length {
                return Err(Error::MalformedOption { mid });
            }

            let value = data[offset..offset + length].to_vec();
            offset += length;

            if OptionNumber::try_from(number as u16).is_ok() {
                message.options.push(CoapOption {
                    number: number as u16,
                    value,
                });
            } else if option::is_critical(number as u16) {
                return Err(Error::UnknownCriticalOption {
                    number: number as u16,
                    mid,
                });
            }
        }

        Ok(message)
    }

    /// Encode into a datagram. Type, code and MID must be resolved by now.
    ///
    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::{Code, Message, MessageType};
    ///
    /// let buffer = [
    ///     0x41u8, 0x01, 0x30, 0xF9, 0x7B, 0xB4, 0x74, 0x65, 0x73, 0x74,
    /// ];
    ///
    /// let message = Message::decode(&buffer, "127.0.0.1:5683".parse().unwrap()).unwrap();
    ///
    /// assert_eq!(&message.encode().unwrap()[..], &buffer[..]);
    /// ```
    pub fn encode(&self) -> Result<BytesMut, Error> {
        let kind = self.kind.ok_or(Error::Incomplete)?;
        let mid = self.mid.ok_or(Error::Incomplete)?;

        let mut bytes = BytesMut::with_capacity(4 + self.token.len() + self.payload.len() + 64);
        bytes.put_u8((VERSION << 6) | (u8::from(kind) << 4) | self.token.len() as u8);
        bytes.put_u8(self.code.into());
        bytes.put_u16(mid);
        bytes.put(self.token.as_slice());

        let mut last_number = 0u16;
        for option in self.options() {
            let (delta, ext_delta) = write_extended(option.number - last_number);
            let (length, ext_length) = write_extended(option.value.len() as u16);

            bytes.put_u8((delta << 4) | length);
            bytes.put(ext_delta.as_slice());
            bytes.put(ext_length.as_slice());
            bytes.put(option.value.as_slice());

            last_number = option.number;
        }

        if !self.payload.is_empty() {
            bytes.put_u8(PAYLOAD_MARKER);
            bytes.put(self.payload.as_slice());
        }

        Ok(bytes)
    }
}

fn read_extended(nibble: u8, data: &[u8], mid: u16) -> Result<(u32, usize), Error> {
    match nibble {
        0..=12 => Ok((nibble as u32, 0)),
        13 => {
            if data.is_empty() {
                return Err(Error::MalformedOption { mid });
            }

            Ok((data[0] as u32 + 13, 1))
        }
        14 => {
            if data.len() < 2 {
                return Err(Error::MalformedOption { mid });
            }

            Ok((u16::from_be_bytes([data[0], data[1]]) as u32 + 269, 2))
        }
        _ => Err(Error::MalformedOption { mid }),
    }
}

fn write_extended(value: u16) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, (value - 269).to_be_bytes().to_vec()),
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            Some(MessageType::Confirmable) => "CON",
            Some(MessageType::NonConfirmable) => "NON",
            Some(MessageType::Acknowledgement) => "ACK",
            Some(MessageType::Reset) => "RST",
            None => "???",
        };

        write!(
            f,
            "{}-{} {} token={:02x?} options={} payload={}b",
            kind,
            self.mid.map(|m| m.to_string()).unwrap_or_default(),
            self.code,
            self.token,
            self.options.len(),
            self.payload.len(),
        )
    }
}
