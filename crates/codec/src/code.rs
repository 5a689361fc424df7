use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Message code: a 3-bit class and a 5-bit detail, written `c.dd`.
///
/// Class 0 with a non-zero detail is a request method, class 2 a success
/// response, classes 4 and 5 error responses. `0.00` is the Empty message,
/// which is neither a request nor a response.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Code {
    Empty = 0x00,
    Get = 0x01,
    Post = 0x02,
    Put = 0x03,
    Delete = 0x04,

    Created = 0x41,
    Deleted = 0x42,
    Valid = 0x43,
    Changed = 0x44,
    Content = 0x45,
    Continue = 0x5F,

    BadRequest = 0x80,
    Unauthorized = 0x81,
    BadOption = 0x82,
    Forbidden = 0x83,
    NotFound = 0x84,
    MethodNotAllowed = 0x85,
    NotAcceptable = 0x86,
    RequestEntityIncomplete = 0x88,
    PreconditionFailed = 0x8C,
    RequestEntityTooLarge = 0x8D,
    UnsupportedContentFormat = 0x8F,

    InternalServerError = 0xA0,
    NotImplemented = 0xA1,
    BadGateway = 0xA2,
    ServiceUnavailable = 0xA3,
    GatewayTimeout = 0xA4,
    ProxyingNotSupported = 0xA5,
}

impl Code {
    #[inline]
    pub fn class(self) -> u8 {
        u8::from(self) >> 5
    }

    #[inline]
    pub fn detail(self) -> u8 {
        u8::from(self) & 0x1F
    }

    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::Code;
    ///
    /// assert!(Code::Get.is_request());
    /// assert!(!Code::Empty.is_request());
    /// assert!(!Code::Content.is_request());
    /// ```
    pub fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    pub fn is_response(self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }

    pub fn is_error(self) -> bool {
        self.class() >= 4
    }
}

impl std::fmt::Display for Code {
    /// # Test
    ///
    /// ```
    /// use coap_endpoint_codec::Code;
    ///
    /// assert_eq!(Code::Content.to_string(), "2.05");
    /// assert_eq!(Code::NotFound.to_string(), "4.04");
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}
