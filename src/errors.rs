use nom;
use num::FromPrimitive;

use ldap::BindResult;

/// Failures of the relay session and its three step bind exchange.
#[derive(Debug, Fail)]
pub enum RelayError {
    #[fail(display = "fail to connect {}, {}", _0, _1)] ConnectionError(String, String),

    #[fail(display = "a bind exchange is already in progress on this session")] ProtocolState,

    #[fail(display = "could not discover authentication methods, server replied: {:?}", _0)] Discovery(BindResult),

    #[fail(display = "server did not offer NTLM authentication, offered: {:?}", _0)] UnsupportedMechanism(Vec<String>),

    #[fail(display = "malformed authenticate token, {}", _0)] MalformedToken(String),

    #[fail(display = "NTLM negotiation failed with result code {}, {}", _0, _1)] NegotiationFailed(u32, String),

    #[fail(display = "session is not connected")] NotConnected,

    #[fail(display = "session lock poisoned")] LockPoisoned,
}

/// Invalid relay target settings.
#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "unsupported scheme `{}`", _0)] UnsupportedScheme(String),

    #[fail(display = "invalid host `{}`", _0)] InvalidHost(String),

    #[fail(display = "invalid port `{}`", _0)] InvalidPort(String),
}

/// Failures decoding NTLM, SPNEGO or LDAP wire data.
#[derive(Debug, Fail)]
pub enum DecodeError {
    #[fail(display = "incomplete message, {:?}", _0)] IncompleteMessage(nom::Needed),

    #[fail(display = "invalid message, {:?}", _0)] InvalidMessage(nom::ErrorKind),

    #[fail(display = "message signature mismatched")] MismatchedSignature,

    #[fail(display = "message type mismatched")] MismatchedMsgType,

    #[fail(display = "unexpected tag")] UnexpectedTag,

    #[fail(display = "invalid length")] InvalidLength,

    #[fail(display = "message offset overflow")] OffsetOverflow,
}

impl<P> From<nom::Err<P>> for DecodeError {
    fn from(err: nom::Err<P>) -> Self {
        match err {
            nom::Err::Code(kind)
            | nom::Err::Node(kind, _)
            | nom::Err::Position(kind, _)
            | nom::Err::NodePosition(kind, _, _) => DecodeError::from(kind),
        }
    }
}

impl From<nom::Needed> for DecodeError {
    fn from(needed: nom::Needed) -> Self {
        DecodeError::IncompleteMessage(needed)
    }
}

impl From<nom::ErrorKind> for DecodeError {
    fn from(err: nom::ErrorKind) -> Self {
        match err {
            nom::ErrorKind::Custom(code) => match ParseError::from_u32(code) {
                Some(ParseError::MismatchedSignature) => DecodeError::MismatchedSignature,
                Some(ParseError::MismatchedMsgType) => DecodeError::MismatchedMsgType,
                Some(ParseError::UnexpectedTag) => DecodeError::UnexpectedTag,
                Some(ParseError::InvalidLength) => DecodeError::InvalidLength,
                None => DecodeError::InvalidMessage(err),
            },
            _ => DecodeError::InvalidMessage(err),
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub enum ParseError {
    MismatchedSignature,
    MismatchedMsgType,
    UnexpectedTag,
    InvalidLength,
}

/// Turns a parser result into `(remaining, output)` or a `DecodeError`.
pub fn decoded<I, O>(result: nom::IResult<I, O>) -> Result<(I, O), DecodeError> {
    match result {
        nom::IResult::Done(remaining, output) => Ok((remaining, output)),
        nom::IResult::Error(err) => Err(DecodeError::from(err)),
        nom::IResult::Incomplete(needed) => Err(DecodeError::from(needed)),
    }
}
