#![allow(non_upper_case_globals)]

use std::borrow::Cow;

use byteorder::LittleEndian;
use bytes::BufMut;
use encoding::{DecoderTrap, Encoding};
use encoding::codec::utf_16::UTF_16LE_ENCODING;
use failure::Error;
use nom;
use num::FromPrimitive;

use errors::{decoded, DecodeError};
use errors::ParseError::{MismatchedMsgType, MismatchedSignature};

/// A 16-bit unsigned integer that defines the information type in the Value field.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
#[repr(u16)]
pub enum AvId {
    /// Indicates that this is the last AV_PAIR in the list.
    EOL,
    /// The server's NetBIOS computer name.
    NbComputerName,
    /// The server's NetBIOS domain name.
    NbDomainName,
    /// The fully qualified domain name (FQDN) of the computer.
    DnsComputerName,
    /// The FQDN of the domain.
    DnsDomainName,
    /// The FQDN of the forest.
    DnsTreeName,
    /// A 32-bit value indicating server or client configuration.
    Flags,
    /// A FILETIME structure in little-endian byte order that contains the server local time.
    Timestamp,
    /// A Single_Host_Data structure.
    SingleHost,
    /// The SPN of the target server.
    TargetName,
    /// A channel bindings hash.
    ChannelBindings,
}

/// The `AvPair` structure defines an attribute/value pair.
#[derive(Clone, Debug, PartialEq)]
pub struct AvPair<'a> {
    pub id: AvId,
    pub value: Cow<'a, [u8]>,
}

impl<'a> AvPair<'a> {
    pub fn into_owned(self) -> AvPair<'static> {
        AvPair {
            id: self.id,
            value: Cow::Owned(self.value.into_owned()),
        }
    }

    /// Decodes the value of one of the name pairs, which are always UTF-16LE.
    pub fn to_name(&self) -> Option<String> {
        match self.id {
            AvId::NbComputerName
            | AvId::NbDomainName
            | AvId::DnsComputerName
            | AvId::DnsDomainName
            | AvId::DnsTreeName
            | AvId::TargetName => UTF_16LE_ENCODING
                .decode(self.value.as_ref(), DecoderTrap::Replace)
                .ok(),
            _ => None,
        }
    }
}

bitflags! {
    /// These flags define client or server NTLM capabilities supported by the sender.
    ///
    /// Every bit of the flag word has a name, reserved ones included,
    /// so a parsed message can be written back without losing bits.
    pub struct NegotiateFlags: u32 {
        /// If set, requests Unicode character set encoding.
        const NTLMSSP_NEGOTIATE_UNICODE = 0x0000_0001;
        /// If set, requests OEM character set encoding.
        const NTLM_NEGOTIATE_OEM = 0x0000_0002;
        /// If set, a TargetName field of the CHALLENGE_MESSAGE MUST be supplied.
        const NTLMSSP_REQUEST_TARGET = 0x0000_0004;
        const NTLMSSP_RESERVED_R10 = 0x0000_0008;
        /// If set, requests session key negotiation for message signatures.
        const NTLMSSP_NEGOTIATE_SIGN = 0x0000_0010;
        /// If set, requests session key negotiation for message confidentiality.
        const NTLMSSP_NEGOTIATE_SEAL = 0x0000_0020;
        /// If set, requests connectionless authentication.
        const NTLMSSP_NEGOTIATE_DATAGRAM = 0x0000_0040;
        /// If set, requests LAN Manager (LM) session key computation.
        const NTLMSSP_NEGOTIATE_LM_KEY = 0x0000_0080;
        const NTLMSSP_RESERVED_R9 = 0x0000_0100;
        /// If set, requests usage of the NTLM v1 session security protocol.
        const NTLMSSP_NEGOTIATE_NTLM = 0x0000_0200;
        const NTLMSSP_RESERVED_R8 = 0x0000_0400;
        /// If set, the connection SHOULD be anonymous.
        const NTLMSSP_NEGOTIATE_ANONYMOUS = 0x0000_0800;
        /// If set, the domain name is provided.
        const NTLMSSP_NEGOTIATE_OEM_DOMAIN_SUPPLIED = 0x0000_1000;
        /// This flag indicates whether the Workstation field is present.
        const NTLMSSP_NEGOTIATE_OEM_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NTLMSSP_RESERVED_R7 = 0x0000_4000;
        /// If set, requests the presence of a signature block on all messages.
        const NTLMSSP_NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;
        /// If set, TargetName MUST be a domain name.
        const NTLMSSP_TARGET_TYPE_DOMAIN = 0x0001_0000;
        /// If set, TargetName MUST be a server name.
        const NTLMSSP_TARGET_TYPE_SERVER = 0x0002_0000;
        const NTLMSSP_RESERVED_R6 = 0x0004_0000;
        /// If set, requests usage of the NTLM v2 session security.
        const NTLMSSP_NEGOTIATE_EXTENDED_SESSIONSECURITY = 0x0008_0000;
        /// If set, requests an identify level token.
        const NTLMSSP_NEGOTIATE_IDENTIFY = 0x0010_0000;
        const NTLMSSP_RESERVED_R5 = 0x0020_0000;
        /// If set, requests the usage of the LMOWF.
        const NTLMSSP_REQUEST_NON_NT_SESSION_KEY = 0x0040_0000;
        /// If set, indicates that the TargetInfo fields in the `ChallengeMessage` are populated.
        const NTLMSSP_NEGOTIATE_TARGET_INFO = 0x0080_0000;
        const NTLMSSP_RESERVED_R4 = 0x0100_0000;
        /// If set, requests the protocol version number.
        const NTLMSSP_NEGOTIATE_VERSION = 0x0200_0000;
        const NTLMSSP_RESERVED_R3 = 0x0400_0000;
        const NTLMSSP_RESERVED_R2 = 0x0800_0000;
        const NTLMSSP_RESERVED_R1 = 0x1000_0000;
        /// If set, requests 128-bit session key negotiation.
        const NTLMSSP_NEGOTIATE_128 = 0x2000_0000;
        /// If set, requests an explicit key exchange.
        const NTLMSSP_NEGOTIATE_KEY_EXCH = 0x4000_0000;
        /// If set, requests 56-bit encryption.
        const NTLMSSP_NEGOTIATE_56 = 0x8000_0000;
    }
}

/// There are 3 types of messages in NTLM.
///
/// See [MS-NLMP] Section 2.2.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
#[repr(u32)]
pub enum MessageType {
    Negotiate = 0x01,
    Challenge = 0x02,
    Authenticate = 0x03,
}

/// Returns the type of an NTLM message without parsing the rest of it.
pub fn message_type(payload: &[u8]) -> Option<MessageType> {
    if payload.len() < kSignatureSize + kMesssageTypeSize || &payload[..kSignatureSize] != kSignature {
        return None;
    }

    let msg_type = payload[8..12]
        .iter()
        .rev()
        .fold(0u32, |v, &b| v << 8 | b as u32);

    MessageType::from_u32(msg_type)
}

/// The `Version` structure contains operating system version information that should be ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub revision: u8,
}

impl Version {
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<usize, Error> {
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
        buf.put_u16::<LittleEndian>(self.build);
        buf.put_uint::<LittleEndian>(0, 3);
        buf.put_u8(self.revision);

        Ok(kVersionSize)
    }
}

/// The `NegotiateMessage` defines an NTLM Negotiate message that is sent from the client to the server.
#[derive(Clone, Debug, PartialEq)]
pub struct NegotiateMessage<'a> {
    /// The client sets flags to indicate options it supports.
    pub flags: NegotiateFlags,
    pub domain_name: Option<Cow<'a, [u8]>>,
    pub workstation_name: Option<Cow<'a, [u8]>>,
    /// This structure should be used for debugging purposes only.
    pub version: Option<Version>,
}

impl<'a> NegotiateMessage<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<NegotiateMessage<'a>, Error> {
        let (remaining, (mut msg, domain_name_field, workstation_name_field)) =
            decoded(parse_negotiate_message(payload))?;
        let offset = payload.len() - remaining.len();

        if msg.flags
            .contains(NegotiateFlags::NTLMSSP_NEGOTIATE_OEM_DOMAIN_SUPPLIED)
            && domain_name_field.length > 0
        {
            msg.domain_name = Some(Cow::from(domain_name_field.slice(remaining, offset)?));
        }

        if msg.flags
            .contains(NegotiateFlags::NTLMSSP_NEGOTIATE_OEM_WORKSTATION_SUPPLIED)
            && workstation_name_field.length > 0
        {
            msg.workstation_name = Some(Cow::from(workstation_name_field.slice(remaining, offset)?));
        }

        Ok(msg)
    }

    /// Clears the given flags, e.g. `NTLMSSP_NEGOTIATE_SIGN` so the target
    /// does not switch on message signing for the session.
    pub fn strip_flags(&mut self, flags: NegotiateFlags) {
        self.flags.remove(flags);
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<usize, Error> {
        let mut offset = kSignatureSize + kMesssageTypeSize + kFlagsSize + kFieldSize * 2 + if self.version.is_some() {
            kVersionSize
        } else {
            0
        };

        buf.put_slice(kSignature);
        buf.put_u32::<LittleEndian>(MessageType::Negotiate as u32);

        let mut flags = self.flags;

        if self.domain_name.is_some() {
            flags |= NegotiateFlags::NTLMSSP_NEGOTIATE_OEM_DOMAIN_SUPPLIED;
        }

        if self.workstation_name.is_some() {
            flags |= NegotiateFlags::NTLMSSP_NEGOTIATE_OEM_WORKSTATION_SUPPLIED;
        }

        if self.version.is_some() {
            flags |= NegotiateFlags::NTLMSSP_NEGOTIATE_VERSION;
        }

        buf.put_u32::<LittleEndian>(flags.bits());

        offset = write_field(buf, self.domain_name.as_ref().map(|v| v.as_ref()), offset);
        offset = write_field(buf, self.workstation_name.as_ref().map(|v| v.as_ref()), offset);

        if let Some(ref version) = self.version {
            version.write_to(buf)?;
        }

        if let Some(ref domain_name) = self.domain_name {
            buf.put_slice(domain_name.as_ref());
        }

        if let Some(ref workstation_name) = self.workstation_name {
            buf.put_slice(workstation_name.as_ref());
        }

        Ok(offset)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![];

        self.write_to(&mut buf)?;

        Ok(buf)
    }
}

/// The `ChallengeMessage` defines an NTLM challenge message
/// that is sent from the server to the client.
///
/// The relay never answers it; it only hands it back to the client being relayed.
#[derive(Clone, Debug, PartialEq)]
pub struct ChallengeMessage<'a> {
    pub flags: NegotiateFlags,
    /// A 64-bit value that contains the NTLM challenge.
    pub server_challenge: u64,
    pub target_name: Option<Cow<'a, [u8]>>,
    pub target_info: Option<Vec<AvPair<'a>>>,
    /// This structure should be used for debugging purposes only.
    pub version: Option<Version>,
}

impl<'a> ChallengeMessage<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<ChallengeMessage<'a>, Error> {
        let (remaining, (mut msg, target_name_field, target_info_field)) =
            decoded(parse_challenge_message(payload))?;
        let offset = payload.len() - remaining.len();

        if msg.flags.intersects(
            NegotiateFlags::NTLMSSP_REQUEST_TARGET | NegotiateFlags::NTLMSSP_TARGET_TYPE_DOMAIN
                | NegotiateFlags::NTLMSSP_TARGET_TYPE_SERVER,
        ) && target_name_field.length > 0
        {
            msg.target_name = Some(Cow::from(target_name_field.slice(remaining, offset)?));
        }

        if msg.flags
            .contains(NegotiateFlags::NTLMSSP_NEGOTIATE_TARGET_INFO) && target_info_field.length > 0
        {
            msg.target_info = Some(parse_av_pairs(target_info_field.slice(remaining, offset)?)?);
        }

        Ok(msg)
    }

    pub fn get(&self, id: AvId) -> Option<&AvPair<'a>> {
        self.target_info
            .as_ref()
            .and_then(|target_info| target_info.iter().find(|av_pair| av_pair.id == id))
    }

    /// The target name as text, honouring the negotiated character set.
    pub fn target_name(&self) -> Option<String> {
        self.target_name.as_ref().and_then(|name| {
            if self.flags
                .contains(NegotiateFlags::NTLMSSP_NEGOTIATE_UNICODE)
            {
                UTF_16LE_ENCODING.decode(name.as_ref(), DecoderTrap::Replace).ok()
            } else {
                Some(String::from_utf8_lossy(name.as_ref()).into_owned())
            }
        })
    }

    pub fn into_owned(self) -> ChallengeMessage<'static> {
        ChallengeMessage {
            flags: self.flags,
            server_challenge: self.server_challenge,
            target_name: self.target_name.map(|v| Cow::Owned(v.into_owned())),
            target_info: self.target_info
                .map(|av_pairs| av_pairs.into_iter().map(AvPair::into_owned).collect()),
            version: self.version,
        }
    }
}

const kSignature: &[u8] = b"NTLMSSP\0";
const kSignatureSize: usize = 8;
const kMesssageTypeSize: usize = 4;
const kFlagsSize: usize = 4;
const kFieldSize: usize = 8;
const kVersionSize: usize = 8;

fn write_field<B: BufMut>(buf: &mut B, value: Option<&[u8]>, offset: usize) -> usize {
    let len = value.map_or(0, |v| v.len());

    buf.put_u16::<LittleEndian>(len as u16);
    buf.put_u16::<LittleEndian>(len as u16);
    buf.put_u32::<LittleEndian>(offset as u32);

    offset + len
}

/// Parses AV pairs up to `MsvAvEOL`, ignoring any padding after it.
fn parse_av_pairs(mut payload: &[u8]) -> Result<Vec<AvPair>, Error> {
    let mut av_pairs = vec![];

    while !payload.is_empty() {
        let (remaining, av_pair) = decoded(parse_av_pair(payload))?;
        let eol = av_pair.id == AvId::EOL;

        av_pairs.push(av_pair);
        payload = remaining;

        if eol {
            break;
        }
    }

    Ok(av_pairs)
}

#[cfg_attr(rustfmt, rustfmt_skip)]
named!(
    parse_av_pair<AvPair>,
    do_parse!(
        id: map_opt!(call!(nom::le_u16), |id| AvId::from_u16(id)) >>
        len: call!(nom::le_u16) >>
        value: map!(take!(len), Cow::from) >>
        (AvPair { id, value })
    )
);

#[cfg_attr(rustfmt, rustfmt_skip)]
named!(
    parse_negotiate_message<(NegotiateMessage, Field, Field)>,
    do_parse!(
        _signature:
            add_return_error!(
                nom::ErrorKind::Custom(MismatchedSignature as u32),
                verify!(take!(8), |signature| signature == kSignature)
            ) >>
        _msg_type: add_return_error!(
                nom::ErrorKind::Custom(MismatchedMsgType as u32),
                verify!(
                    map_opt!(nom::le_u32, |v| MessageType::from_u32(v)),
                    |msg_type| msg_type == MessageType::Negotiate
                )
            ) >>
        flags: map!(nom::le_u32, NegotiateFlags::from_bits_truncate) >>
        domain_name_field: call!(parse_field) >>
        workstation_name_field: call!(parse_field) >>
        version:
            cond!(
                flags.contains(NegotiateFlags::NTLMSSP_NEGOTIATE_VERSION)
                    && has_version_block(&[&domain_name_field, &workstation_name_field]),
                opt!(complete!(call!(parse_version)))
            ) >>
        (
            NegotiateMessage {
                flags,
                domain_name: None,
                workstation_name: None,
                version: version.and_then(|version| version),
            },
            domain_name_field,
            workstation_name_field
        )
    )
);

#[cfg_attr(rustfmt, rustfmt_skip)]
named!(
    parse_challenge_message<(ChallengeMessage, Field, Field)>,
    do_parse!(
        _signature:
            add_return_error!(
                nom::ErrorKind::Custom(MismatchedSignature as u32),
                verify!(take!(8), |signature| signature == kSignature)
            ) >>
        _msg_type: add_return_error!(
                nom::ErrorKind::Custom(MismatchedMsgType as u32),
                verify!(
                    map_opt!(nom::le_u32, |v| MessageType::from_u32(v)),
                    |msg_type| msg_type == MessageType::Challenge
                )
            ) >>
        target_name_field: call!(parse_field) >>
        flags: map!(nom::le_u32, NegotiateFlags::from_bits_truncate) >>
        server_challenge: call!(nom::le_u64) >>
        _reserved: take!(8) >>
        target_info_field: call!(parse_field) >>
        version:
            cond!(
                flags.contains(NegotiateFlags::NTLMSSP_NEGOTIATE_VERSION),
                call!(parse_version)
            ) >>
        (
            ChallengeMessage {
                flags,
                server_challenge,
                target_name: None,
                target_info: None,
                version,
            },
            target_name_field,
            target_info_field
        )
    )
);

/// Some clients set `NTLMSSP_NEGOTIATE_VERSION` without sending the block;
/// the payload then starts right after the two fields.
fn has_version_block(fields: &[&Field]) -> bool {
    let header_size = kSignatureSize + kMesssageTypeSize + kFlagsSize + kFieldSize * 2;

    fields
        .iter()
        .filter(|field| field.length > 0)
        .all(|field| field.offset as usize >= header_size + kVersionSize)
}

struct Field {
    pub length: u16,
    pub offset: u32,
}

impl Field {
    /// Resolves the field against the payload that follows the fixed header.
    fn slice<'a>(&self, remaining: &'a [u8], header_size: usize) -> Result<&'a [u8], DecodeError> {
        let start = (self.offset as usize)
            .checked_sub(header_size)
            .ok_or(DecodeError::OffsetOverflow)?;
        let end = start + self.length as usize;

        if end > remaining.len() {
            return Err(DecodeError::OffsetOverflow);
        }

        Ok(&remaining[start..end])
    }
}

named!(
    parse_field<Field>,
    do_parse!(
        length: call!(nom::le_u16) >> _capacity: call!(nom::le_u16) >> offset: call!(nom::le_u32) >> (Field {
            length,
            offset,
        })
    )
);

named!(
    parse_version<Version>,
    do_parse!(
        major: call!(nom::le_u8) >> minor: call!(nom::le_u8) >> build: call!(nom::le_u16) >> _reserved: take!(3)
            >> revision: call!(nom::le_u8) >> (Version {
            major,
            minor,
            build,
            revision,
        })
    )
);
