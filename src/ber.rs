//! Just enough BER to carry SPNEGO tokens and LDAP messages.
//!
//! Only single byte tags are supported, which covers every element used by
//! the SICILY bind and root DSE exchanges.

use bytes::BufMut;
use nom;

use errors::ParseError::{InvalidLength, UnexpectedTag};

pub const BOOLEAN: u8 = 0x01;
pub const INTEGER: u8 = 0x02;
pub const OCTET_STRING: u8 = 0x04;
pub const OID: u8 = 0x06;
pub const ENUMERATED: u8 = 0x0a;
pub const SEQUENCE: u8 = 0x30;
pub const SET: u8 = 0x31;

/// A tag-length-value element borrowing its value from the input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

pub fn parse_length(input: &[u8]) -> nom::IResult<&[u8], usize> {
    match input.split_first() {
        None => nom::IResult::Incomplete(nom::Needed::Size(1)),
        Some((&len, remaining)) if len & 0x80 == 0 => nom::IResult::Done(remaining, len as usize),
        Some((&len, remaining)) => {
            let octets = (len & 0x7f) as usize;

            if octets == 0 || octets > 4 {
                nom::IResult::Error(error_position!(
                    nom::ErrorKind::Custom(InvalidLength as u32),
                    input
                ))
            } else if remaining.len() < octets {
                nom::IResult::Incomplete(nom::Needed::Size(1 + octets))
            } else {
                let len = remaining[..octets]
                    .iter()
                    .fold(0, |len, &b| len << 8 | b as usize);

                nom::IResult::Done(&remaining[octets..], len)
            }
        }
    }
}

#[cfg_attr(rustfmt, rustfmt_skip)]
named!(
    pub parse_tlv<Tlv>,
    do_parse!(
        tag_byte: call!(nom::le_u8) >>
        len: call!(parse_length) >>
        value: take!(len) >>
        (Tlv { tag: tag_byte, value })
    )
);

/// Parses one element and checks its tag, yielding the value bytes.
pub fn expect_tlv(input: &[u8], tag: u8) -> nom::IResult<&[u8], &[u8]> {
    match parse_tlv(input) {
        nom::IResult::Done(remaining, tlv) => {
            if tlv.tag == tag {
                nom::IResult::Done(remaining, tlv.value)
            } else {
                nom::IResult::Error(error_position!(
                    nom::ErrorKind::Custom(UnexpectedTag as u32),
                    input
                ))
            }
        }
        nom::IResult::Error(err) => nom::IResult::Error(err),
        nom::IResult::Incomplete(needed) => nom::IResult::Incomplete(needed),
    }
}

/// Decodes a two's complement INTEGER or ENUMERATED value.
pub fn integer(value: &[u8]) -> i64 {
    let init = if value.first().map_or(false, |&b| b & 0x80 != 0) {
        -1
    } else {
        0
    };

    value.iter().fold(init, |n, &b| n << 8 | b as i64)
}

pub fn write_length<B: BufMut>(buf: &mut B, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        let octets = (0..4).rev().find(|i| len >> (i * 8) != 0).unwrap_or(0) + 1;

        buf.put_u8(0x80 | octets as u8);

        for i in (0..octets).rev() {
            buf.put_u8((len >> (i * 8)) as u8);
        }
    }
}

pub fn write_tlv<B: BufMut>(buf: &mut B, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    write_length(buf, value.len());
    buf.put_slice(value);
}

/// Writes a constructed element whose content is produced by `f`.
pub fn write_constructed<B, F>(buf: &mut B, tag: u8, f: F)
where
    B: BufMut,
    F: FnOnce(&mut Vec<u8>),
{
    let mut content = vec![];

    f(&mut content);

    write_tlv(buf, tag, &content);
}

pub fn write_integer<B: BufMut>(buf: &mut B, tag: u8, n: i64) {
    let bytes = [
        (n >> 56) as u8,
        (n >> 48) as u8,
        (n >> 40) as u8,
        (n >> 32) as u8,
        (n >> 24) as u8,
        (n >> 16) as u8,
        (n >> 8) as u8,
        n as u8,
    ];

    let mut start = 0;

    while start < bytes.len() - 1
        && ((bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0))
    {
        start += 1;
    }

    write_tlv(buf, tag, &bytes[start..]);
}
