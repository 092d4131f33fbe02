//! SPNEGO `NegTokenResp` handling.
//!
//! Clients relayed from SMB or HTTP Negotiate wrap their NTLM authenticate
//! message in a `NegTokenResp`; the SICILY bind wants the raw NTLM bytes.

use std::borrow::Cow;

use bytes::BufMut;
use failure::Error;
use num::FromPrimitive;

use ber::{self, ENUMERATED, OCTET_STRING, OID, SEQUENCE};
use errors::{decoded, RelayError};

/// Tag byte of a `NegTokenResp`, `[1]` constructed.
pub const SPNEGO_NEG_TOKEN_RESP: u8 = 0xa1;

const NEG_STATE: u8 = 0xa0;
const SUPPORTED_MECH: u8 = 0xa1;
const RESPONSE_TOKEN: u8 = 0xa2;
const MECH_LIST_MIC: u8 = 0xa3;

/// DER encoded NTLMSSP mechanism OID, 1.3.6.1.4.1.311.2.2.10
pub const NTLMSSP_MECH_TYPE: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a];

#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub enum NegState {
    AcceptCompleted = 0,
    AcceptIncomplete = 1,
    Reject = 2,
    RequestMic = 3,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NegTokenResp<'a> {
    pub neg_state: Option<NegState>,
    pub supported_mech: Option<Cow<'a, [u8]>>,
    pub response_token: Option<Cow<'a, [u8]>>,
    pub mech_list_mic: Option<Cow<'a, [u8]>>,
}

impl<'a> NegTokenResp<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<NegTokenResp<'a>, Error> {
        let (_, body) = decoded(ber::expect_tlv(payload, SPNEGO_NEG_TOKEN_RESP))?;
        let (_, mut fields) = decoded(ber::expect_tlv(body, SEQUENCE))?;

        let mut token = NegTokenResp::default();

        while !fields.is_empty() {
            let (remaining, field) = decoded(ber::parse_tlv(fields))?;

            match field.tag {
                NEG_STATE => {
                    let (_, state) = decoded(ber::expect_tlv(field.value, ENUMERATED))?;

                    token.neg_state = NegState::from_i64(ber::integer(state));
                }
                SUPPORTED_MECH => {
                    let (_, oid) = decoded(ber::expect_tlv(field.value, OID))?;

                    token.supported_mech = Some(Cow::from(oid));
                }
                RESPONSE_TOKEN => {
                    let (_, response_token) = decoded(ber::expect_tlv(field.value, OCTET_STRING))?;

                    token.response_token = Some(Cow::from(response_token));
                }
                MECH_LIST_MIC => {
                    let (_, mic) = decoded(ber::expect_tlv(field.value, OCTET_STRING))?;

                    token.mech_list_mic = Some(Cow::from(mic));
                }
                tag => trace!("skip unknown NegTokenResp field [{}]", tag & 0x1f),
            }

            fields = remaining;
        }

        Ok(token)
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        ber::write_constructed(buf, SPNEGO_NEG_TOKEN_RESP, |body| {
            ber::write_constructed(body, SEQUENCE, |fields| {
                if let Some(state) = self.neg_state {
                    ber::write_constructed(fields, NEG_STATE, |field| {
                        ber::write_integer(field, ENUMERATED, state as i64)
                    });
                }
                if let Some(ref oid) = self.supported_mech {
                    ber::write_constructed(fields, SUPPORTED_MECH, |field| {
                        ber::write_tlv(field, OID, oid.as_ref())
                    });
                }
                if let Some(ref response_token) = self.response_token {
                    ber::write_constructed(fields, RESPONSE_TOKEN, |field| {
                        ber::write_tlv(field, OCTET_STRING, response_token.as_ref())
                    });
                }
                if let Some(ref mic) = self.mech_list_mic {
                    ber::write_constructed(fields, MECH_LIST_MIC, |field| {
                        ber::write_tlv(field, OCTET_STRING, mic.as_ref())
                    });
                }
            })
        })
    }
}

/// Returns the raw NTLM authenticate message carried by `blob`.
///
/// A blob starting with the `NegTokenResp` tag is unwrapped to its response
/// token, anything else is passed through untouched.
pub fn unwrap_authenticate(blob: &[u8]) -> Result<Cow<[u8]>, Error> {
    if blob.first() != Some(&SPNEGO_NEG_TOKEN_RESP) {
        return Ok(Cow::Borrowed(blob));
    }

    let token = NegTokenResp::parse(blob).map_err(|err| RelayError::MalformedToken(err.to_string()))?;

    match token.response_token {
        Some(response_token) => {
            debug!(
                "unwrapped {} bytes NTLM token from {} bytes NegTokenResp",
                response_token.len(),
                blob.len()
            );

            Ok(response_token)
        }
        None => return Err(RelayError::MalformedToken("NegTokenResp without responseToken".to_owned()).into()),
    }
}

/// Wraps an NTLM message as the response token of a `NegTokenResp`.
pub fn wrap_response_token(token: &[u8]) -> Vec<u8> {
    let mut buf = vec![];

    NegTokenResp {
        response_token: Some(Cow::from(token)),
        ..Default::default()
    }.write_to(&mut buf);

    buf
}
