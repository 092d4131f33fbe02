//! The slice of LDAPv3 the relay speaks: SICILY bind requests, bind
//! responses and the root DSE search run once a relayed bind succeeds.

use std::collections::BTreeMap;

use failure::Error;
use num::FromPrimitive;

use ber::{self, BOOLEAN, ENUMERATED, INTEGER, OCTET_STRING, SEQUENCE, SET};
use errors::decoded;

pub const LDAP_VERSION: i64 = 3;

pub const BIND_REQUEST: u8 = 0x60;
pub const BIND_RESPONSE: u8 = 0x61;
pub const SEARCH_REQUEST: u8 = 0x63;
pub const SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const SEARCH_RESULT_DONE: u8 = 0x65;
pub const SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const EXTENDED_RESPONSE: u8 = 0x78;

const SERVER_SASL_CREDS: u8 = 0x87;
const FILTER_PRESENT: u8 = 0x87;

/// Root DSE attributes fetched after a successful bind.
pub const ROOT_DSE_ATTRIBUTES: &[&str] = &[
    "namingContexts",
    "defaultNamingContext",
    "rootDomainNamingContext",
    "configurationNamingContext",
    "schemaNamingContext",
    "dnsHostName",
    "serverName",
    "supportedLDAPVersion",
    "supportedSASLMechanisms",
    "supportedCapabilities",
    "supportedControl",
    "domainFunctionality",
    "forestFunctionality",
    "domainControllerFunctionality",
];

/// What the SICILY bind requests pull their payload from.
///
/// The negotiate and response requests ask for the current message when they
/// are encoded; the challenge seen in between is offered back through
/// `parse_challenge_message`.
pub trait MessageSource {
    fn create_negotiate_message(&self) -> &[u8];

    fn create_authenticate_message(&self) -> &[u8];

    fn parse_challenge_message(&self, message: &[u8]);
}

/// The three requests of the SICILY bind extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SicilyBind {
    PackageDiscovery,
    NegotiateNtlm,
    ResponseNtlm,
}

impl SicilyBind {
    /// Context tag of the authentication choice, `[9]`, `[10]` or `[11]`.
    pub fn tag(self) -> u8 {
        match self {
            SicilyBind::PackageDiscovery => 0x89,
            SicilyBind::NegotiateNtlm => 0x8a,
            SicilyBind::ResponseNtlm => 0x8b,
        }
    }

    /// The bind name; only the negotiate request names its package.
    pub fn name(self) -> &'static str {
        match self {
            SicilyBind::NegotiateNtlm => "NTLM",
            _ => "",
        }
    }
}

/// LDAP result codes, RFC 4511 section 4.1.9.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    AuthMethodNotSupported = 7,
    StrongerAuthRequired = 8,
    Referral = 10,
    AdminLimitExceeded = 11,
    UnavailableCriticalExtension = 12,
    ConfidentialityRequired = 13,
    SaslBindInProgress = 14,
    NoSuchObject = 32,
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    Other = 80,
}

/// Decoded `LDAPResult` of a bind response.
#[derive(Clone, Debug, PartialEq)]
pub struct BindResult {
    pub result_code: u32,
    pub diagnostic_message: String,
    /// Payload returned by the server: the matched DN for SICILY binds, which
    /// carry it there, falling back to `serverSaslCreds`.
    pub server_creds: Option<Vec<u8>>,
}

impl BindResult {
    /// Parses the components of an `LDAPResult`, which also start search done
    /// and extended responses.
    pub fn parse(op: &[u8]) -> Result<BindResult, Error> {
        let (op, result_code) = decoded(ber::expect_tlv(op, ENUMERATED))?;
        let (op, matched_dn) = decoded(ber::expect_tlv(op, OCTET_STRING))?;
        let (mut op, diagnostic_message) = decoded(ber::expect_tlv(op, OCTET_STRING))?;

        let mut server_sasl_creds = None;

        while !op.is_empty() {
            let (remaining, tlv) = decoded(ber::parse_tlv(op))?;

            if tlv.tag == SERVER_SASL_CREDS {
                server_sasl_creds = Some(tlv.value);
            }

            op = remaining;
        }

        let server_creds = if !matched_dn.is_empty() {
            Some(matched_dn.to_vec())
        } else {
            server_sasl_creds.map(|creds| creds.to_vec())
        };

        Ok(BindResult {
            result_code: ber::integer(result_code) as u32,
            diagnostic_message: String::from_utf8_lossy(diagnostic_message).into_owned(),
            server_creds,
        })
    }

    pub fn code(&self) -> Option<ResultCode> {
        ResultCode::from_u32(self.result_code)
    }

    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success as u32
    }
}

/// One LDAP message, with the protocol operation left encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct LdapMessage {
    pub message_id: i64,
    pub op_tag: u8,
    pub op: Vec<u8>,
}

impl LdapMessage {
    pub fn parse(frame: &[u8]) -> Result<LdapMessage, Error> {
        let (_, body) = decoded(ber::expect_tlv(frame, SEQUENCE))?;
        let (body, message_id) = decoded(ber::expect_tlv(body, INTEGER))?;
        let (_controls, op) = decoded(ber::parse_tlv(body))?;

        Ok(LdapMessage {
            message_id: ber::integer(message_id),
            op_tag: op.tag,
            op: op.value.to_vec(),
        })
    }
}

fn encode_message<F>(message_id: i64, f: F) -> Vec<u8>
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut buf = vec![];

    ber::write_constructed(&mut buf, SEQUENCE, |msg| {
        ber::write_integer(msg, INTEGER, message_id);
        f(msg)
    });

    buf
}

/// Encodes a SICILY `BindRequest`, pulling its payload from `source`.
pub fn bind_request(message_id: i64, kind: SicilyBind, source: &dyn MessageSource) -> Vec<u8> {
    let payload = match kind {
        SicilyBind::PackageDiscovery => &[][..],
        SicilyBind::NegotiateNtlm => source.create_negotiate_message(),
        SicilyBind::ResponseNtlm => source.create_authenticate_message(),
    };

    encode_message(message_id, |msg| {
        ber::write_constructed(msg, BIND_REQUEST, |op| {
            ber::write_integer(op, INTEGER, LDAP_VERSION);
            ber::write_tlv(op, OCTET_STRING, kind.name().as_bytes());
            ber::write_tlv(op, kind.tag(), payload);
        })
    })
}

/// Encodes a base object search of the root DSE for `(objectClass=*)`.
pub fn root_dse_request(message_id: i64) -> Vec<u8> {
    encode_message(message_id, |msg| {
        ber::write_constructed(msg, SEARCH_REQUEST, |op| {
            ber::write_tlv(op, OCTET_STRING, b"");
            ber::write_integer(op, ENUMERATED, 0); // baseObject
            ber::write_integer(op, ENUMERATED, 0); // neverDerefAliases
            ber::write_integer(op, INTEGER, 0);
            ber::write_integer(op, INTEGER, 0);
            ber::write_tlv(op, BOOLEAN, &[0x00]);
            ber::write_tlv(op, FILTER_PRESENT, b"objectClass");
            ber::write_constructed(op, SEQUENCE, |attrs| {
                for attr in ROOT_DSE_ATTRIBUTES {
                    ber::write_tlv(attrs, OCTET_STRING, attr.as_bytes());
                }
            });
        })
    })
}

/// Root DSE attributes of the target server.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServerInfo {
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl ServerInfo {
    /// Merges the attributes of a `SearchResultEntry`.
    pub fn add_entry(&mut self, op: &[u8]) -> Result<(), Error> {
        let (op, _object_name) = decoded(ber::expect_tlv(op, OCTET_STRING))?;
        let (_, mut attributes) = decoded(ber::expect_tlv(op, SEQUENCE))?;

        while !attributes.is_empty() {
            let (remaining, attribute) = decoded(ber::expect_tlv(attributes, SEQUENCE))?;
            let (attribute, name) = decoded(ber::expect_tlv(attribute, OCTET_STRING))?;
            let (_, mut vals) = decoded(ber::expect_tlv(attribute, SET))?;

            let values = self.attributes
                .entry(String::from_utf8_lossy(name).into_owned())
                .or_insert_with(Vec::new);

            while !vals.is_empty() {
                let (remaining, value) = decoded(ber::expect_tlv(vals, OCTET_STRING))?;

                values.push(String::from_utf8_lossy(value).into_owned());
                vals = remaining;
            }

            attributes = remaining;
        }

        Ok(())
    }

    /// Values of an attribute, matching its name case-insensitively.
    pub fn get(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|&(key, _)| key.eq_ignore_ascii_case(name))
            .map_or(&[][..], |(_, values)| values.as_slice())
    }

    pub fn naming_contexts(&self) -> &[String] {
        self.get("namingContexts")
    }

    pub fn default_naming_context(&self) -> Option<&str> {
        self.get("defaultNamingContext").first().map(|s| s.as_str())
    }

    pub fn dns_host_name(&self) -> Option<&str> {
        self.get("dnsHostName").first().map(|s| s.as_str())
    }

    pub fn supported_sasl_mechanisms(&self) -> &[String] {
        self.get("supportedSASLMechanisms")
    }
}

/// Attribute modification verbs of a `ModifyRequest`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

pub const MODIFY_ADD: ModifyOperation = ModifyOperation::Add;

#[cfg(test)]
pub mod tests {
    use super::*;

    pub struct Messages {
        pub negotiate: Vec<u8>,
        pub authenticate: Vec<u8>,
    }

    impl MessageSource for Messages {
        fn create_negotiate_message(&self) -> &[u8] {
            &self.negotiate
        }

        fn create_authenticate_message(&self) -> &[u8] {
            &self.authenticate
        }

        fn parse_challenge_message(&self, _message: &[u8]) {}
    }

    /// Encodes a bind response as a server would send it.
    pub fn bind_response(message_id: i64, result_code: i64, matched_dn: &[u8], diagnostic: &str) -> Vec<u8> {
        encode_message(message_id, |msg| {
            ber::write_constructed(msg, BIND_RESPONSE, |op| {
                ber::write_integer(op, ENUMERATED, result_code);
                ber::write_tlv(op, OCTET_STRING, matched_dn);
                ber::write_tlv(op, OCTET_STRING, diagnostic.as_bytes());
            })
        })
    }

    pub fn search_entry(message_id: i64, attributes: &[(&str, &[&str])]) -> Vec<u8> {
        encode_message(message_id, |msg| {
            ber::write_constructed(msg, SEARCH_RESULT_ENTRY, |op| {
                ber::write_tlv(op, OCTET_STRING, b"");
                ber::write_constructed(op, SEQUENCE, |attrs| {
                    for &(name, values) in attributes {
                        ber::write_constructed(attrs, SEQUENCE, |attr| {
                            ber::write_tlv(attr, OCTET_STRING, name.as_bytes());
                            ber::write_constructed(attr, SET, |vals| {
                                for value in values {
                                    ber::write_tlv(vals, OCTET_STRING, value.as_bytes());
                                }
                            });
                        });
                    }
                });
            })
        })
    }

    pub fn search_done(message_id: i64, result_code: i64) -> Vec<u8> {
        encode_message(message_id, |msg| {
            ber::write_constructed(msg, SEARCH_RESULT_DONE, |op| {
                ber::write_integer(op, ENUMERATED, result_code);
                ber::write_tlv(op, OCTET_STRING, b"");
                ber::write_tlv(op, OCTET_STRING, b"");
            })
        })
    }

    #[test]
    fn package_discovery_request() {
        let source = Messages {
            negotiate: vec![],
            authenticate: vec![],
        };

        #[cfg_attr(rustfmt, rustfmt_skip)]
        let expected: &[u8] = &[
            0x30, 0x0c,
            // messageID
            0x02, 0x01, 0x01,
            // BindRequest
            0x60, 0x07,
                0x02, 0x01, 0x03,   // version
                0x04, 0x00,         // name
                0x89, 0x00,         // sicilyPackageDiscovery
        ];

        assert_eq!(bind_request(1, SicilyBind::PackageDiscovery, &source).as_slice(), expected);
    }

    #[test]
    fn negotiate_and_response_requests() {
        let source = Messages {
            negotiate: b"NEGO".to_vec(),
            authenticate: b"AUTH!".to_vec(),
        };

        #[cfg_attr(rustfmt, rustfmt_skip)]
        let negotiate: &[u8] = &[
            0x30, 0x14,
            0x02, 0x01, 0x02,
            0x60, 0x0f,
                0x02, 0x01, 0x03,
                0x04, 0x04, b'N', b'T', b'L', b'M',
                0x8a, 0x04, b'N', b'E', b'G', b'O',
        ];

        #[cfg_attr(rustfmt, rustfmt_skip)]
        let response: &[u8] = &[
            0x30, 0x11,
            0x02, 0x01, 0x03,
            0x60, 0x0c,
                0x02, 0x01, 0x03,
                0x04, 0x00,
                0x8b, 0x05, b'A', b'U', b'T', b'H', b'!',
        ];

        assert_eq!(bind_request(2, SicilyBind::NegotiateNtlm, &source).as_slice(), negotiate);
        assert_eq!(bind_request(3, SicilyBind::ResponseNtlm, &source).as_slice(), response);
    }

    #[test]
    fn bind_response_in_matched_dn() {
        let frame = bind_response(1, 0, b"NTLM;Kerberos", "");
        let msg = LdapMessage::parse(&frame).unwrap();

        assert_eq!(msg.message_id, 1);
        assert_eq!(msg.op_tag, BIND_RESPONSE);

        let result = BindResult::parse(&msg.op).unwrap();

        assert!(result.is_success());
        assert_eq!(result.code(), Some(ResultCode::Success));
        assert_eq!(result.server_creds, Some(b"NTLM;Kerberos".to_vec()));
    }

    #[test]
    fn bind_response_with_sasl_creds() {
        #[cfg_attr(rustfmt, rustfmt_skip)]
        let op: &[u8] = &[
            0x0a, 0x01, 0x31,       // invalidCredentials
            0x04, 0x00,
            0x04, 0x04, b'n', b'o', b'p', b'e',
            0x87, 0x02, 0xde, 0xad, // serverSaslCreds
        ];

        let result = BindResult::parse(op).unwrap();

        assert!(!result.is_success());
        assert_eq!(result.code(), Some(ResultCode::InvalidCredentials));
        assert_eq!(result.diagnostic_message, "nope");
        assert_eq!(result.server_creds, Some(vec![0xde, 0xad]));

        let result = BindResult::parse(&op[..11]).unwrap();

        assert_eq!(result.server_creds, None);
    }

    #[test]
    fn root_dse_search() {
        let request = root_dse_request(4);
        let msg = LdapMessage::parse(&request).unwrap();

        assert_eq!(msg.op_tag, SEARCH_REQUEST);
        assert!(request
            .windows(13)
            .any(|w| w == &b"\x87\x0bobjectClass"[..]));

        let mut info = ServerInfo::default();
        let entry = search_entry(
            4,
            &[
                ("namingContexts", &["DC=example,DC=com", "CN=Configuration,DC=example,DC=com"][..]),
                ("defaultNamingContext", &["DC=example,DC=com"][..]),
                ("dnsHostName", &["dc1.example.com"][..]),
            ],
        );

        info.add_entry(&LdapMessage::parse(&entry).unwrap().op).unwrap();

        assert_eq!(info.naming_contexts().len(), 2);
        assert_eq!(info.default_naming_context(), Some("DC=example,DC=com"));
        assert_eq!(info.dns_host_name(), Some("dc1.example.com"));
        assert_eq!(info.get("DNSHOSTNAME"), &["dc1.example.com".to_owned()][..]);
        assert!(info.supported_sasl_mechanisms().is_empty());
    }

    #[test]
    fn modify_add_verb() {
        assert_eq!(MODIFY_ADD, ModifyOperation::Add);
        assert_eq!(MODIFY_ADD as u8, 0);
    }
}
