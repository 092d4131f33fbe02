#[macro_use]
extern crate bitflags;
extern crate byteorder;
extern crate bytes;
extern crate encoding;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
#[macro_use]
extern crate nom;
extern crate num;
#[macro_use]
extern crate num_derive;

#[cfg(feature = "tls")]
extern crate native_tls;

#[cfg(feature = "serde")]
extern crate serde;
#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_derive;

#[cfg(test)]
extern crate hex;
#[cfg(test)]
#[macro_use]
extern crate matches;
#[cfg(all(test, feature = "serde"))]
extern crate serde_json;

mod errors;
mod ber;
pub mod proto;
pub mod spnego;
pub mod ldap;
pub mod config;
pub mod transport;
pub mod client;

pub use client::{AuthStatus, LdapRelayClient, ProtocolClient, RelayChallenge, SessionHandle};
pub use config::{RelayConfig, TransportMode};
pub use errors::{ConfigError, DecodeError, RelayError};
pub use ldap::{BindResult, MessageSource, ModifyOperation, ServerInfo, SicilyBind, MODIFY_ADD};
pub use transport::{Connector, LdapConnection, TcpConnector, Transport};
