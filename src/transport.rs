//! The session transport: an LDAPv3 connection able to carry SICILY binds.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use byteorder::{BigEndian, ReadBytesExt};
use failure::Error;

#[cfg(feature = "tls")]
use native_tls::{TlsConnector, TlsStream};

use ber;
use config::{RelayConfig, TransportMode};
use errors::{DecodeError, RelayError};
use ldap::{self, BindResult, LdapMessage, MessageSource, ServerInfo, SicilyBind, BIND_RESPONSE,
           EXTENDED_RESPONSE, SEARCH_RESULT_DONE, SEARCH_RESULT_ENTRY, SEARCH_RESULT_REFERENCE};

/// Upper bound of a single LDAP message accepted from the server.
const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

const UNBIND_REQUEST: &[u8] = &[0x42, 0x00];

/// An open directory session able to run SICILY binds.
pub trait Transport {
    /// Sends one SICILY bind request, pulling its payload from `source`, and
    /// waits for the matching bind response.
    fn send_bind(&mut self, kind: SicilyBind, source: &dyn MessageSource) -> Result<BindResult, Error>;

    /// Reads the root DSE of the server.
    fn refresh_server_info(&mut self) -> Result<ServerInfo, Error>;

    /// Closes the session; closing twice is a no-op.
    fn close(&mut self) -> Result<(), Error>;
}

/// Opens transports to the target of a relay client.
pub trait Connector {
    type Transport: Transport;

    fn open(&self, config: &RelayConfig) -> Result<Self::Transport, Error>;
}

/// Connects over TCP, wrapped in TLS for `TransportMode::Encrypted`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = LdapConnection<Stream>;

    fn open(&self, config: &RelayConfig) -> Result<Self::Transport, Error> {
        let target = config.url();

        let stream = connect(config).map_err(|err| RelayError::ConnectionError(target.clone(), err.to_string()))?;

        let conn = LdapConnection::new(target, stream);

        info!("connected to {}", conn.target());

        Ok(conn)
    }
}

fn connect(config: &RelayConfig) -> Result<Stream, Error> {
    let mut last_err = None;

    for addr in (config.host.as_str(), config.port()).to_socket_addrs()? {
        trace!("connecting to {}", addr);

        let result = match config.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };

        match result {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_read_timeout(config.io_timeout())?;
                stream.set_write_timeout(config.io_timeout())?;

                return wrap_stream(config, stream);
            }
            Err(err) => {
                debug!("fail to connect {}, {}", addr, err);

                last_err = Some(err);
            }
        }
    }

    match last_err {
        Some(err) => Err(err.into()),
        None => bail!("no address resolved for {}", config.host),
    }
}

#[cfg(feature = "tls")]
fn wrap_stream(config: &RelayConfig, stream: TcpStream) -> Result<Stream, Error> {
    match config.mode {
        TransportMode::Plaintext => Ok(Stream::Plain(stream)),
        TransportMode::Encrypted => {
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(!config.verify_certificate)
                .danger_accept_invalid_hostnames(!config.verify_certificate)
                .build()?;

            let stream = connector
                .connect(&config.host, stream)
                .map_err(|err| format_err!("TLS handshake failed, {}", err))?;

            debug!("TLS session established with {}", config.host);

            Ok(Stream::Tls(Box::new(stream)))
        }
    }
}

#[cfg(not(feature = "tls"))]
fn wrap_stream(config: &RelayConfig, stream: TcpStream) -> Result<Stream, Error> {
    match config.mode {
        TransportMode::Plaintext => Ok(Stream::Plain(stream)),
        TransportMode::Encrypted => bail!("built without the `tls` feature"),
    }
}

/// A TCP stream, optionally wrapped in TLS.
#[derive(Debug)]
pub enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Stream::Plain(ref mut stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(ref mut stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Stream::Plain(ref mut stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(ref mut stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Stream::Plain(ref mut stream) => stream.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(ref mut stream) => stream.flush(),
        }
    }
}

/// An LDAPv3 connection over any byte stream.
#[derive(Debug)]
pub struct LdapConnection<S: Read + Write> {
    target: String,
    stream: Option<S>,
    next_message_id: i64,
    last_server_creds: Option<Vec<u8>>,
}

impl<S: Read + Write> LdapConnection<S> {
    pub fn new(target: String, stream: S) -> Self {
        LdapConnection {
            target,
            stream: Some(stream),
            next_message_id: 1,
            last_server_creds: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn next_message_id(&mut self) -> i64 {
        let message_id = self.next_message_id;

        self.next_message_id = if message_id == i64::from(i32::max_value()) {
            1
        } else {
            message_id + 1
        };

        message_id
    }

    fn io_error(&self, err: io::Error) -> Error {
        RelayError::ConnectionError(self.target.clone(), err.to_string()).into()
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        let result = match self.stream {
            Some(ref mut stream) => stream.write_all(frame).and_then(|_| stream.flush()),
            None => return Err(RelayError::NotConnected.into()),
        };

        result.map_err(|err| self.io_error(err))
    }

    fn recv_frame(&mut self) -> Result<Vec<u8>, Error> {
        let result = match self.stream {
            Some(ref mut stream) => read_frame(stream),
            None => return Err(RelayError::NotConnected.into()),
        };

        match result {
            Ok(frame) => Ok(frame),
            Err(err) => match err.downcast::<io::Error>() {
                Ok(err) => Err(self.io_error(err)),
                Err(err) => Err(err),
            },
        }
    }

    /// Receives the response to `message_id`, skipping stale responses.
    fn recv_message(&mut self, message_id: i64) -> Result<LdapMessage, Error> {
        loop {
            let frame = self.recv_frame()?;
            let msg = LdapMessage::parse(&frame)?;

            if msg.message_id == message_id {
                return Ok(msg);
            }

            if msg.message_id == 0 {
                let reason = if msg.op_tag == EXTENDED_RESPONSE {
                    let notice = BindResult::parse(&msg.op)?;

                    format!(
                        "unsolicited notification, result code {}, {}",
                        notice.result_code, notice.diagnostic_message
                    )
                } else {
                    "unsolicited notification".to_owned()
                };

                warn!("{} from {}", reason, self.target);

                return Err(RelayError::ConnectionError(self.target.clone(), reason).into());
            }

            warn!(
                "skip response #{} while waiting for #{}",
                msg.message_id, message_id
            );
        }
    }
}

/// Reads one BER encoded LDAP message.
fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, Error> {
    let tag = r.read_u8()?;
    let first = r.read_u8()?;

    let mut frame = vec![tag, first];

    let length = if first & 0x80 == 0 {
        u64::from(first)
    } else {
        let n = (first & 0x7f) as usize;

        if n == 0 || n > 4 {
            return Err(DecodeError::InvalidLength.into());
        }

        let length = r.read_uint::<BigEndian>(n)?;

        frame.extend_from_slice(&ber_length_bytes(length, n));

        length
    };

    if length > MAX_MESSAGE_SIZE {
        return Err(DecodeError::InvalidLength.into());
    }

    let header = frame.len();

    frame.resize(header + length as usize, 0);

    r.read_exact(&mut frame[header..])?;

    Ok(frame)
}

fn ber_length_bytes(length: u64, n: usize) -> Vec<u8> {
    (0..n).rev().map(|i| (length >> (i * 8)) as u8).collect()
}

impl<S: Read + Write> Transport for LdapConnection<S> {
    fn send_bind(&mut self, kind: SicilyBind, source: &dyn MessageSource) -> Result<BindResult, Error> {
        if kind == SicilyBind::ResponseNtlm {
            if let Some(ref creds) = self.last_server_creds {
                source.parse_challenge_message(creds);
            }
        }

        let message_id = self.next_message_id();
        let request = ldap::bind_request(message_id, kind, source);

        debug!(
            "send {:?} bind request #{} to {}, {} bytes",
            kind,
            message_id,
            self.target,
            request.len()
        );

        self.send_frame(&request)?;

        let response = self.recv_message(message_id)?;

        if response.op_tag != BIND_RESPONSE {
            return Err(DecodeError::UnexpectedTag.into());
        }

        let result = BindResult::parse(&response.op)?;

        debug!(
            "{:?} bind response #{}: result code {}, {} bytes credentials",
            kind,
            message_id,
            result.result_code,
            result.server_creds.as_ref().map_or(0, |creds| creds.len())
        );

        self.last_server_creds = result.server_creds.clone();

        Ok(result)
    }

    fn refresh_server_info(&mut self) -> Result<ServerInfo, Error> {
        let message_id = self.next_message_id();

        self.send_frame(&ldap::root_dse_request(message_id))?;

        let mut info = ServerInfo::default();

        loop {
            let msg = self.recv_message(message_id)?;

            match msg.op_tag {
                SEARCH_RESULT_ENTRY => info.add_entry(&msg.op)?,
                SEARCH_RESULT_REFERENCE => trace!("skip search result reference"),
                SEARCH_RESULT_DONE => {
                    let result = BindResult::parse(&msg.op)?;

                    if !result.is_success() {
                        bail!(
                            "root DSE search failed with result code {}, {}",
                            result.result_code,
                            result.diagnostic_message
                        );
                    }

                    debug!(
                        "read {} root DSE attributes from {}",
                        info.attributes.len(),
                        self.target
                    );

                    return Ok(info);
                }
                _ => return Err(DecodeError::UnexpectedTag.into()),
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        if let Some(mut stream) = self.stream.take() {
            let message_id = self.next_message_id();
            let mut request = vec![];

            ber::write_constructed(&mut request, ber::SEQUENCE, |msg| {
                ber::write_integer(msg, ber::INTEGER, message_id);
                msg.extend_from_slice(UNBIND_REQUEST);
            });

            if let Err(err) = stream.write_all(&request).and_then(|_| stream.flush()) {
                debug!("fail to send unbind request to {}, {}", self.target, err);
            }

            debug!("closed connection to {}", self.target);
        }

        Ok(())
    }
}
