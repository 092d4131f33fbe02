//! The relay client: drives a SICILY bind with NTLM messages captured from
//! another client.

use std::str;
use std::sync::{Mutex, MutexGuard};

use failure::Error;

use config::RelayConfig;
use errors::RelayError;
use ldap::{self, BindResult, MessageSource, ModifyOperation, ServerInfo, SicilyBind};
use proto::{self, AvId, ChallengeMessage, MessageType, NegotiateFlags, NegotiateMessage};
use spnego;
use transport::{Connector, TcpConnector, Transport};

/// Package name the server must offer during discovery.
pub const NTLM_PACKAGE: &str = "NTLM";

/// Outcome of the relayed authenticate step, as an NT status.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStatus {
    Success = 0x0000_0000,
    AccessDenied = 0xC000_0022,
}

impl AuthStatus {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Reserved for an authenticated session handed back to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionHandle {
    _reserved: (),
}

/// The server challenge to send back to the client being relayed.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayChallenge {
    pub message: ChallengeMessage<'static>,
    /// The challenge exactly as the server sent it.
    pub raw: Vec<u8>,
}

impl RelayChallenge {
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// What a relay target protocol exposes to the relay server.
pub trait ProtocolClient {
    fn plugin_name(&self) -> &'static str;

    fn init_connection(&self) -> Result<(), Error>;

    fn kill_connection(&self) -> Result<(), Error>;

    /// Relays the client's negotiate message and returns the server challenge.
    fn send_negotiate(&self, negotiate_message: &[u8]) -> Result<RelayChallenge, Error>;

    /// Relays the client's authenticate message, raw or wrapped in a SPNEGO
    /// `NegTokenResp`.
    fn send_auth(
        &self,
        authenticate_message: &[u8],
        server_challenge: Option<u64>,
    ) -> Result<(Option<SessionHandle>, AuthStatus), Error>;
}

/// NTLM messages of the bind exchange currently running.
///
/// The transport pulls them while encoding the SICILY requests; the server
/// challenge is not consumed here, it goes back to the relayed client.
#[derive(Clone, Debug, Default, PartialEq)]
struct PendingMessages {
    negotiate: Vec<u8>,
    authenticate: Vec<u8>,
}

impl PendingMessages {
    fn clear(&mut self) {
        self.negotiate.clear();
        self.authenticate.clear();
    }
}

impl MessageSource for PendingMessages {
    fn create_negotiate_message(&self) -> &[u8] {
        &self.negotiate
    }

    fn create_authenticate_message(&self) -> &[u8] {
        &self.authenticate
    }

    fn parse_challenge_message(&self, message: &[u8]) {
        trace!("ignore {} bytes challenge message", message.len());
    }
}

struct Session<T> {
    transport: T,
    sasl_in_progress: bool,
    bound: bool,
    server_info: Option<ServerInfo>,
}

struct State<T> {
    session: Option<Session<T>>,
    messages: PendingMessages,
}

/// Relays NTLM authentication into an LDAP or LDAPS bind.
///
/// The session, the bind progress and the pending NTLM messages all live
/// behind one mutex, held for the whole of each relay step.
pub struct LdapRelayClient<C: Connector = TcpConnector> {
    config: RelayConfig,
    connector: C,
    state: Mutex<State<C::Transport>>,
}

impl LdapRelayClient<TcpConnector> {
    pub fn new(config: RelayConfig) -> Self {
        LdapRelayClient::with_connector(config, TcpConnector)
    }

    pub fn ldap<S: Into<String>>(host: S) -> Self {
        LdapRelayClient::new(RelayConfig::ldap(host))
    }

    pub fn ldaps<S: Into<String>>(host: S) -> Self {
        LdapRelayClient::new(RelayConfig::ldaps(host))
    }
}

impl<C: Connector> LdapRelayClient<C> {
    /// The modify verb later directory operations on this target should use.
    pub const MODIFY_ADD: ModifyOperation = ldap::MODIFY_ADD;

    pub fn with_connector(config: RelayConfig, connector: C) -> Self {
        LdapRelayClient {
            config,
            connector,
            state: Mutex::new(State {
                session: None,
                messages: PendingMessages::default(),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.inspect(|_| true).unwrap_or(false)
    }

    pub fn is_bound(&self) -> bool {
        self.inspect(|session| session.bound).unwrap_or(false)
    }

    pub fn sasl_in_progress(&self) -> bool {
        self.inspect(|session| session.sasl_in_progress)
            .unwrap_or(false)
    }

    /// Root DSE of the target, read once the relayed bind succeeded.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inspect(|session| session.server_info.clone())
            .and_then(|info| info)
    }

    fn inspect<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Session<C::Transport>) -> R,
    {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.session.as_ref().map(f))
    }

    fn lock(&self) -> Result<MutexGuard<State<C::Transport>>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::from(RelayError::LockPoisoned))
    }

    /// Ends the running exchange after a failure so the session can be used
    /// for another attempt.
    fn abort_exchange(&self) -> Result<(), Error> {
        let mut state = self.lock()?;

        state.messages.clear();

        if let Some(ref mut session) = state.session {
            session.sasl_in_progress = false;
        }

        Ok(())
    }
}

impl<C: Connector> ProtocolClient for LdapRelayClient<C> {
    fn plugin_name(&self) -> &'static str {
        self.config.mode.plugin_name()
    }

    fn init_connection(&self) -> Result<(), Error> {
        let mut state = self.lock()?;

        if let Some(mut session) = state.session.take() {
            debug!("replace the open connection to {}", self.config);

            if let Err(err) = session.transport.close() {
                debug!("fail to close connection to {}, {}", self.config, err);
            }
        }

        let transport = self.connector.open(&self.config)?;

        info!("opened {} session to {}", self.plugin_name(), self.config);

        state.messages.clear();
        state.session = Some(Session {
            transport,
            sasl_in_progress: false,
            bound: false,
            server_info: None,
        });

        Ok(())
    }

    fn kill_connection(&self) -> Result<(), Error> {
        let mut state = self.lock()?;

        state.messages.clear();

        if let Some(mut session) = state.session.take() {
            if let Err(err) = session.transport.close() {
                debug!("fail to close connection to {}, {}", self.config, err);
            }

            info!("closed {} session to {}", self.plugin_name(), self.config);
        }

        Ok(())
    }

    fn send_negotiate(&self, negotiate_message: &[u8]) -> Result<RelayChallenge, Error> {
        let mut negotiate = NegotiateMessage::parse(negotiate_message)?;

        if self.config.strip_signing
            && negotiate
                .flags
                .contains(NegotiateFlags::NTLMSSP_NEGOTIATE_SIGN)
        {
            debug!("strip NTLMSSP_NEGOTIATE_SIGN from the relayed negotiate message");

            negotiate.strip_flags(NegotiateFlags::NTLMSSP_NEGOTIATE_SIGN);
        }

        let payload = negotiate.to_vec()?;

        let mut guard = self.lock()?;
        let state = &mut *guard;

        let session = state.session.as_mut().ok_or(RelayError::NotConnected)?;

        if session.sasl_in_progress {
            return Err(RelayError::ProtocolState.into());
        }

        session.sasl_in_progress = true;
        state.messages.negotiate = payload;

        let result = negotiate_challenge(&mut session.transport, &state.messages);

        if result.is_err() {
            session.sasl_in_progress = false;
            state.messages.clear();
        }

        result
    }

    fn send_auth(
        &self,
        authenticate_message: &[u8],
        server_challenge: Option<u64>,
    ) -> Result<(Option<SessionHandle>, AuthStatus), Error> {
        let token = match spnego::unwrap_authenticate(authenticate_message) {
            Ok(token) => token,
            Err(err) => {
                self.abort_exchange()?;

                return Err(err);
            }
        };

        if let Some(server_challenge) = server_challenge {
            trace!("relay authenticate for server challenge {:016x}", server_challenge);
        }

        let mut guard = self.lock()?;
        let state = &mut *guard;

        let session = state.session.as_mut().ok_or(RelayError::NotConnected)?;

        if !session.sasl_in_progress {
            warn!("relay authenticate message without a pending negotiate");
        }

        if proto::message_type(&token) != Some(MessageType::Authenticate) {
            warn!("relay {} bytes token which is not an NTLM authenticate message", token.len());
        }

        state.messages.authenticate = token.into_owned();

        let result = session
            .transport
            .send_bind(SicilyBind::ResponseNtlm, &state.messages);

        session.sasl_in_progress = false;
        state.messages.clear();

        let result = result?;

        if !result.is_success() {
            info!(
                "relayed bind to {} denied, result code {}, {}",
                self.config, result.result_code, result.diagnostic_message
            );

            return Ok((None, AuthStatus::AccessDenied));
        }

        session.bound = true;

        info!("relayed bind to {} succeeded", self.config);

        match session.transport.refresh_server_info() {
            Ok(info) => session.server_info = Some(info),
            Err(err) => warn!("fail to refresh server info of {}, {}", self.config, err),
        }

        Ok((None, AuthStatus::Success))
    }
}

/// Runs package discovery and the NTLM negotiate request, returning the
/// server challenge.
fn negotiate_challenge<T: Transport>(transport: &mut T, messages: &PendingMessages) -> Result<RelayChallenge, Error> {
    let discovery = transport.send_bind(SicilyBind::PackageDiscovery, messages)?;

    let packages = match discovery_packages(&discovery) {
        Some(packages) => packages,
        None => return Err(RelayError::Discovery(discovery).into()),
    };

    debug!("server offers authentication packages: {}", packages.join(", "));

    if !packages.iter().any(|package| package == NTLM_PACKAGE) {
        return Err(RelayError::UnsupportedMechanism(packages).into());
    }

    let negotiate = transport.send_bind(SicilyBind::NegotiateNtlm, messages)?;

    if !negotiate.is_success() {
        return Err(RelayError::NegotiationFailed(
            negotiate.result_code,
            negotiate.diagnostic_message
        ).into());
    }

    let raw = negotiate.server_creds.unwrap_or_default();
    let message = ChallengeMessage::parse(&raw)?.into_owned();

    debug!(
        "got challenge for target {} on {}, flags {:?}",
        message.target_name().unwrap_or_default(),
        message
            .get(AvId::DnsComputerName)
            .and_then(|av_pair| av_pair.to_name())
            .unwrap_or_default(),
        message.flags
    );

    Ok(RelayChallenge { message, raw })
}

/// Splits the ASCII package list returned by a discovery bind.
fn discovery_packages(result: &BindResult) -> Option<Vec<String>> {
    result
        .server_creds
        .as_ref()
        .filter(|creds| creds.is_ascii())
        .and_then(|creds| str::from_utf8(creds).ok())
        .map(|creds| creds.split(';').map(String::from).collect())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    use super::*;
    use config::TransportMode;
    use proto::tests::{CHALLENGE_MESSAGE, NEGOTIATE_MESSAGE};

    #[derive(Default)]
    struct Script {
        fail_open: bool,
        opened: Vec<RelayConfig>,
        responses: VecDeque<BindResult>,
        sent: Vec<(SicilyBind, Vec<u8>)>,
        server_info: Option<ServerInfo>,
        closed: usize,
    }

    #[derive(Clone, Default)]
    struct MockConnector(Arc<Mutex<Script>>);

    struct MockTransport(Arc<Mutex<Script>>);

    impl Connector for MockConnector {
        type Transport = MockTransport;

        fn open(&self, config: &RelayConfig) -> Result<MockTransport, Error> {
            let mut script = self.0.lock().unwrap();

            if script.fail_open {
                return Err(RelayError::ConnectionError(config.url(), "connection refused".to_owned()).into());
            }

            script.opened.push(config.clone());

            Ok(MockTransport(self.0.clone()))
        }
    }

    impl Transport for MockTransport {
        fn send_bind(&mut self, kind: SicilyBind, source: &dyn MessageSource) -> Result<BindResult, Error> {
            let mut script = self.0.lock().unwrap();

            let payload = match kind {
                SicilyBind::PackageDiscovery => vec![],
                SicilyBind::NegotiateNtlm => source.create_negotiate_message().to_vec(),
                SicilyBind::ResponseNtlm => source.create_authenticate_message().to_vec(),
            };

            script.sent.push((kind, payload));

            match script.responses.pop_front() {
                Some(result) => Ok(result),
                None => return Err(RelayError::ConnectionError("mock".to_owned(), "connection reset".to_owned()).into()),
            }
        }

        fn refresh_server_info(&mut self) -> Result<ServerInfo, Error> {
            match self.0.lock().unwrap().server_info.clone() {
                Some(info) => Ok(info),
                None => bail!("no root DSE"),
            }
        }

        fn close(&mut self) -> Result<(), Error> {
            self.0.lock().unwrap().closed += 1;

            Ok(())
        }
    }

    fn result(result_code: u32, server_creds: Option<&[u8]>) -> BindResult {
        BindResult {
            result_code,
            diagnostic_message: String::new(),
            server_creds: server_creds.map(|creds| creds.to_vec()),
        }
    }

    fn client(config: RelayConfig, responses: Vec<BindResult>) -> (LdapRelayClient<MockConnector>, MockConnector) {
        let connector = MockConnector::default();

        {
            let mut script = connector.0.lock().unwrap();

            script.responses = responses.into_iter().collect();

            let mut info = ServerInfo::default();

            info.attributes
                .insert("dnsHostName".to_owned(), vec!["dc1.example.com".to_owned()]);

            script.server_info = Some(info);
        }

        (
            LdapRelayClient::with_connector(config, connector.clone()),
            connector,
        )
    }

    fn negotiated(config: RelayConfig, more: Vec<BindResult>) -> (LdapRelayClient<MockConnector>, MockConnector) {
        let mut responses = vec![
            result(0, Some(b"NTLM;Kerberos")),
            result(0, Some(CHALLENGE_MESSAGE)),
        ];

        responses.extend(more);

        let (client, connector) = client(config, responses);

        client.init_connection().unwrap();
        client.send_negotiate(NEGOTIATE_MESSAGE).unwrap();

        (client, connector)
    }

    fn sent_kinds(connector: &MockConnector) -> Vec<SicilyBind> {
        connector
            .0
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|&(kind, _)| kind)
            .collect()
    }

    #[test]
    fn kill_never_opened() {
        let (client, connector) = client(RelayConfig::ldap("dc1.example.com"), vec![]);

        client.kill_connection().unwrap();
        client.kill_connection().unwrap();

        assert!(!client.is_connected());
        assert_eq!(connector.0.lock().unwrap().closed, 0);
    }

    #[test]
    fn connection_lifecycle() {
        let (client, connector) = client(RelayConfig::ldap("dc1.example.com"), vec![]);

        client.init_connection().unwrap();

        assert!(client.is_connected());
        assert!(!client.is_bound());
        assert!(!client.sasl_in_progress());

        client.kill_connection().unwrap();
        client.kill_connection().unwrap();

        assert!(!client.is_connected());
        assert_eq!(connector.0.lock().unwrap().closed, 1);
    }

    #[test]
    fn connection_error() {
        let (client, connector) = client(RelayConfig::ldap("dc1.example.com"), vec![]);

        connector.0.lock().unwrap().fail_open = true;

        let err = client.init_connection().unwrap_err();

        assert_matches!(
            err.downcast_ref::<RelayError>(),
            Some(&RelayError::ConnectionError(ref target, _)) if target == "ldap://dc1.example.com:389"
        );
        assert!(!client.is_connected());
    }

    #[test]
    fn not_connected() {
        let (client, _) = client(RelayConfig::ldap("dc1.example.com"), vec![]);

        assert_matches!(
            client
                .send_negotiate(NEGOTIATE_MESSAGE)
                .unwrap_err()
                .downcast_ref::<RelayError>(),
            Some(&RelayError::NotConnected)
        );
        assert_matches!(
            client
                .send_auth(b"NTLMSSP\0\x03\x00\x00\x00", None)
                .unwrap_err()
                .downcast_ref::<RelayError>(),
            Some(&RelayError::NotConnected)
        );
    }

    #[test]
    fn plaintext_negotiate() {
        let (client, connector) = client(
            RelayConfig::ldap("dc1.example.com").with_port(389),
            vec![
                result(0, Some(b"NTLM;Kerberos")),
                result(0, Some(CHALLENGE_MESSAGE)),
            ],
        );

        assert_eq!(client.plugin_name(), "LDAP");

        client.init_connection().unwrap();

        let challenge = client.send_negotiate(NEGOTIATE_MESSAGE).unwrap();

        assert_eq!(challenge.as_bytes(), CHALLENGE_MESSAGE);
        assert_eq!(challenge.message, ChallengeMessage::parse(CHALLENGE_MESSAGE).unwrap());
        assert_eq!(challenge.message.server_challenge, 0x0807060504030201);
        assert!(client.sasl_in_progress());

        let script = connector.0.lock().unwrap();

        assert_eq!(script.opened[0].mode, TransportMode::Plaintext);
        assert_eq!(script.opened[0].port(), 389);
        assert_eq!(
            script.sent,
            vec![
                (SicilyBind::PackageDiscovery, vec![]),
                (SicilyBind::NegotiateNtlm, NEGOTIATE_MESSAGE.to_vec()),
            ]
        );
    }

    #[test]
    fn encrypted_negotiate() {
        let (client, connector) = negotiated(RelayConfig::ldaps("dc1.example.com"), vec![]);

        assert_eq!(client.plugin_name(), "LDAPS");
        assert!(client.sasl_in_progress());

        let script = connector.0.lock().unwrap();

        assert_eq!(script.opened[0].mode, TransportMode::Encrypted);
        assert_eq!(script.opened[0].port(), 636);
        assert_eq!(script.sent.len(), 2);
    }

    #[test]
    fn reentrant_negotiate() {
        let (client, connector) = negotiated(RelayConfig::ldap("dc1.example.com"), vec![]);

        assert_matches!(
            client
                .send_negotiate(NEGOTIATE_MESSAGE)
                .unwrap_err()
                .downcast_ref::<RelayError>(),
            Some(&RelayError::ProtocolState)
        );
        assert_eq!(sent_kinds(&connector).len(), 2);
        assert!(client.sasl_in_progress());
    }

    #[test]
    fn discovery_without_credentials() {
        let (client, connector) = client(RelayConfig::ldap("dc1.example.com"), vec![result(0, None)]);

        client.init_connection().unwrap();

        let err = client.send_negotiate(NEGOTIATE_MESSAGE).unwrap_err();

        assert_matches!(
            err.downcast_ref::<RelayError>(),
            Some(&RelayError::Discovery(ref response)) if *response == result(0, None)
        );
        assert_eq!(sent_kinds(&connector), vec![SicilyBind::PackageDiscovery]);
        assert!(!client.sasl_in_progress());
    }

    #[test]
    fn ntlm_not_offered() {
        let (client, connector) = client(
            RelayConfig::ldap("dc1.example.com"),
            vec![result(0, Some(b"Kerberos;Negotiate"))],
        );

        client.init_connection().unwrap();

        let err = client.send_negotiate(NEGOTIATE_MESSAGE).unwrap_err();

        assert_matches!(
            err.downcast_ref::<RelayError>(),
            Some(&RelayError::UnsupportedMechanism(ref packages))
                if *packages == vec!["Kerberos".to_owned(), "Negotiate".to_owned()]
        );
        assert_eq!(sent_kinds(&connector), vec![SicilyBind::PackageDiscovery]);
        assert!(!client.sasl_in_progress());
    }

    #[test]
    fn negotiate_rejected() {
        let (client, _) = client(
            RelayConfig::ldap("dc1.example.com"),
            vec![
                result(0, Some(b"NTLM")),
                BindResult {
                    result_code: 49,
                    diagnostic_message: "80090308: LdapErr: DSID-0C09044E".to_owned(),
                    server_creds: None,
                },
            ],
        );

        client.init_connection().unwrap();

        let err = client.send_negotiate(NEGOTIATE_MESSAGE).unwrap_err();

        assert_matches!(
            err.downcast_ref::<RelayError>(),
            Some(&RelayError::NegotiationFailed(49, _))
        );
        assert!(!client.sasl_in_progress());
    }

    #[test]
    fn invalid_negotiate_message() {
        let (client, connector) = client(RelayConfig::ldap("dc1.example.com"), vec![]);

        client.init_connection().unwrap();

        assert!(client.send_negotiate(CHALLENGE_MESSAGE).is_err());
        assert!(sent_kinds(&connector).is_empty());
        assert!(!client.sasl_in_progress());
    }

    #[test]
    fn strip_signing() {
        let mut config = RelayConfig::ldap("dc1.example.com");

        config.strip_signing = true;

        let (_, connector) = negotiated(config, vec![]);

        let script = connector.0.lock().unwrap();
        let negotiate = &script.sent[1].1;

        assert_eq!(&negotiate[12..16], &[0x05, 0x82, 0x08, 0x62]);
        assert!(!NegotiateMessage::parse(negotiate)
            .unwrap()
            .flags
            .contains(NegotiateFlags::NTLMSSP_NEGOTIATE_SIGN));
    }

    #[test]
    fn wrapped_authenticate() {
        let token = b"NTLMSSP\0\x03\x00\x00\x00relayed";
        let (client, connector) = negotiated(RelayConfig::ldap("dc1.example.com"), vec![result(0, None)]);

        let (handle, status) = client
            .send_auth(&spnego::wrap_response_token(token), Some(0x0807060504030201))
            .unwrap();

        assert_eq!(handle, None);
        assert_eq!(status, AuthStatus::Success);
        assert_eq!(status.code(), 0);
        assert!(client.is_bound());
        assert!(!client.sasl_in_progress());
        assert_eq!(
            client.server_info().unwrap().dns_host_name(),
            Some("dc1.example.com")
        );

        let script = connector.0.lock().unwrap();

        assert_eq!(script.sent[2], (SicilyBind::ResponseNtlm, token.to_vec()));
    }

    #[test]
    fn raw_authenticate() {
        let token = b"NTLMSSP\0\x03\x00\x00\x00raw";
        let (client, connector) = negotiated(RelayConfig::ldap("dc1.example.com"), vec![result(0, None)]);

        connector.0.lock().unwrap().server_info = None;

        let (_, status) = client.send_auth(token, None).unwrap();

        assert_eq!(status, AuthStatus::Success);
        assert!(client.is_bound());
        assert_eq!(client.server_info(), None);
        assert_eq!(
            connector.0.lock().unwrap().sent[2],
            (SicilyBind::ResponseNtlm, token.to_vec())
        );
    }

    #[test]
    fn access_denied() {
        let (client, _) = negotiated(RelayConfig::ldap("dc1.example.com"), vec![result(49, None)]);

        let (handle, status) = client.send_auth(b"NTLMSSP\0\x03\x00\x00\x00", None).unwrap();

        assert_eq!(handle, None);
        assert_eq!(status, AuthStatus::AccessDenied);
        assert_eq!(status.code(), 0xC000_0022);
        assert!(!client.is_bound());
        assert!(!client.sasl_in_progress());
    }

    #[test]
    fn malformed_authenticate() {
        let (client, connector) = negotiated(RelayConfig::ldap("dc1.example.com"), vec![]);

        let err = client
            .send_auth(&[0xa1, 0x05, 0x30, 0x03, 0xa2], None)
            .unwrap_err();

        assert_matches!(
            err.downcast_ref::<RelayError>(),
            Some(&RelayError::MalformedToken(_))
        );
        assert!(!client.sasl_in_progress());
        assert_eq!(sent_kinds(&connector).len(), 2);
    }

    #[test]
    fn retry_after_failure() {
        let (client, _) = negotiated(
            RelayConfig::ldap("dc1.example.com"),
            vec![
                result(49, None),
                result(0, Some(b"NTLM")),
                result(0, Some(CHALLENGE_MESSAGE)),
            ],
        );

        let (_, status) = client.send_auth(b"NTLMSSP\0\x03\x00\x00\x00", None).unwrap();

        assert_eq!(status, AuthStatus::AccessDenied);
        assert!(client.send_negotiate(NEGOTIATE_MESSAGE).is_ok());
    }

    #[test]
    fn pending_messages_cleared() {
        let (client, _) = negotiated(RelayConfig::ldap("dc1.example.com"), vec![result(0, None)]);

        assert_eq!(
            client.state.lock().unwrap().messages.negotiate,
            NEGOTIATE_MESSAGE.to_vec()
        );

        client.send_auth(b"NTLMSSP\0\x03\x00\x00\x00", None).unwrap();

        assert_eq!(
            client.state.lock().unwrap().messages,
            PendingMessages::default()
        );
    }

    #[test]
    fn parallel_sessions() {
        let handles = (0..4)
            .map(|i| {
                thread::spawn(move || {
                    let config = if i % 2 == 0 {
                        RelayConfig::ldap(format!("dc{}.example.com", i))
                    } else {
                        RelayConfig::ldaps(format!("dc{}.example.com", i))
                    };

                    let (client, _) = negotiated(config, vec![result(0, None)]);

                    client.send_auth(b"NTLMSSP\0\x03\x00\x00\x00", None).unwrap()
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), (None, AuthStatus::Success));
        }
    }

    #[test]
    fn one_exchange_per_session() {
        let (client, connector) = client(
            RelayConfig::ldap("dc1.example.com"),
            vec![
                result(0, Some(b"NTLM;Kerberos")),
                result(0, Some(CHALLENGE_MESSAGE)),
            ],
        );

        client.init_connection().unwrap();

        let client = Arc::new(client);
        let barrier = Arc::new(Barrier::new(2));

        let handles = (0..2)
            .map(|_| {
                let client = client.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    client
                        .send_negotiate(NEGOTIATE_MESSAGE)
                        .map(|_| ())
                        .map_err(|err| err.downcast_ref::<RelayError>().map(|err| err.to_string()))
                })
            })
            .collect::<Vec<_>>();

        let results = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|result| **result == Err(Some(RelayError::ProtocolState.to_string())))
                .count(),
            1
        );
        assert_eq!(sent_kinds(&connector).len(), 2);
        assert!(client.sasl_in_progress());
    }

    #[test]
    fn modify_verb() {
        assert_eq!(
            LdapRelayClient::<TcpConnector>::MODIFY_ADD,
            ModifyOperation::Add
        );
    }
}
