//! TLS session layer
//!
//! A record-level state machine (handshake → verify → open → closing →
//! closed) driven by repeated non-blocking fill/flush/process cycles over
//! a [`ByteChannel`]. The cryptography itself belongs to rustls; this
//! module only drives the engine so that it cooperates with a worker's
//! event loop without ever blocking it. Peer-identity verification is
//! offloaded to the task executor and the engine is left untouched while
//! that work is outstanding.
//!
//! A handshake that fails because the peer's chain is not trusted
//! surfaces as `TransportError::UntrustedCertificate` carrying the full
//! chain, so callers can implement manual trust-on-first-use flows.

use crate::error::{Result, TransportError};
use crate::network::channel::{ByteChannel, IoStatus};
use crate::runtime::TaskExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    ServerConfig, ServerConnection, SignatureScheme,
};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tracing::{debug, info, warn};

/// Upper bound on engine-driving iterations per `process()` call, so one
/// step can never monopolize the worker thread.
const MAX_ENGINE_STEPS: usize = 64;

/// How the peer's certificate chain is evaluated after the record-layer
/// handshake completes.
#[derive(Debug, Clone)]
pub enum TrustPolicy {
    /// Validate against the platform certificate store.
    SystemRoots,
    /// Accept only an exact end-entity certificate from this set
    /// (trust-on-first-use style pinning).
    Pinned(Vec<CertificateDer<'static>>),
    /// Accept any chain. Only sensible for tests and loopback.
    AcceptAny,
}

/// TLS configuration resolved once at session construction.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub verify_hostname: bool,
    pub trust_policy: TrustPolicy,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_hostname: true,
            trust_policy: TrustPolicy::SystemRoots,
        }
    }
}

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Handshake,
    Verify,
    Open,
    Closing,
    Closed,
}

/// Result of one `process()` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// The session is open for reads and writes.
    Ready,
    /// No progress possible right now; call again after yielding.
    NotReady,
    /// The session has reached its terminal state.
    Closed,
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Record-layer verifier that accepts any chain but captures it, so the
/// actual trust decision can run off-thread in the VERIFY state.
#[derive(Debug)]
struct CapturingVerifier {
    provider: Arc<CryptoProvider>,
    captured: Arc<Mutex<Vec<CertificateDer<'static>>>>,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone().into_owned());
        chain.extend(intermediates.iter().map(|cert| cert.clone().into_owned()));
        *self.captured.lock().expect("captured chain poisoned") = chain;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Trust evaluation run on the task executor, never on a worker thread.
fn evaluate_trust(
    chain: Vec<CertificateDer<'static>>,
    server_name: ServerName<'static>,
    options: &TlsOptions,
) -> Result<()> {
    match &options.trust_policy {
        TrustPolicy::AcceptAny => Ok(()),
        TrustPolicy::Pinned(pinned) => {
            if pinned.iter().any(|pin| pin == &chain[0]) {
                Ok(())
            } else {
                Err(TransportError::UntrustedCertificate { chain })
            }
        }
        TrustPolicy::SystemRoots => {
            let mut roots = RootCertStore::empty();
            let loaded = rustls_native_certs::load_native_certs();
            for error in loaded.errors {
                warn!("Certificate loading error: {}", error);
            }
            for cert in loaded.certs {
                if let Err(e) = roots.add(cert) {
                    debug!("Skipping unusable root certificate: {:?}", e);
                }
            }
            if roots.is_empty() {
                return Err(TransportError::Tls(
                    "no usable system trust roots".to_string(),
                ));
            }

            let verifier = WebPkiServerVerifier::builder_with_provider(
                Arc::new(roots),
                crypto_provider(),
            )
            .build()
            .map_err(|e| TransportError::Tls(format!("Failed to build verifier: {e}")))?;

            let (end_entity, intermediates) = chain
                .split_first()
                .ok_or_else(|| TransportError::Tls("empty certificate chain".to_string()))?;

            match verifier.verify_server_cert(
                end_entity,
                intermediates,
                &server_name,
                &[],
                UnixTime::now(),
            ) {
                Ok(_) => Ok(()),
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::NotValidForName
                    | CertificateError::NotValidForNameContext { .. },
                )) if !options.verify_hostname => Ok(()),
                Err(rustls::Error::InvalidCertificate(_)) => {
                    Err(TransportError::UntrustedCertificate { chain })
                }
                Err(e) => Err(TransportError::Tls(format!("Verification failed: {e}"))),
            }
        }
    }
}

/// Build a server-side TLS config from a certificate chain and key.
///
/// # Errors
/// `TransportError::Tls` when the key is rejected or the protocol
/// versions cannot be configured.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(format!("Unsupported protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| TransportError::Tls(format!("Invalid server certificate/key: {e}")))?;
    Ok(Arc::new(config))
}

enum Fill {
    Progress,
    WouldBlock,
    PeerClosed,
}

enum Flush {
    Done,
    Partial,
    ChannelClosed,
}

struct ChannelReader<'a, C: ByteChannel> {
    channel: &'a mut C,
}

impl<C: ByteChannel> Read for ChannelReader<'_, C> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.channel.try_read(buf) {
            Ok(IoStatus::Ready(n)) => Ok(n),
            Ok(IoStatus::WouldBlock) => Err(std::io::ErrorKind::WouldBlock.into()),
            Ok(IoStatus::Closed) => Ok(0),
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
        }
    }
}

/// One TLS session over a non-blocking byte channel.
///
/// Implements [`ByteChannel`] itself: reads and writes carry decrypted
/// application bytes, so a bundle channel can be stacked directly on top.
pub struct TlsSession<C: ByteChannel> {
    channel: C,
    conn: rustls::Connection,
    state: TlsState,
    is_client: bool,
    options: TlsOptions,
    server_name: Option<ServerName<'static>>,
    captured: Arc<Mutex<Vec<CertificateDer<'static>>>>,
    /// Outstanding offloaded work; the engine is single-threaded while
    /// any such task runs.
    pending_tasks: Arc<AtomicUsize>,
    verify_result: Option<mpsc::Receiver<Result<()>>>,
    close_requested: bool,
    close_notify_sent: bool,
    /// Ciphertext waiting to be flushed to the channel.
    encrypted_out: Vec<u8>,
    out_pos: usize,
}

impl<C: ByteChannel> TlsSession<C> {
    /// Promote a raw channel to a client-side TLS session.
    ///
    /// # Errors
    /// `TransportError::Tls` for an invalid hostname or an engine
    /// construction failure.
    pub fn client(channel: C, host: &str, options: TlsOptions) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("Invalid hostname for TLS: {e}")))?;

        let captured = Arc::new(Mutex::new(Vec::new()));
        let provider = crypto_provider();
        let verifier = Arc::new(CapturingVerifier {
            provider: provider.clone(),
            captured: captured.clone(),
        });

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(format!("Unsupported protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        let conn = ClientConnection::new(Arc::new(config), server_name.clone())
            .map_err(|e| TransportError::Tls(format!("Failed to create TLS client: {e}")))?;

        debug!("TLS client session created for {}", host);
        Ok(Self {
            channel,
            conn: conn.into(),
            state: TlsState::Handshake,
            is_client: true,
            options,
            server_name: Some(server_name),
            captured,
            pending_tasks: Arc::new(AtomicUsize::new(0)),
            verify_result: None,
            close_requested: false,
            close_notify_sent: false,
            encrypted_out: Vec::new(),
            out_pos: 0,
        })
    }

    /// Promote a raw channel to a server-side TLS session. The server
    /// side has no VERIFY state; handshake completion opens the session.
    pub fn server(channel: C, config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| TransportError::Tls(format!("Failed to create TLS server: {e}")))?;

        Ok(Self {
            channel,
            conn: conn.into(),
            state: TlsState::Handshake,
            is_client: false,
            options: TlsOptions {
                verify_hostname: false,
                trust_policy: TrustPolicy::AcceptAny,
            },
            server_name: None,
            captured: Arc::new(Mutex::new(Vec::new())),
            pending_tasks: Arc::new(AtomicUsize::new(0)),
            verify_result: None,
            close_requested: false,
            close_notify_sent: false,
            encrypted_out: Vec::new(),
            out_pos: 0,
        })
    }

    pub fn state(&self) -> TlsState {
        self.state
    }

    /// The peer's certificate chain as captured during the handshake.
    pub fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        self.captured.lock().expect("captured chain poisoned").clone()
    }

    /// Ask for an orderly shutdown; takes effect on subsequent
    /// `process()` calls.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Single re-entrant step function. Safe to call repeatedly from the
    /// owning worker thread.
    ///
    /// # Errors
    /// Handshake and verification failures; the session is `Closed`
    /// afterwards. `UntrustedCertificate` carries the peer chain.
    pub fn process(&mut self) -> Result<TlsStatus> {
        if self.state == TlsState::Closed {
            return Ok(TlsStatus::Closed);
        }

        // The engine must not be touched while offloaded work runs
        if self.pending_tasks.load(Ordering::Acquire) > 0 {
            return Ok(TlsStatus::NotReady);
        }

        // Pending ciphertext is flushed to completion before any new step
        match self.flush_encrypted()? {
            Flush::ChannelClosed => return Ok(TlsStatus::Closed),
            Flush::Partial => return Ok(TlsStatus::NotReady),
            Flush::Done => {}
        }

        if self.close_requested && self.state != TlsState::Closing {
            self.begin_close()?;
            return Ok(match self.state {
                TlsState::Closed => TlsStatus::Closed,
                _ => TlsStatus::NotReady,
            });
        }

        match self.state {
            TlsState::Handshake => {
                self.drive_handshake()?;
                if self.state == TlsState::Handshake && !self.conn.is_handshaking() {
                    if self.is_client {
                        self.state = TlsState::Verify;
                        debug!("TLS handshake complete, verifying peer identity");
                        self.start_verification()?;
                    } else {
                        self.state = TlsState::Open;
                        info!("TLS server session open");
                    }
                }
                Ok(match self.state {
                    TlsState::Open => TlsStatus::Ready,
                    TlsState::Closed => TlsStatus::Closed,
                    _ => TlsStatus::NotReady,
                })
            }
            TlsState::Verify => self.poll_verification(),
            TlsState::Open => Ok(TlsStatus::Ready),
            TlsState::Closing => {
                self.drive_close()?;
                Ok(match self.state {
                    TlsState::Closed => TlsStatus::Closed,
                    _ => TlsStatus::NotReady,
                })
            }
            TlsState::Closed => Ok(TlsStatus::Closed),
        }
    }

    fn drive_handshake(&mut self) -> Result<()> {
        for _ in 0..MAX_ENGINE_STEPS {
            if self.conn.wants_write() {
                self.pump_ciphertext_out()?;
                if self.state == TlsState::Closed || !self.encrypted_out.is_empty() {
                    return Ok(());
                }
                continue;
            }
            if !self.conn.is_handshaking() {
                return Ok(());
            }
            match self.fill_ciphertext()? {
                Fill::WouldBlock => return Ok(()),
                Fill::PeerClosed => {
                    self.state = TlsState::Closed;
                    return Err(TransportError::Tls(
                        "peer closed the channel during the TLS handshake".to_string(),
                    ));
                }
                Fill::Progress => {
                    if let Err(e) = self.conn.process_new_packets() {
                        // Best effort: let the alert reach the peer
                        let _ = self.pump_ciphertext_out();
                        self.state = TlsState::Closed;
                        return Err(TransportError::Tls(format!("TLS handshake failed: {e}")));
                    }
                }
            }
        }
        Ok(())
    }

    /// Offload the trust decision exactly once on entry to VERIFY.
    fn start_verification(&mut self) -> Result<()> {
        let chain = self.peer_certificates();
        if chain.is_empty() {
            self.state = TlsState::Closed;
            return Err(TransportError::Tls(
                "peer presented no certificate chain".to_string(),
            ));
        }
        let server_name = match self.server_name.clone() {
            Some(name) => name,
            None => {
                self.state = TlsState::Closed;
                return Err(TransportError::Internal(
                    "client session without server name".to_string(),
                ));
            }
        };

        let (tx, rx) = mpsc::channel();
        self.verify_result = Some(rx);
        let options = self.options.clone();
        let pending = self.pending_tasks.clone();
        pending.fetch_add(1, Ordering::AcqRel);

        let spawned = TaskExecutor::run_task("tls-verify", move || {
            let outcome = evaluate_trust(chain, server_name, &options);
            let _ = tx.send(outcome);
            pending.fetch_sub(1, Ordering::AcqRel);
        });
        if let Err(e) = spawned {
            self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
            self.verify_result = None;
            self.state = TlsState::Closed;
            return Err(e);
        }
        Ok(())
    }

    fn poll_verification(&mut self) -> Result<TlsStatus> {
        let Some(rx) = self.verify_result.as_ref() else {
            self.state = TlsState::Closed;
            return Err(TransportError::Internal(
                "verify state without pending verification".to_string(),
            ));
        };
        match rx.try_recv() {
            Ok(Ok(())) => {
                self.verify_result = None;
                self.state = TlsState::Open;
                info!("TLS session open (peer verified)");
                Ok(TlsStatus::Ready)
            }
            Ok(Err(e)) => {
                self.verify_result = None;
                self.state = TlsState::Closed;
                warn!("TLS peer verification failed: {}", e);
                Err(e)
            }
            Err(mpsc::TryRecvError::Empty) => Ok(TlsStatus::NotReady),
            Err(mpsc::TryRecvError::Disconnected) => {
                self.state = TlsState::Closed;
                Err(TransportError::Internal(
                    "verification task disappeared".to_string(),
                ))
            }
        }
    }

    fn begin_close(&mut self) -> Result<()> {
        if !self.close_notify_sent {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }
        self.state = TlsState::Closing;
        self.drive_close()
    }

    fn drive_close(&mut self) -> Result<()> {
        self.pump_ciphertext_out()?;
        if self.state == TlsState::Closed {
            return Ok(());
        }
        if !self.conn.wants_write() && self.encrypted_out.is_empty() {
            self.state = TlsState::Closed;
            self.channel.close();
            info!("TLS session closed");
        }
        Ok(())
    }

    /// Move ciphertext out of the engine and flush it to the channel.
    fn pump_ciphertext_out(&mut self) -> Result<()> {
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut self.encrypted_out)
                .map_err(|e| TransportError::Tls(format!("Failed to extract ciphertext: {e}")))?;
        }
        match self.flush_encrypted()? {
            Flush::ChannelClosed | Flush::Partial | Flush::Done => Ok(()),
        }
    }

    fn flush_encrypted(&mut self) -> Result<Flush> {
        while self.out_pos < self.encrypted_out.len() {
            match self.channel.try_write(&self.encrypted_out[self.out_pos..])? {
                IoStatus::Ready(n) => self.out_pos += n,
                IoStatus::WouldBlock => return Ok(Flush::Partial),
                IoStatus::Closed => {
                    debug!("Peer channel closed with ciphertext pending");
                    self.state = TlsState::Closed;
                    return Ok(Flush::ChannelClosed);
                }
            }
        }
        self.encrypted_out.clear();
        self.out_pos = 0;
        Ok(Flush::Done)
    }

    /// Pull ciphertext from the channel into the engine.
    fn fill_ciphertext(&mut self) -> Result<Fill> {
        let mut reader = ChannelReader {
            channel: &mut self.channel,
        };
        match self.conn.read_tls(&mut reader) {
            Ok(0) => Ok(Fill::PeerClosed),
            Ok(_) => Ok(Fill::Progress),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl<C: ByteChannel> ByteChannel for TlsSession<C> {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<IoStatus> {
        match self.process()? {
            TlsStatus::Ready => {}
            TlsStatus::NotReady => return Ok(IoStatus::WouldBlock),
            TlsStatus::Closed => return Ok(IoStatus::Closed),
        }

        // Pull in whatever ciphertext is available before decrypting
        let mut peer_gone = false;
        for _ in 0..MAX_ENGINE_STEPS {
            match self.fill_ciphertext()? {
                Fill::WouldBlock => break,
                Fill::PeerClosed => {
                    peer_gone = true;
                    break;
                }
                Fill::Progress => match self.conn.process_new_packets() {
                    Ok(io_state) => {
                        if io_state.peer_has_closed() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = self.pump_ciphertext_out();
                        self.state = TlsState::Closed;
                        return Err(TransportError::Tls(format!("TLS record error: {e}")));
                    }
                },
            }
        }

        match self.conn.reader().read(buf) {
            Ok(0) => {
                // Clean close from the engine: acknowledge and wind down
                debug!("TLS peer sent close_notify");
                self.close_requested = true;
                self.begin_close()?;
                Ok(IoStatus::Closed)
            }
            Ok(n) => Ok(IoStatus::Ready(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if peer_gone {
                    warn!("Peer closed the channel without close_notify");
                    self.state = TlsState::Closed;
                    Ok(IoStatus::Closed)
                } else {
                    Ok(IoStatus::WouldBlock)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!("Peer closed the channel without close_notify");
                self.state = TlsState::Closed;
                Ok(IoStatus::Closed)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> Result<IoStatus> {
        match self.process()? {
            TlsStatus::Ready => {}
            TlsStatus::NotReady => return Ok(IoStatus::WouldBlock),
            TlsStatus::Closed => return Ok(IoStatus::Closed),
        }
        if buf.is_empty() {
            return Ok(IoStatus::WouldBlock);
        }

        let written = std::io::Write::write(&mut self.conn.writer(), buf)?;
        self.pump_ciphertext_out()?;
        if written == 0 {
            Ok(IoStatus::WouldBlock)
        } else {
            Ok(IoStatus::Ready(written))
        }
    }

    fn close(&mut self) {
        self.close_requested = true;
        for _ in 0..8 {
            match self.process() {
                Ok(TlsStatus::Closed) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.channel.close();
        self.state = TlsState::Closed;
    }

    fn is_open(&self) -> bool {
        self.state != TlsState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::{memory_pair, MemoryChannel};
    use std::time::{Duration, Instant};

    const TEST_CERT: &[u8] = include_bytes!("../../tests/certs/localhost-cert.der");
    const TEST_KEY: &[u8] = include_bytes!("../../tests/certs/localhost-key.der");

    fn test_server_config() -> Arc<ServerConfig> {
        let cert = CertificateDer::from(TEST_CERT.to_vec());
        let key = PrivateKeyDer::Pkcs8(TEST_KEY.to_vec().into());
        server_config(vec![cert], key).expect("Test server config should build")
    }

    fn session_pair(
        options: TlsOptions,
    ) -> (TlsSession<MemoryChannel>, TlsSession<MemoryChannel>) {
        let (client_end, server_end) = memory_pair(256 * 1024);
        let server = TlsSession::server(server_end, test_server_config()).unwrap();
        let client = TlsSession::client(client_end, "localhost", options).unwrap();
        (client, server)
    }

    /// Step both sessions until `done` or the deadline expires, carrying
    /// the client's first error out.
    fn drive_until(
        client: &mut TlsSession<MemoryChannel>,
        server: &mut TlsSession<MemoryChannel>,
        mut done: impl FnMut(&TlsSession<MemoryChannel>, &TlsSession<MemoryChannel>) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let client_step = client.process();
            let _ = server.process();
            client_step?;
            if done(client, server) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!(
            "Timed out driving TLS sessions (client: {:?}, server: {:?})",
            client.state(),
            server.state()
        );
    }

    #[test]
    fn test_handshake_reaches_open() {
        let (mut client, mut server) = session_pair(TlsOptions {
            verify_hostname: true,
            trust_policy: TrustPolicy::AcceptAny,
        });

        drive_until(&mut client, &mut server, |c, s| {
            c.state() == TlsState::Open && s.state() == TlsState::Open
        })
        .expect("Handshake should succeed");

        assert_eq!(
            client.peer_certificates().len(),
            1,
            "Client should have captured the server chain"
        );
    }

    #[test]
    fn test_pinned_certificate_accepted() {
        let (mut client, mut server) = session_pair(TlsOptions {
            verify_hostname: true,
            trust_policy: TrustPolicy::Pinned(vec![CertificateDer::from(TEST_CERT.to_vec())]),
        });

        drive_until(&mut client, &mut server, |c, _| c.state() == TlsState::Open)
            .expect("Pinned chain should be accepted");
    }

    #[test]
    fn test_unknown_certificate_fails_with_chain() {
        // Pin a different certificate so the presented chain is unknown
        let (mut client, mut server) = session_pair(TlsOptions {
            verify_hostname: true,
            trust_policy: TrustPolicy::Pinned(vec![CertificateDer::from(vec![0xde, 0xad])]),
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let failure = loop {
            assert!(Instant::now() < deadline, "Verification should settle");
            match client.process() {
                Ok(_) => {
                    let _ = server.process();
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => break e,
            }
        };

        match failure {
            TransportError::UntrustedCertificate { chain } => {
                assert_eq!(chain.len(), 1, "Error should carry the offending chain");
                assert_eq!(chain[0].as_ref(), TEST_CERT);
            }
            other => panic!("Expected UntrustedCertificate, got {other:?}"),
        }
        assert_eq!(
            client.state(),
            TlsState::Closed,
            "Failed verification must close the session, never open it"
        );
        assert_eq!(client.process().unwrap(), TlsStatus::Closed);
    }

    #[test]
    fn test_data_round_trip_over_tls() {
        let (mut client, mut server) = session_pair(TlsOptions {
            verify_hostname: true,
            trust_policy: TrustPolicy::AcceptAny,
        });
        drive_until(&mut client, &mut server, |c, s| {
            c.state() == TlsState::Open && s.state() == TlsState::Open
        })
        .unwrap();

        assert_eq!(
            client.try_write(b"attack at dawn").unwrap(),
            IoStatus::Ready(14)
        );

        let mut buf = [0u8; 64];
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.len() < 14 {
            assert!(Instant::now() < deadline, "Server should receive the data");
            match server.try_read(&mut buf).unwrap() {
                IoStatus::Ready(n) => received.extend_from_slice(&buf[..n]),
                IoStatus::WouldBlock => std::thread::sleep(Duration::from_millis(2)),
                IoStatus::Closed => panic!("Unexpected close"),
            }
        }
        assert_eq!(&received, b"attack at dawn");

        // And the other direction
        assert_eq!(server.try_write(b"ack").unwrap(), IoStatus::Ready(3));
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "Client should receive the reply");
            match client.try_read(&mut buf).unwrap() {
                IoStatus::Ready(n) => {
                    assert_eq!(&buf[..n], b"ack");
                    break;
                }
                IoStatus::WouldBlock => std::thread::sleep(Duration::from_millis(2)),
                IoStatus::Closed => panic!("Unexpected close"),
            }
        }
    }

    #[test]
    fn test_orderly_close_reaches_closed_on_both_ends() {
        let (mut client, mut server) = session_pair(TlsOptions {
            verify_hostname: true,
            trust_policy: TrustPolicy::AcceptAny,
        });
        drive_until(&mut client, &mut server, |c, s| {
            c.state() == TlsState::Open && s.state() == TlsState::Open
        })
        .unwrap();

        client.request_close();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 64];
        while client.state() != TlsState::Closed || server.state() != TlsState::Closed {
            assert!(
                Instant::now() < deadline,
                "Close should settle (client: {:?}, server: {:?})",
                client.state(),
                server.state()
            );
            let _ = client.process();
            // The server observes the close while reading
            let _ = server.try_read(&mut buf);
            let _ = server.process();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_process_is_idempotent_when_idle() {
        let (client_end, _server_end) = memory_pair(4096);
        let mut client = TlsSession::client(
            client_end,
            "localhost",
            TlsOptions {
                verify_hostname: true,
                trust_policy: TrustPolicy::AcceptAny,
            },
        )
        .unwrap();

        // With no peer, the handshake parks after flushing ClientHello
        for _ in 0..10 {
            let status = client.process().expect("Idle process should not fail");
            assert_eq!(status, TlsStatus::NotReady);
            assert_eq!(client.state(), TlsState::Handshake);
        }
    }
}
