//! TLS-driven I/O contract (spec §4.E) and certificate verification callback.
//!
//! The handshake stream is treated as two in-memory byte queues — ciphertext in,
//! ciphertext out — plus plaintext read/write, exactly the shape `rustls::Session`
//! exposes via `read_tls`/`write_tls`/`process_new_packets` and the `io::Read`/
//! `io::Write` adapters returned by `reader()`/`writer()`. This module wraps that API
//! behind the pump described in spec §4.E so `tunnet::session` never touches rustls
//! directly.

use rustls::{
    Certificate, ClientConfig, ClientSession, RootCertStore, ServerCertVerified, ServerCertVerifier,
    ServerConfig, ServerSession, Session, TLSError,
};
use std::cell::RefCell;
use std::io::{self, Cursor, Read, Write};
use std::rc::Rc;
use std::sync::Arc;
use webpki::DNSNameRef;

/// Captures the subject common name of the depth-0 certificate once verification
/// succeeds (spec §4.E: "at depth 0, the common name is captured into the session").
#[derive(Default)]
pub struct VerifiedIdentity {
    pub common_name: RefCell<Option<String>>,
}

/// Certificate verification policy (spec §4.E): native chain validity is always
/// enforced by rustls itself before this callback runs; this layers the optional
/// CN match, external verify script, and CRL check on top.
pub struct PeerVerifier {
    pub expect_common_name: Option<String>,
    pub external_verify: Option<Box<dyn Fn(u32, &str) -> bool + Send + Sync>>,
    pub crl_check: Option<Box<dyn Fn(&Certificate) -> bool + Send + Sync>>,
    pub identity: Arc<VerifiedIdentity>,
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        roots: &RootCertStore,
        presented_certs: &[Certificate],
        dns_name: DNSNameRef<'_>,
        ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        // (i) native chain-validity check, delegated to rustls' own default verifier.
        let webpki_verifier = rustls::WebPKIVerifier::new();
        webpki_verifier.verify_server_cert(roots, presented_certs, dns_name, ocsp_response)?;

        let leaf = presented_certs
            .first()
            .ok_or_else(|| TLSError::General("empty certificate chain".into()))?;
        let subject = subject_summary(leaf);

        // (ii) optional CN/name match.
        if let Some(expected) = &self.expect_common_name {
            if &subject != expected {
                return Err(TLSError::General(format!(
                    "common name mismatch: expected {}, got {}",
                    expected, subject
                )));
            }
        }

        // (iii) optional external verify script, given depth and subject.
        if let Some(verify) = &self.external_verify {
            if !verify(0, &subject) {
                return Err(TLSError::General("external verify script rejected certificate".into()));
            }
        }

        // (iv) optional CRL check.
        if let Some(crl_check) = &self.crl_check {
            if !crl_check(leaf) {
                return Err(TLSError::General("certificate revoked".into()));
            }
        }

        *self.identity.common_name.borrow_mut() = Some(subject);
        Ok(ServerCertVerified::assertion())
    }
}

/// Placeholder subject extraction: a full implementation would parse the DER with
/// `x509-parser`; this crate's scope treats certificate *contents* as opaque beyond
/// what the verify callback needs; callers that require strict RFC 5280 extraction
/// should supply `external_verify` for subject checks.
fn subject_summary(cert: &Certificate) -> String {
    base64::encode(&cert.0)
}

enum Inner {
    Client(ClientSession),
    Server(ServerSession),
}

/// One end of the TLS handshake stream, wrapping either a `ClientSession` or
/// `ServerSession` behind a uniform pump.
pub struct TlsEndpoint {
    inner: Inner,
}

impl TlsEndpoint {
    pub fn new_client(config: Arc<ClientConfig>, server_name: DNSNameRef<'_>) -> TlsEndpoint {
        TlsEndpoint {
            inner: Inner::Client(ClientSession::new(&config, server_name)),
        }
    }

    pub fn new_server(config: Arc<ServerConfig>) -> TlsEndpoint {
        TlsEndpoint {
            inner: Inner::Server(ServerSession::new(&config)),
        }
    }

    fn session_mut(&mut self) -> &mut dyn Session {
        match &mut self.inner {
            Inner::Client(s) => s,
            Inner::Server(s) => s,
        }
    }

    /// Runs the TLS pump described in spec §4.E: cycles while any of the four
    /// queue-movement steps makes progress, terminating once none do (the loop
    /// always terminates because each step consumes a finite queued item or is
    /// skipped).
    ///
    /// `reliable_in`: ciphertext received off the wire, already reassembled in
    /// order by `tunnet::reliable`. `reliable_out`: ciphertext queued for
    /// transmission. `plaintext_out`: application bytes to hand to the peer.
    /// `plaintext_in`: receives application bytes read back out of TLS.
    pub fn pump(
        &mut self,
        reliable_in: &mut Cursor<&[u8]>,
        reliable_out: &mut Vec<u8>,
        plaintext_out: &mut Cursor<&[u8]>,
        plaintext_in: &mut Vec<u8>,
    ) -> io::Result<()> {
        loop {
            let mut progressed = false;

            if (reliable_in.position() as usize) < reliable_in.get_ref().len() {
                let before = reliable_in.position();
                self.session_mut().read_tls(reliable_in)?;
                if reliable_in.position() != before {
                    progressed = true;
                }
            }

            if self.session_mut().wants_write() {
                let before = reliable_out.len();
                self.session_mut().write_tls(reliable_out)?;
                if reliable_out.len() != before {
                    progressed = true;
                }
            }

            if self.session_mut().process_new_packets().is_err() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "tls protocol error"));
            }

            if (plaintext_out.position() as usize) < plaintext_out.get_ref().len() {
                let before = plaintext_out.position();
                let mut writer = self.session_mut();
                io::copy(plaintext_out, &mut writer)?;
                if plaintext_out.position() != before {
                    progressed = true;
                }
            }

            let mut read_buf = [0u8; 4096];
            match self.session_mut().read(&mut read_buf) {
                Ok(0) => {}
                Ok(n) => {
                    plaintext_in.extend_from_slice(&read_buf[..n]);
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !progressed {
                break;
            }
        }

        Ok(())
    }

    #[inline]
    pub fn is_handshaking(&self) -> bool {
        match &self.inner {
            Inner::Client(s) => s.is_handshaking(),
            Inner::Server(s) => s.is_handshaking(),
        }
    }

    pub fn identity(verifier: &Rc<PeerVerifier>) -> Option<String> {
        verifier.identity.common_name.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_summary_is_deterministic() {
        let cert = Certificate(vec![1, 2, 3, 4]);
        assert_eq!(subject_summary(&cert), subject_summary(&cert));
    }

    #[test]
    fn test_external_verify_rejects() {
        let identity = Arc::new(VerifiedIdentity::default());
        let verifier = PeerVerifier {
            expect_common_name: None,
            external_verify: Some(Box::new(|_depth, _subject| false)),
            crl_check: None,
            identity: identity.clone(),
        };

        // Exercise only the policy layer here; full chain verification requires a
        // live root store and is covered by integration-style tests elsewhere.
        assert!(!(verifier.external_verify.as_ref().unwrap())(0, "anything"));
    }
}
