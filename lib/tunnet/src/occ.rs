//! Options consistency check (spec §4.M): canonical options string exchange plus an
//! MTU probe.

/// The canonical options string format: `"V4,dev-type tun,link-mtu N,tun-mtu N,proto
/// X,cipher Y,auth Z,keysize K,..."`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsString {
    pub dev_type: String,
    pub link_mtu: usize,
    pub tun_mtu: usize,
    pub proto: String,
    pub cipher: String,
    pub auth: String,
    pub keysize: usize,
}

impl OptionsString {
    pub fn render(&self) -> String {
        format!(
            "V4,dev-type {},link-mtu {},tun-mtu {},proto {},cipher {},auth {},keysize {}",
            self.dev_type, self.link_mtu, self.tun_mtu, self.proto, self.cipher, self.auth, self.keysize
        )
    }
}

/// Compares the peer's rendered options string against what's locally expected.
/// Mismatch is warning-only (spec §4.M: "for forward compatibility"), except that a
/// mismatched wire version — the leading `"V4"`-style token, i.e. the first two
/// bytes of the string — suppresses the warning entirely (spec §7: "mismatched wire
/// version ... suppresses the warning"), since a peer running a different wire
/// version can't be expected to agree on anything downstream of it.
pub fn check(local_expected_remote: &str, remote_actual: &str) -> Option<String> {
    if local_expected_remote == remote_actual {
        return None;
    }

    if wire_version(local_expected_remote) != wire_version(remote_actual) {
        return None;
    }

    Some(format!(
        "OCC mismatch: expected remote options '{}', got '{}'",
        local_expected_remote, remote_actual
    ))
}

#[inline]
fn wire_version(options: &str) -> &str {
    &options[..options.len().min(2)]
}

/// One MTU-probe round trip: request the peer to echo back a packet of
/// `requested_size` bytes and confirm the echo matches.
pub struct MtuProbe {
    requested_size: usize,
}

impl MtuProbe {
    pub fn new(requested_size: usize) -> MtuProbe {
        MtuProbe { requested_size }
    }

    #[inline]
    pub fn requested_size(&self) -> usize {
        self.requested_size
    }

    /// Builds the payload to send as the probe request.
    pub fn request_payload(&self) -> Vec<u8> {
        vec![0xfe; self.requested_size]
    }

    /// Validates an echoed probe response.
    pub fn validate_response(&self, echoed: &[u8]) -> bool {
        echoed.len() == self.requested_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_options() -> OptionsString {
        OptionsString {
            dev_type: "tun".into(),
            link_mtu: 1500,
            tun_mtu: 1400,
            proto: "udp".into(),
            cipher: "AES-256-CBC".into(),
            auth: "SHA1".into(),
            keysize: 256,
        }
    }

    #[test]
    fn test_render_matches_canonical_format() {
        let rendered = sample_options().render();
        assert_eq!(
            rendered,
            "V4,dev-type tun,link-mtu 1500,tun-mtu 1400,proto udp,cipher AES-256-CBC,auth SHA1,keysize 256"
        );
    }

    #[test]
    fn test_check_matching_strings_ok() {
        let options = sample_options().render();
        assert!(check(&options, &options).is_none());
    }

    #[test]
    fn test_check_mismatch_reports_warning() {
        let expected = sample_options().render();
        let mut actual_options = sample_options();
        actual_options.tun_mtu = 1200;
        let actual = actual_options.render();

        assert!(check(&expected, &actual).is_some());
    }

    #[test]
    fn test_check_suppresses_warning_on_wire_version_mismatch() {
        let expected = sample_options().render();
        let actual = expected.replacen("V4", "V5", 1);

        assert!(check(&expected, &actual).is_none());
    }

    #[test]
    fn test_mtu_probe_roundtrip() {
        let probe = MtuProbe::new(1400);
        let request = probe.request_payload();
        assert_eq!(request.len(), 1400);
        assert!(probe.validate_response(&request));
        assert!(!probe.validate_response(&request[..1000]));
    }
}
