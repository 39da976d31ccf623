//! ClientHello fingerprint randomization
//!
//! Blocking middleboxes identify tunnel clients by the shape of their TLS
//! ClientHello (JA3/JA4): cipher suite order, extension set, supported groups,
//! ALPN and overall size. Every outbound TLS connection therefore gets a freshly
//! randomized [`ClientHelloSpec`], optionally carrying a padding extension with a
//! random length so the handshake size is never constant.
//!
//! ## Applying a spec
//!
//! rustls owns ClientHello serialization. [`build_tls_config`] maps everything
//! rustls lets a client choose (cipher suite order, key exchange group order,
//! ALPN, protocol versions, TLS 1.2 ticket support, SNI) from the spec. The
//! extension order and the padding extension stay in the template: they show up
//! in [`ClientHelloSpec::ja3_string`] but are not sent. The fields that do reach
//! the handshake are summarized by [`ClientHelloSpec::applied_ja3_string`].

use rand::seq::SliceRandom;
use rand::Rng;
use rustls::client::danger::ServerCertVerifier;
use rustls::client::{Resumption, Tls12Resumption};
use rustls::crypto::ring as ring_provider;
use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::{ClientConfig, SupportedCipherSuite, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// Length range of the padding extension when extra padding is requested
pub const EXTRA_PADDING_RANGE: Range<usize> = 2000..12000;

/// TLS extension type of the padding extension (RFC 7685)
pub const PADDING_EXTENSION_ID: u16 = 0x0015;

const TLS13_SUITES: [u16; 3] = [0x1301, 0x1302, 0x1303];
const TLS12_SUITES: [u16; 6] = [0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8];
const GROUPS: [u16; 3] = [0x001d, 0x0017, 0x0018];

const TLS13: u16 = 0x0304;
const TLS12: u16 = 0x0303;

/// ClientHello profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelloProfile {
    /// Chrome-like ordering
    Chrome,
    /// Firefox-like ordering
    Firefox,
    /// Safari-like ordering
    Safari,
    /// Fully randomized, ALPN offered on a coin flip
    Randomized,
    /// Fully randomized, ALPN always offered
    #[default]
    RandomizedAlpn,
}

/// Padding extension parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingExtension {
    /// Number of zero bytes in the extension body
    pub len: usize,
    /// Whether the extension is emitted at all
    pub will_pad: bool,
}

/// ClientHello extensions known to the builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloExtension {
    ServerName,
    ExtendedMasterSecret,
    RenegotiationInfo,
    SupportedGroups,
    EcPointFormats,
    SessionTicket,
    Alpn,
    StatusRequest,
    SignatureAlgorithms,
    SignedCertificateTimestamp,
    SupportedVersions,
    PskKeyExchangeModes,
    KeyShare,
    Padding(PaddingExtension),
}

impl HelloExtension {
    /// IANA extension type
    pub fn id(&self) -> u16 {
        match self {
            Self::ServerName => 0x0000,
            Self::ExtendedMasterSecret => 0x0017,
            Self::RenegotiationInfo => 0xff01,
            Self::SupportedGroups => 0x000a,
            Self::EcPointFormats => 0x000b,
            Self::SessionTicket => 0x0023,
            Self::Alpn => 0x0010,
            Self::StatusRequest => 0x0005,
            Self::SignatureAlgorithms => 0x000d,
            Self::SignedCertificateTimestamp => 0x0012,
            Self::SupportedVersions => 0x002b,
            Self::PskKeyExchangeModes => 0x002d,
            Self::KeyShare => 0x0033,
            Self::Padding(_) => PADDING_EXTENSION_ID,
        }
    }
}

/// A ClientHello template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    /// Cipher suites in offer order
    pub cipher_suites: Vec<u16>,
    /// Extensions in offer order
    pub extensions: Vec<HelloExtension>,
    /// Supported groups in preference order (the first gets a key share)
    pub supported_groups: Vec<u16>,
    /// EC point formats
    pub point_formats: Vec<u8>,
    /// ALPN protocols
    pub alpn: Vec<String>,
    /// Offered protocol versions
    pub versions: Vec<u16>,
}

impl ClientHelloSpec {
    /// Randomized spec with ALPN, the profile used by the TLS tunnel by default
    pub fn randomized(extra_padding: bool) -> Self {
        build_client_hello_spec(HelloProfile::RandomizedAlpn, extra_padding)
    }

    /// The padding extension, if the spec has one
    pub fn padding(&self) -> Option<&PaddingExtension> {
        self.extensions.iter().find_map(|ext| match ext {
            HelloExtension::Padding(padding) => Some(padding),
            _ => None,
        })
    }

    /// Whether an extension with the given type is present
    pub fn has_extension(&self, id: u16) -> bool {
        self.extensions.iter().any(|ext| ext.id() == id)
    }

    /// Force a padding extension with a random length in [`EXTRA_PADDING_RANGE`]
    ///
    /// An existing padding extension is reused in place; otherwise one is
    /// appended at the end of the extension list.
    pub fn apply_extra_padding<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let len = rng.gen_range(EXTRA_PADDING_RANGE);

        let existing = self.extensions.iter_mut().find_map(|ext| match ext {
            HelloExtension::Padding(padding) => Some(padding),
            _ => None,
        });

        match existing {
            Some(padding) => {
                padding.len = len;
                padding.will_pad = true;
            }
            None => self.extensions.push(HelloExtension::Padding(PaddingExtension {
                len,
                will_pad: true,
            })),
        }
    }

    /// JA3 string of the template, extension order and padding included
    ///
    /// This is not what goes on the wire; see [`applied_ja3_string`](Self::applied_ja3_string).
    pub fn ja3_string(&self) -> String {
        let join = |values: Vec<String>| values.join("-");

        format!(
            "{},{},{},{},{}",
            TLS12,
            join(self.cipher_suites.iter().map(|c| c.to_string()).collect()),
            join(self.extensions.iter().map(|e| e.id().to_string()).collect()),
            join(self.supported_groups.iter().map(|g| g.to_string()).collect()),
            join(self.point_formats.iter().map(|p| p.to_string()).collect()),
        )
    }

    /// JA3 hash of the template (MD5 of [`ja3_string`](Self::ja3_string))
    pub fn ja3_hash(&self) -> String {
        format!("{:x}", md5::compute(self.ja3_string().as_bytes()))
    }

    /// JA3 string restricted to what [`build_tls_config`] applies
    ///
    /// Only suites and groups the backend supports are kept, in spec order. The
    /// extension field is empty because rustls chooses the extensions it sends.
    pub fn applied_ja3_string(&self) -> String {
        let join = |values: Vec<String>| values.join("-");

        format!(
            "{},{},,{},{}",
            TLS12,
            join(
                self.cipher_suites
                    .iter()
                    .filter(|id| !map_cipher_suites(&[**id]).is_empty())
                    .map(|c| c.to_string())
                    .collect()
            ),
            join(
                self.supported_groups
                    .iter()
                    .filter(|id| !map_kx_groups(&[**id]).is_empty())
                    .map(|g| g.to_string())
                    .collect()
            ),
            join(self.point_formats.iter().map(|p| p.to_string()).collect()),
        )
    }

    /// MD5 of [`applied_ja3_string`](Self::applied_ja3_string)
    pub fn applied_ja3_hash(&self) -> String {
        format!("{:x}", md5::compute(self.applied_ja3_string().as_bytes()))
    }
}

/// Build a ClientHello spec for the given profile
///
/// Randomized profiles draw from the thread-local RNG, so two calls produce
/// different specs.
pub fn build_client_hello_spec(profile: HelloProfile, extra_padding: bool) -> ClientHelloSpec {
    let mut rng = rand::thread_rng();
    let mut spec = match profile {
        HelloProfile::Chrome => chrome_spec(),
        HelloProfile::Firefox => firefox_spec(),
        HelloProfile::Safari => safari_spec(),
        HelloProfile::Randomized => {
            let alpn = rng.gen_bool(0.5);
            randomized_spec(&mut rng, alpn)
        }
        HelloProfile::RandomizedAlpn => randomized_spec(&mut rng, true),
    };

    if extra_padding {
        spec.apply_extra_padding(&mut rng);
    }

    spec
}

fn base_extensions(alpn: bool) -> Vec<HelloExtension> {
    let mut extensions = vec![
        HelloExtension::ServerName,
        HelloExtension::ExtendedMasterSecret,
        HelloExtension::RenegotiationInfo,
        HelloExtension::SupportedGroups,
        HelloExtension::EcPointFormats,
        HelloExtension::SessionTicket,
        HelloExtension::StatusRequest,
        HelloExtension::SignatureAlgorithms,
        HelloExtension::SupportedVersions,
        HelloExtension::PskKeyExchangeModes,
        HelloExtension::KeyShare,
    ];
    if alpn {
        extensions.insert(6, HelloExtension::Alpn);
    }
    extensions
}

fn browser_alpn() -> Vec<String> {
    vec!["h2".to_string(), "http/1.1".to_string()]
}

fn randomized_spec<R: Rng + ?Sized>(rng: &mut R, alpn: bool) -> ClientHelloSpec {
    let mut tls13 = TLS13_SUITES.to_vec();
    tls13.shuffle(rng);

    let mut tls12: Vec<u16> = TLS12_SUITES
        .iter()
        .copied()
        .filter(|_| rng.gen_bool(0.5))
        .collect();
    if tls12.is_empty() {
        tls12.push(*TLS12_SUITES.choose(rng).unwrap_or(&TLS12_SUITES[0]));
    }
    tls12.shuffle(rng);

    let mut supported_groups = GROUPS.to_vec();
    supported_groups.shuffle(rng);

    let mut extensions = base_extensions(alpn);
    if rng.gen_bool(0.5) {
        extensions.push(HelloExtension::SignedCertificateTimestamp);
    }
    if rng.gen_bool(0.5) {
        extensions.push(HelloExtension::Padding(PaddingExtension {
            len: 0,
            will_pad: false,
        }));
    }
    extensions.shuffle(rng);

    ClientHelloSpec {
        cipher_suites: tls13.into_iter().chain(tls12).collect(),
        extensions,
        supported_groups,
        point_formats: vec![0x00],
        alpn: if alpn { browser_alpn() } else { Vec::new() },
        versions: vec![TLS13, TLS12],
    }
}

fn chrome_spec() -> ClientHelloSpec {
    let mut extensions = base_extensions(true);
    extensions.insert(9, HelloExtension::SignedCertificateTimestamp);

    ClientHelloSpec {
        cipher_suites: vec![
            0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8,
        ],
        extensions,
        supported_groups: vec![0x001d, 0x0017, 0x0018],
        point_formats: vec![0x00],
        alpn: browser_alpn(),
        versions: vec![TLS13, TLS12],
    }
}

fn firefox_spec() -> ClientHelloSpec {
    ClientHelloSpec {
        cipher_suites: vec![
            0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030,
        ],
        extensions: base_extensions(true),
        supported_groups: vec![0x001d, 0x0017, 0x0018],
        point_formats: vec![0x00],
        alpn: browser_alpn(),
        versions: vec![TLS13, TLS12],
    }
}

fn safari_spec() -> ClientHelloSpec {
    let mut extensions = base_extensions(true);
    extensions.retain(|ext| *ext != HelloExtension::SessionTicket);

    ClientHelloSpec {
        cipher_suites: vec![
            0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xc030, 0xc02f, 0xcca9, 0xcca8,
        ],
        extensions,
        supported_groups: vec![0x001d, 0x0017, 0x0018],
        point_formats: vec![0x00],
        alpn: browser_alpn(),
        versions: vec![TLS13, TLS12],
    }
}

/// Build a rustls ClientConfig that follows a ClientHello spec
pub fn build_tls_config(
    spec: &ClientHelloSpec,
    verifier: Arc<dyn ServerCertVerifier>,
) -> Result<ClientConfig, FingerprintError> {
    let cipher_suites = map_cipher_suites(&spec.cipher_suites);
    if cipher_suites.is_empty() {
        return Err(FingerprintError::NoCipherSuites);
    }

    let kx_groups = map_kx_groups(&spec.supported_groups);
    if kx_groups.is_empty() {
        return Err(FingerprintError::NoKeyExchangeGroups);
    }

    let versions = map_versions(&spec.versions);
    if versions.is_empty() {
        return Err(FingerprintError::NoProtocolVersions);
    }

    let crypto_provider = CryptoProvider {
        cipher_suites,
        kx_groups,
        ..ring_provider::default_provider()
    };

    let mut tls_config = ClientConfig::builder_with_provider(Arc::new(crypto_provider))
        .with_protocol_versions(&versions)
        .map_err(|e| FingerprintError::Config(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    tls_config.alpn_protocols = spec.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    tls_config.enable_sni = spec.has_extension(HelloExtension::ServerName.id());

    if !spec.has_extension(HelloExtension::SessionTicket.id()) {
        tls_config.resumption =
            Resumption::default().tls12_resumption(Tls12Resumption::SessionIdOnly);
    }

    Ok(tls_config)
}

fn map_cipher_suites(ids: &[u16]) -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite;

    ids.iter()
        .filter_map(|id| match id {
            0x1301 => Some(cipher_suite::TLS13_AES_128_GCM_SHA256),
            0x1302 => Some(cipher_suite::TLS13_AES_256_GCM_SHA384),
            0x1303 => Some(cipher_suite::TLS13_CHACHA20_POLY1305_SHA256),
            0xc02b => Some(cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256),
            0xc02f => Some(cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256),
            0xc02c => Some(cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384),
            0xc030 => Some(cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384),
            0xcca9 => Some(cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256),
            0xcca8 => Some(cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256),
            _ => None,
        })
        .collect()
}

fn map_kx_groups(ids: &[u16]) -> Vec<&'static dyn SupportedKxGroup> {
    use rustls::crypto::ring::kx_group;

    ids.iter()
        .filter_map(|id| match id {
            0x001d => Some(kx_group::X25519),
            0x0017 => Some(kx_group::SECP256R1),
            0x0018 => Some(kx_group::SECP384R1),
            _ => None,
        })
        .collect()
}

fn map_versions(ids: &[u16]) -> Vec<&'static SupportedProtocolVersion> {
    ids.iter()
        .filter_map(|id| match *id {
            TLS13 => Some(&rustls::version::TLS13),
            TLS12 => Some(&rustls::version::TLS12),
            _ => None,
        })
        .collect()
}

/// Fingerprint-related errors
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("Spec has no cipher suite supported by the TLS backend")]
    NoCipherSuites,

    #[error("Spec has no key exchange group supported by the TLS backend")]
    NoKeyExchangeGroups,

    #[error("Spec has no supported protocol version")]
    NoProtocolVersions,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NoCertificateVerification;

    fn verifier() -> Arc<dyn ServerCertVerifier> {
        Arc::new(NoCertificateVerification::new())
    }

    #[test]
    fn test_extra_padding_range() {
        for _ in 0..200 {
            let spec = ClientHelloSpec::randomized(true);
            let padding = spec.padding().expect("padding extension present");
            assert!(padding.will_pad);
            assert!(EXTRA_PADDING_RANGE.contains(&padding.len));
        }
    }

    #[test]
    fn test_extra_padding_reuses_existing_extension() {
        let mut rng = rand::thread_rng();
        let mut spec = chrome_spec();
        spec.extensions.insert(
            2,
            HelloExtension::Padding(PaddingExtension {
                len: 0,
                will_pad: false,
            }),
        );
        let before = spec.extensions.len();

        spec.apply_extra_padding(&mut rng);

        assert_eq!(spec.extensions.len(), before);
        assert!(matches!(
            spec.extensions[2],
            HelloExtension::Padding(PaddingExtension { will_pad: true, .. })
        ));
    }

    #[test]
    fn test_extra_padding_appends_when_missing() {
        let spec = build_client_hello_spec(HelloProfile::Firefox, true);
        let last = spec.extensions.last().unwrap();
        assert_eq!(last.id(), PADDING_EXTENSION_ID);
        assert_eq!(
            spec.extensions.iter().filter(|e| e.id() == PADDING_EXTENSION_ID).count(),
            1
        );
    }

    #[test]
    fn test_no_forced_padding_without_flag() {
        let spec = build_client_hello_spec(HelloProfile::Chrome, false);
        assert!(spec.padding().is_none());

        for _ in 0..50 {
            let spec = ClientHelloSpec::randomized(false);
            if let Some(padding) = spec.padding() {
                assert!(!padding.will_pad);
            }
        }
    }

    #[test]
    fn test_randomized_specs_differ() {
        let first = ClientHelloSpec::randomized(true);
        let differs = (0..20).any(|_| ClientHelloSpec::randomized(true) != first);
        assert!(differs);
    }

    #[test]
    fn test_randomized_alpn_always_offered() {
        for _ in 0..20 {
            let spec = ClientHelloSpec::randomized(false);
            assert_eq!(spec.alpn, browser_alpn());
            assert!(spec.has_extension(HelloExtension::Alpn.id()));
        }
    }

    #[test]
    fn test_randomized_keeps_tls13_suites_first() {
        let spec = ClientHelloSpec::randomized(false);
        let mut leading = spec.cipher_suites[..3].to_vec();
        leading.sort_unstable();
        assert_eq!(leading, TLS13_SUITES.to_vec());
        assert!(spec.cipher_suites.len() > 3);
    }

    #[test]
    fn test_build_config_from_random_spec() {
        for _ in 0..20 {
            let spec = ClientHelloSpec::randomized(true);
            let config = build_tls_config(&spec, verifier()).unwrap();
            assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        }
    }

    #[test]
    fn test_build_config_rejects_unknown_suites() {
        let mut spec = chrome_spec();
        spec.cipher_suites = vec![0x0a0a];
        assert!(matches!(
            build_tls_config(&spec, verifier()),
            Err(FingerprintError::NoCipherSuites)
        ));
    }

    #[test]
    fn test_ja3() {
        let chrome = chrome_spec();
        let firefox = firefox_spec();

        assert!(chrome.ja3_string().starts_with("771,4865-4866-4867,"));
        assert_ne!(chrome.ja3_hash(), firefox.ja3_hash());
        assert_eq!(chrome.ja3_hash().len(), 32);
    }

    #[test]
    fn test_applied_ja3_ignores_template_only_fields() {
        let plain = chrome_spec();
        let mut padded = plain.clone();
        padded.apply_extra_padding(&mut rand::thread_rng());
        padded.extensions.reverse();
        padded.cipher_suites.push(0x0a0a);

        assert_ne!(plain.ja3_hash(), padded.ja3_hash());
        assert_eq!(plain.applied_ja3_hash(), padded.applied_ja3_hash());
        assert!(plain.applied_ja3_string().contains(",,"));
        assert!(!plain.applied_ja3_string().contains("2570"));
    }
}
