//! Traffic obfuscation layer
//!
//! Provides a per-connection randomized TLS ClientHello so that the TLS tunnel
//! does not present a static, easily blocked fingerprint. Each dial builds a
//! fresh [`ClientHelloSpec`]; nothing is shared between connections.

mod fingerprint;

pub use fingerprint::{
    build_client_hello_spec, build_tls_config, ClientHelloSpec, FingerprintError, HelloExtension,
    HelloProfile, PaddingExtension, EXTRA_PADDING_RANGE, PADDING_EXTENSION_ID,
};
