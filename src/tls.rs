use std::sync::OnceLock;

/// Select the process-wide rustls crypto provider.
///
/// rustls 0.23 cannot infer a default when both `ring` and `aws-lc-rs` end up enabled in the
/// dependency graph; the first TLS handshake would then panic. Called before every `wss://`
/// connect and when the feed is built.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err means another provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
