#![allow(dead_code)]

use std::io::Write;
use tempfile::NamedTempFile;
use tlsedge::Harness;
use tracing_subscriber::EnvFilter;

/// Guard that holds temporary certificate files and auto-cleans them on drop
pub struct TlsCertGuard {
    _cert_file: NamedTempFile,
    _key_file: NamedTempFile,
    _ca_cert_file: NamedTempFile,
}

/// Installs a log subscriber when `TEST_LOG` is set, e.g.
/// `TEST_LOG=tlsedge=debug`.
pub fn init_tracing() {
    if std::env::var_os("TEST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_env("TEST_LOG"))
            .with_test_writer()
            .try_init();
    }
}

/// Config builder preloaded with a fresh self-signed certificate for
/// `localhost`. Returns (builder, cleanup_guard)
pub fn test_config_builder() -> (
    config::builder::ConfigBuilder<config::builder::DefaultState>,
    TlsCertGuard,
) {
    init_tracing();
    let (cert_file, key_file, ca_cert_file) = create_temp_cert_files();

    let builder = config::Config::builder()
        .set_default("tls_server_cert", cert_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_server_key", key_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_ca_cert", ca_cert_file.path().to_str().unwrap())
        .unwrap();

    (
        builder,
        TlsCertGuard {
            _cert_file: cert_file,
            _key_file: key_file,
            _ca_cert_file: ca_cert_file,
        },
    )
}

/// Generate TLS config for testing with both server and client settings
/// Returns (config, cleanup_guard)
pub fn generate_test_tls_config() -> (config::Config, TlsCertGuard) {
    let (builder, guard) = test_config_builder();
    (builder.build().unwrap(), guard)
}

/// A harness over a fresh self-signed certificate. Keep the guard alive as
/// long as the harness is used.
pub fn test_harness() -> (Harness, TlsCertGuard) {
    let (config, guard) = generate_test_tls_config();
    (Harness::new(&config).unwrap(), guard)
}

/// A harness whose client trusts a different self-signed certificate than
/// the one the listener presents.
pub fn untrusted_harness() -> (Harness, TlsCertGuard, NamedTempFile) {
    let (builder, guard) = test_config_builder();
    let (_, _, other_ca) = create_temp_cert_files();
    let config = builder
        .set_override("tls_ca_cert", other_ca.path().to_str().unwrap())
        .unwrap()
        .build()
        .unwrap();
    (Harness::new(&config).unwrap(), guard, other_ca)
}

/// Create temporary certificate files with self-signed cert
fn create_temp_cert_files() -> (NamedTempFile, NamedTempFile, NamedTempFile) {
    let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_pem = certified_key.cert.pem();
    let key_pem = certified_key.key_pair.serialize_pem();

    // Create temporary files that will auto-delete on drop
    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    let mut ca_cert_file = NamedTempFile::new().unwrap();

    cert_file.write_all(cert_pem.as_bytes()).unwrap();
    key_file.write_all(key_pem.as_bytes()).unwrap();
    // For testing, CA cert is the same as server cert (self-signed)
    ca_cert_file.write_all(cert_pem.as_bytes()).unwrap();

    // Flush to ensure files are written before use
    cert_file.flush().unwrap();
    key_file.flush().unwrap();
    ca_cert_file.flush().unwrap();

    (cert_file, key_file, ca_cert_file)
}
