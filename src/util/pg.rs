use anyhow::{anyhow, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs::load_native_certs;
use std::sync::Arc;
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// Postgres `sslmode=require` means "encrypt" but does not mandate verifying that the
/// server cert chains to a trusted CA. Signature checks still go through webpki.
#[derive(Debug)]
struct SslModeRequireVerifier {
    inner: Arc<dyn ServerCertVerifier>,
}

impl ServerCertVerifier for SslModeRequireVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn sslmode_from_querystring(url: &str) -> Option<String> {
    url.split_once('?').and_then(|(_, qs)| {
        qs.split('&').find_map(|kv| match kv.split_once('=') {
            Some((k, v)) if k.eq_ignore_ascii_case("sslmode") => Some(v.to_lowercase()),
            _ => None,
        })
    })
}

fn host_is_local(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1") || url.contains("://0.0.0.0")
}

/// Effective sslmode; precedence: querystring > PG_SSLMODE/DB_SSLMODE env > host heuristic.
fn effective_sslmode(url: &str) -> String {
    let from_env = std::env::var("PG_SSLMODE")
        .ok()
        .or_else(|| std::env::var("DB_SSLMODE").ok())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    match (sslmode_from_querystring(url), from_env) {
        (Some(url_mode), Some(env_mode)) if url_mode != env_mode => {
            // Only the modes are logged; the DSN carries secrets.
            warn!(dsn_mode = %url_mode, env_mode = %env_mode, "sslmode differs between DSN and env; honoring DSN");
            url_mode
        }
        (Some(url_mode), _) => url_mode,
        (None, Some(env_mode)) => env_mode,
        (None, None) if host_is_local(url) => "prefer".to_string(),
        (None, None) => "require".to_string(),
    }
}

async fn connect_tls(url: &str, sslmode: &str) -> Result<Client> {
    let mut roots = RootCertStore::empty();
    for cert in load_native_certs().certs {
        let _ = roots.add(cert);
    }
    roots.extend(TLS_SERVER_ROOTS.iter().cloned());

    let config = if matches!(sslmode, "verify-ca" | "verify-full") {
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        let inner: Arc<dyn ServerCertVerifier> =
            WebPkiServerVerifier::builder(roots.into()).build()?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SslModeRequireVerifier { inner }))
            .with_no_client_auth()
    };
    let (client, conn) = tokio_postgres::connect(url, MakeRustlsConnect::new(config)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "postgres connection error");
        }
    });
    Ok(client)
}

async fn connect_notls(url: &str) -> Result<Client> {
    let (client, conn) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "postgres connection error");
        }
    });
    Ok(client)
}

/// Connect using TLS by default, honoring sslmode overrides.
///
/// - `disable`: plaintext.
/// - `prefer`: TLS first, plaintext fallback only for local hosts.
/// - anything else: TLS required.
pub async fn connect_postgres_auto(url: &str) -> Result<Client> {
    let sslmode = effective_sslmode(url);
    let client = match sslmode.as_str() {
        "disable" => {
            info!("sslmode=disable (NoTLS)");
            connect_notls(url).await?
        }
        "prefer" => match connect_tls(url, &sslmode).await {
            Ok(c) => c,
            Err(e) if host_is_local(url) => {
                warn!(error = %e, "TLS failed in prefer mode on local host, falling back to NoTLS");
                connect_notls(url).await?
            }
            Err(e) => return Err(anyhow!("TLS connection failed (sslmode=prefer, non-local): {e}")),
        },
        _ => connect_tls(url, &sslmode).await?,
    };
    Ok(client)
}

/// Transaction-local tuning for the bulk path. Must run after BEGIN.
pub async fn apply_fast_ingest_session(pg: &Client) -> Result<()> {
    pg.batch_execute(
        r#"
SET LOCAL synchronous_commit = OFF;
SET LOCAL idle_in_transaction_session_timeout = '60s';
SET LOCAL lock_timeout = '10s';
SET LOCAL timezone = 'UTC';
SET LOCAL jit = OFF;
"#,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sslmode_querystring_wins() {
        assert_eq!(
            sslmode_from_querystring("postgres://h/db?application_name=x&sslmode=Disable"),
            Some("disable".to_string())
        );
        assert_eq!(sslmode_from_querystring("postgres://h/db"), None);
    }

    #[test]
    fn local_hosts_default_to_prefer() {
        assert!(host_is_local("postgres://u@localhost:5432/db"));
        assert!(!host_is_local("postgres://u@db.example.com:5432/db"));
    }
}
