use std::env;
use std::fs::File;
use std::io::BufReader;

use log::{error, info};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};

use signal_relay::server::{routes, Server};

const DEFAULT_PORT: u16 = 2052;
const TLS_CERT_PATH: &str = "ssl/relay/certificate.pem";
const TLS_KEY_PATH: &str = "ssl/relay/private.key";

/// Validates the cert/key pair up front so a misconfigured deployment falls
/// back to plaintext instead of failing mid-handshake. Warp is handed the
/// file paths, not this config.
fn load_tls_config() -> Option<ServerConfig> {
    let cert_file = match File::open(TLS_CERT_PATH) {
        Ok(file) => file,
        Err(e) => {
            info!("no TLS certificate at {TLS_CERT_PATH}: {e}");
            return None;
        }
    };
    let key_file = match File::open(TLS_KEY_PATH) {
        Ok(file) => file,
        Err(e) => {
            info!("no TLS private key at {TLS_KEY_PATH}: {e}");
            return None;
        }
    };

    let certs: Vec<CertificateDer<'static>> =
        match certs(&mut BufReader::new(cert_file)).collect::<Result<_, _>>() {
            Ok(certs) => certs,
            Err(e) => {
                error!("failed to parse certificate: {e}");
                return None;
            }
        };
    let key = match pkcs8_private_keys(&mut BufReader::new(key_file)).next() {
        Some(Ok(key)) => PrivateKeyDer::Pkcs8(key),
        Some(Err(e)) => {
            error!("failed to parse private key: {e}");
            return None;
        }
        None => {
            error!("no PKCS#8 private key found in {TLS_KEY_PATH}");
            return None;
        }
    };

    match ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
    {
        Ok(config) => Some(config),
        Err(e) => {
            error!("failed to build TLS config: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let server = Server::new();
    let routes = routes(server);

    match load_tls_config() {
        Some(_) => {
            info!("starting secure signaling relay (HTTPS/WSS) on port {port}");
            warp::serve(routes)
                .tls()
                .cert_path(TLS_CERT_PATH)
                .key_path(TLS_KEY_PATH)
                .run(([0, 0, 0, 0], port))
                .await;
        }
        None => {
            info!("starting signaling relay (HTTP/WS) on port {port}");
            warp::serve(routes).run(([0, 0, 0, 0], port)).await;
        }
    }
}
