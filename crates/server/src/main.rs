mod app;
mod auth;
mod config;
mod history;
mod metrics;
mod openapi;
mod util;

use app::CifraChatApp;
use pingora::listeners::tls::TlsSettings;
use pingora::server::Server;
use pingora::services::listening::Service;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("CIFRACHAT_CONFIG").unwrap_or_else(|_| "cifrachat.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let state = runtime.block_on(CifraChatApp::init(config)).expect("state");

    let bind_addr = state.config.bind.clone();
    let cert_path = state.config.tls_cert.clone();
    let key_path = state.config.tls_key.clone();

    let app = CifraChatApp::new(Arc::clone(&state));
    let mut service = Service::new("CifraChat".to_string(), app);
    match (cert_path, key_path) {
        (Some(cert), Some(key)) => {
            let mut tls = TlsSettings::intermediate(&cert, &key).expect("tls");
            tls.enable_h2();
            service.add_tls_with_settings(&bind_addr, None, tls);
        }
        _ => {
            service.add_tcp(&bind_addr);
        }
    }

    let mut server = Server::new(None).expect("server");
    server.add_service(service);
    server.bootstrap();
    info!(address = %bind_addr, "cifrachat listening");
    server.run_forever();
}
