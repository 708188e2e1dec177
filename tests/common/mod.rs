#![allow(dead_code)]

use httpmock::MockServer;
use registry_transfer::{RegistryClient, RegistryClientConfig};
use std::net::TcpListener;

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Config pointing at the mock server, with a short timeout
pub fn config_for(server: &MockServer) -> RegistryClientConfig {
    RegistryClientConfig::new(server.base_url()).with_timeout(5)
}

pub fn client(config: RegistryClientConfig) -> RegistryClient {
    RegistryClient::new(config).expect("client should build")
}

/// `WWW-Authenticate` value pointing at the mock token realm
pub fn bearer_challenge(server: &MockServer, scope: &str) -> String {
    format!(
        r#"Bearer realm="{}",service="registry.test",scope="{}""#,
        server.url("/token"),
        scope
    )
}
