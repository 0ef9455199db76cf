// SPDX-License-Identifier: GPL-3.0-or-later
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("{service} unreachable: {detail}")]
    Unreachable { service: String, detail: String },
    #[error("{service} rejected our credentials")]
    Unauthorized { service: String },
    #[error("{service} refused access")]
    Forbidden { service: String },
    #[error("{service} answered with status {status}")]
    HttpStatus { service: String, status: u16 },
}

impl ConnectivityError {
    pub fn service(&self) -> &str {
        match self {
            Self::Unreachable { service, .. }
            | Self::Unauthorized { service }
            | Self::Forbidden { service }
            | Self::HttpStatus { service, .. } => service,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { .. } => Some(401),
            Self::Forbidden { .. } => Some(403),
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Unreachable { .. } => None,
        }
    }
}

/// Checks that every required upstream answers.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> Result<(), ConnectivityError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub service: String,
    pub url: String,
    pub bearer_token: Option<String>,
}

pub struct HttpConnectivityProbe {
    client: Client,
    targets: Vec<ProbeTarget>,
}

impl HttpConnectivityProbe {
    pub fn new(client: Client, targets: Vec<ProbeTarget>) -> Self {
        Self { client, targets }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    /// Stops at the first failing target.
    async fn check(&self) -> Result<(), ConnectivityError> {
        for target in &self.targets {
            let mut request = self.client.get(&target.url);
            if let Some(token) = &target.bearer_token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await.map_err(|e| ConnectivityError::Unreachable {
                service: target.service.clone(),
                detail: e.to_string(),
            })?;
            match response.status() {
                StatusCode::UNAUTHORIZED => {
                    return Err(ConnectivityError::Unauthorized {
                        service: target.service.clone(),
                    })
                }
                StatusCode::FORBIDDEN => {
                    return Err(ConnectivityError::Forbidden {
                        service: target.service.clone(),
                    })
                }
                status if status.is_server_error() => {
                    return Err(ConnectivityError::HttpStatus {
                        service: target.service.clone(),
                        status: status.as_u16(),
                    })
                }
                status => {
                    debug!(target: "connectivity", service = %target.service, status = status.as_u16(), "upstream reachable");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(server: &MockServer, service: &str, route: &str) -> ProbeTarget {
        ProbeTarget {
            service: service.to_string(),
            url: format!("{}{}", server.uri(), route),
            bearer_token: Some("key".into()),
        }
    }

    #[tokio::test]
    async fn all_targets_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .and(header("authorization", "Bearer key"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let probe = HttpConnectivityProbe::new(Client::new(), vec![target(&server, "debrid", "/user")]);
        assert!(probe.check().await.is_ok());
    }

    #[tokio::test]
    async fn auth_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/library"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let probe = HttpConnectivityProbe::new(Client::new(), vec![target(&server, "debrid", "/user")]);
        let err = probe.check().await.unwrap_err();
        assert_eq!(err, ConnectivityError::Unauthorized { service: "debrid".into() });
        assert_eq!(err.status_code(), Some(401));

        let probe = HttpConnectivityProbe::new(Client::new(), vec![target(&server, "plex", "/library")]);
        assert_eq!(probe.check().await.unwrap_err().service(), "plex");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connection_error() {
        let probe = HttpConnectivityProbe::new(
            Client::new(),
            vec![ProbeTarget {
                service: "debrid".into(),
                url: "http://127.0.0.1:9/".into(),
                bearer_token: None,
            }],
        );
        assert!(matches!(
            probe.check().await,
            Err(ConnectivityError::Unreachable { .. })
        ));
    }
}
