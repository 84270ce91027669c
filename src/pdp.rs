use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PdpConfig;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdpAction {
    Query,
    Demand,
    Update,
    Close,
    Claim,
    Reclaim,
    Ticket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdpResourceType {
    Delegation,
    User,
    Slice,
    Sliver,
    Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdpRequest {
    pub action: PdpAction,
    pub resource_type: PdpResourceType,
    pub actor_guid: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdpDecision {
    pub allow: bool,
    pub message: String,
}

/// External authorization endpoint (spec §6 `pdp.enable`/`pdp.url`), treated
/// as a black-box decision function (spec §1). Every inbound user-origin
/// command is wrapped in a decision request; on deny the command is
/// rejected with the decision's message as an `Error::Unauthorized`.
#[async_trait]
pub trait PdpClient: Send + Sync {
    async fn decide(&self, request: PdpRequest) -> Result<PdpDecision, Error>;
}

/// Used when `pdp.enable = false`: every request is allowed without a
/// network round trip.
pub struct AlwaysAllow;

#[async_trait]
impl PdpClient for AlwaysAllow {
    async fn decide(&self, _request: PdpRequest) -> Result<PdpDecision, Error> {
        Ok(PdpDecision { allow: true, message: "pdp disabled".to_string() })
    }
}

/// HTTP-backed PDP client used when `pdp.enable = true`.
pub struct HttpPdpClient {
    client: reqwest::Client,
    url: String,
}

impl HttpPdpClient {
    pub fn new(config: &PdpConfig) -> Result<Self, Error> {
        let url = config.url.clone().ok_or_else(|| Error::InvalidRequest("pdp.enable=true requires pdp.url".to_string()))?;
        Ok(HttpPdpClient { client: reqwest::Client::new(), url })
    }
}

#[async_trait]
impl PdpClient for HttpPdpClient {
    async fn decide(&self, request: PdpRequest) -> Result<PdpDecision, Error> {
        let response = self.client.post(&self.url).json(&request).send().await.map_err(|e| Error::TransportError(format!("pdp request failed: {e}")))?;
        response.json::<PdpDecision>().await.map_err(|e| Error::TransportError(format!("pdp response malformed: {e}")))
    }
}

/// Builds the configured PDP client: `AlwaysAllow` when disabled, otherwise
/// the HTTP client against `pdp.url`.
pub fn build_pdp_client(config: &PdpConfig) -> Result<Box<dyn PdpClient>, Error> {
    if config.enable {
        Ok(Box::new(HttpPdpClient::new(config)?))
    } else {
        Ok(Box::new(AlwaysAllow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_allow_never_denies() {
        let client = AlwaysAllow;
        let decision = client
            .decide(PdpRequest { action: PdpAction::Ticket, resource_type: PdpResourceType::Sliver, actor_guid: "orchestrator-1".to_string(), auth_token: None })
            .await
            .unwrap();
        assert!(decision.allow);
    }

    #[test]
    fn disabled_pdp_config_builds_always_allow() {
        let config = PdpConfig { enable: false, url: None };
        let client = build_pdp_client(&config);
        assert!(client.is_ok());
    }

    #[test]
    fn enabled_pdp_without_url_is_rejected() {
        let config = PdpConfig { enable: true, url: None };
        assert!(matches!(build_pdp_client(&config), Err(Error::InvalidRequest(_))));
    }
}
