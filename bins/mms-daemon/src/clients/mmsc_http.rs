use async_trait::async_trait;
use log::debug;
use mms_core::config::TransactionSettings;
use mms_core::error::CoreError;
use mms_core::transport::MmsTransport;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Proxy, Response};
use std::time::Duration;

const MMS_MIME: &str = "application/vnd.wap.mms-message";
const DEFAULT_PROXY_PORT: u16 = 80;

/// Talks to the MMSC over HTTP, through the configured WAP proxy when one
/// is set for the transaction.
pub struct MmscHttpClient {
    timeout: Duration,
    direct: reqwest::Client,
}

impl MmscHttpClient {
    pub fn new(timeout_secs: u64) -> Result<Self, CoreError> {
        let timeout = Duration::from_secs(timeout_secs);
        let direct = Self::builder(timeout)
            .build()
            .map_err(|_| CoreError::Transport("client".to_string()))?;
        Ok(Self { timeout, direct })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
    }

    fn client_for(&self, settings: &TransactionSettings) -> Result<reqwest::Client, CoreError> {
        if !settings.is_proxy_set() {
            return Ok(self.direct.clone());
        }
        let address = settings.proxy_address.as_deref().unwrap_or_default().trim();
        let port = settings.proxy_port.unwrap_or(DEFAULT_PROXY_PORT);
        let proxy = Proxy::all(format!("http://{}:{}", address, port))
            .map_err(|_| CoreError::Transport("proxy".to_string()))?;
        Self::builder(self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|_| CoreError::Transport("client".to_string()))
    }

    async fn read_body(resp: Response, label: &str) -> Result<Vec<u8>, CoreError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Transport(format!("{} http {}", label, status)));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| CoreError::Transport(format!("{} body: {}", label, err)))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl MmsTransport for MmscHttpClient {
    async fn get(&self, settings: &TransactionSettings, url: &str) -> Result<Vec<u8>, CoreError> {
        debug!("GET {}", url);
        let resp = self
            .client_for(settings)?
            .get(url)
            .header(ACCEPT, MMS_MIME)
            .send()
            .await
            .map_err(|err| CoreError::Transport(format!("get: {}", err)))?;
        Self::read_body(resp, "get").await
    }

    async fn post(
        &self,
        settings: &TransactionSettings,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, CoreError> {
        debug!("POST {} ({} bytes)", settings.mmsc_url, body.len());
        let resp = self
            .client_for(settings)?
            .post(&settings.mmsc_url)
            .header(CONTENT_TYPE, MMS_MIME)
            .header(ACCEPT, MMS_MIME)
            .body(body)
            .send()
            .await
            .map_err(|err| CoreError::Transport(format!("post: {}", err)))?;
        Self::read_body(resp, "post").await
    }
}
