use crate::{
    config::HttpConfig,
    error::{Error, Result},
    transport::Transport,
};
use async_trait::async_trait;
use reqwest::{
    header::{HeaderValue, CONTENT_TYPE, USER_AGENT},
    Client,
};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

/// JSON-RPC over HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: Url,
    client: Client,
}

impl HttpTransport {
    pub fn new(url: Url) -> Result<Self> {
        Self::with_config(url, HttpConfig::default())
    }

    pub fn with_config(url: Url, config: HttpConfig) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(Error::UnsupportedEndpoint(format!(
                    "{scheme}:// is not an HTTP endpoint"
                )))
            }
        }

        let mut headers = config.headers;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(agent) = HeaderValue::from_str(&format!("conflux-web {}", env!("CARGO_PKG_VERSION"))) {
            headers.entry(USER_AGENT).or_insert(agent);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { url, client })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, payload: Value) -> Result<Value> {
        trace!("POST {} {}", self.url, payload);
        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let body = response.json::<Value>().await?;
        debug!("Received response from {}", self.url);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpTransport::new(Url::parse("http://127.0.0.1:12537").unwrap()).is_ok());
        assert!(matches!(
            HttpTransport::new(Url::parse("ws://127.0.0.1:12535").unwrap()),
            Err(Error::UnsupportedEndpoint(_))
        ));
    }
}
