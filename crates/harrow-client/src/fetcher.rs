use std::time::Duration;

use harrow_core::error::AppError;
use harrow_core::models::Proxy;
use harrow_core::traits::PageFetcher;
use moka::future::Cache;
use reqwest::{Client, StatusCode};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

const MAX_PROXY_CLIENTS: u64 = 1024;
const PROXY_CLIENT_IDLE: Duration = Duration::from_secs(600);

/// HTTP fetcher using reqwest, optionally routed through a proxy.
///
/// Failures are classified for the retry loop: anything that points at the
/// route (connect failures, resets, timeouts, a proxy refusing the tunnel)
/// is transient, a non-2xx answer from the target is [`AppError::HttpError`].
///
/// One client, with its connection pool, is kept per proxy endpoint and
/// dropped after it sits idle.
#[derive(Clone)]
pub struct ReqwestFetcher {
    direct: Client,
    proxied: Cache<String, Client>,
    user_agent: String,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: impl Into<String>) -> Result<Self, AppError> {
        let user_agent = user_agent.into();
        let direct = Client::builder()
            .user_agent(&user_agent)
            .no_proxy()
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;
        let proxied = Cache::builder()
            .max_capacity(MAX_PROXY_CLIENTS)
            .time_to_idle(PROXY_CLIENT_IDLE)
            .build();
        Ok(Self {
            direct,
            proxied,
            user_agent,
        })
    }

    async fn client_for(&self, proxy: Option<&Proxy>) -> Result<Client, AppError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        self.proxied
            .try_get_with(proxy.endpoint.clone(), async {
                self.build_proxied(&proxy.endpoint)
            })
            .await
            .map_err(|e| (*e).clone())
    }

    fn build_proxied(&self, endpoint: &str) -> Result<Client, AppError> {
        let route = reqwest::Proxy::all(endpoint)
            .map_err(|e| AppError::ProxyError(format!("Invalid proxy {endpoint}: {e}")))?;
        Client::builder()
            .user_agent(&self.user_agent)
            .proxy(route)
            .build()
            .map_err(|e| AppError::ProxyError(format!("Client for {endpoint}: {e}")))
    }
}

fn classify_error(e: reqwest::Error, proxy: Option<&Proxy>, timeout: Duration) -> AppError {
    if e.is_timeout() {
        return AppError::Timeout(timeout.as_secs());
    }
    match proxy {
        Some(p) if e.is_connect() => {
            AppError::ProxyError(format!("Connection via {} failed: {e}", p.endpoint))
        }
        None if e.is_connect() => AppError::NetworkError(format!("Connection failed: {e}")),
        _ if e.is_request() || e.is_body() => AppError::NetworkError(e.to_string()),
        _ => AppError::HttpError(e.to_string()),
    }
}

impl PageFetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> Result<String, AppError> {
        let client = self.client_for(proxy).await?;

        let response = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_error(e, proxy, timeout))?;

        let status = response.status();
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED && proxy.is_some() {
            return Err(AppError::ProxyError(format!(
                "HTTP {} from proxy",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| classify_error(e, proxy, timeout))
    }
}
