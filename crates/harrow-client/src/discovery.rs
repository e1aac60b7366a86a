//! Proxy discovery from public HTML proxy lists.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use harrow_core::error::AppError;
use harrow_core::models::{NewProxy, ProxyScheme};
use harrow_core::traits::{PageFetcher, ProxySource};
use scraper::{ElementRef, Html, Selector};

/// Where the address, port and HTTPS flag live in a proxy list table.
#[derive(Debug, Clone)]
pub struct TableLayout {
    /// One match per proxy.
    pub row_selector: String,
    /// Cell holding the IP, or `ip:port` when `port_selector` is `None`.
    pub address_selector: String,
    pub port_selector: Option<String>,
    /// Cell reading `yes` for HTTPS-capable proxies. Without it every
    /// proxy is plain HTTP.
    pub https_selector: Option<String>,
}

impl TableLayout {
    /// free-proxy-list.net: IP, port and an `hx` (HTTPS) column.
    pub fn free_proxy_list() -> Self {
        Self {
            row_selector: "#proxylisttable > tbody > tr".into(),
            address_selector: "td:nth-child(1)".into(),
            port_selector: Some("td:nth-child(2)".into()),
            https_selector: Some("td.hx".into()),
        }
    }

    /// ip-adress.com: `ip:port` in the first column, HTTP only.
    pub fn ip_adress() -> Self {
        Self {
            row_selector: ".htable > tbody > tr".into(),
            address_selector: "td:first-child".into(),
            port_selector: None,
            https_selector: None,
        }
    }
}

/// A [`ProxySource`] that scrapes one HTML table of proxies.
pub struct TableProxySource<F: PageFetcher> {
    name: String,
    url: String,
    layout: TableLayout,
    fetcher: F,
    timeout: Duration,
}

impl<F: PageFetcher> TableProxySource<F> {
    pub fn new(name: impl Into<String>, url: impl Into<String>, layout: TableLayout, fetcher: F) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            layout,
            fetcher,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn free_proxy_list(fetcher: F) -> Self {
        Self::new(
            "free-proxy-list.net",
            "https://free-proxy-list.net/",
            TableLayout::free_proxy_list(),
            fetcher,
        )
    }

    pub fn ip_adress(fetcher: F) -> Self {
        Self::new(
            "ip-adress.com",
            "http://www.ip-adress.com/proxy_list/",
            TableLayout::ip_adress(),
            fetcher,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl<F: PageFetcher> ProxySource for TableProxySource<F> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<NewProxy>, AppError> {
        let html = self.fetcher.fetch(&self.url, None, self.timeout).await?;
        let proxies = parse_proxy_table(&html, &self.layout, &self.url)?;
        tracing::debug!(source = %self.name, count = proxies.len(), "Parsed proxy list");
        Ok(proxies)
    }
}

fn selector(s: &str) -> Result<Selector, AppError> {
    Selector::parse(s).map_err(|e| AppError::ConfigError(format!("Invalid selector '{s}': {e}")))
}

fn cell_text(row: ElementRef<'_>, selector: &Selector) -> Option<String> {
    row.select(selector)
        .next()
        .map(|cell| cell.text().collect::<String>().trim().to_string())
}

/// Parse proxy rows, dropping rows without a valid IP and port and
/// duplicates within the page.
pub fn parse_proxy_table(html: &str, layout: &TableLayout, source: &str) -> Result<Vec<NewProxy>, AppError> {
    let document = Html::parse_document(html);
    let rows = selector(&layout.row_selector)?;
    let address = selector(&layout.address_selector)?;
    let port = layout.port_selector.as_deref().map(selector).transpose()?;
    let https = layout.https_selector.as_deref().map(selector).transpose()?;

    let mut seen = BTreeSet::new();
    let mut proxies = Vec::new();

    for row in document.select(&rows) {
        let Some(addr) = cell_text(row, &address) else {
            continue;
        };
        let host_port = match &port {
            Some(port) => match cell_text(row, port) {
                Some(p) => format!("{addr}:{p}"),
                None => continue,
            },
            None => addr,
        };
        let Some((ip, port_str)) = host_port.rsplit_once(':') else {
            continue;
        };
        if ip.parse::<IpAddr>().is_err() || port_str.parse::<u16>().is_err() {
            continue;
        }

        let scheme = match &https {
            Some(sel) if cell_text(row, sel).is_some_and(|v| v.eq_ignore_ascii_case("yes")) => {
                ProxyScheme::Https
            }
            _ => ProxyScheme::Http,
        };
        let endpoint = format!("http://{ip}:{port_str}");
        if seen.insert((endpoint.clone(), scheme)) {
            proxies.push(NewProxy::new(endpoint, scheme, source));
        }
    }

    Ok(proxies)
}
