pub mod discovery;
pub mod extractor;
pub mod fetcher;

pub use discovery::{TableLayout, TableProxySource, parse_proxy_table};
pub use extractor::CssExtractor;
pub use fetcher::ReqwestFetcher;
