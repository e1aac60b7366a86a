mod common;
mod proxy_tests;
mod record_tests;
