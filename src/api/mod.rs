//! Broker API: raw endpoints, the HTTP implementation and the retrying client.

mod broker;
mod client;
mod http;
mod retry;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::MarketApiClient;
pub use http::HttpBroker;
pub use retry::{RetryFailure, RetryPolicy};
pub use types::*;

#[cfg(test)]
pub(crate) use retry::BackoffKind;
