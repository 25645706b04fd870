#![crate_name = "feectl_client"]

//! Clients for the services the fee policy control plane talks to.

#![forbid(unsafe_code)]
#![allow(bare_trait_objects)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

mod convert;
/// LND REST node client
pub mod lnd_rest;
/// Webhook alerts
pub mod webhook;

pub use self::lnd_rest::{NodeClientConfig, RestNodeClient};
pub use self::webhook::{WebhookConfig, WebhookNotifier};
