//! labelgate
//!
//! Reconciles container-declared Cloudflare resources (DNS records, Tunnel
//! ingress rules, Access applications) against the Cloudflare API.
//!
//! Desired state comes from a local [`source::ContainerSource`] and from any
//! number of remote agents. The [`reconciler::Reconciler`] resolves conflicts,
//! drives the per-kind operators and retires orphaned resources recorded in
//! the [`ledger::Ledger`].

pub mod api;
pub mod clock;
pub mod cloudflare;
pub mod config;
pub mod ledger;
pub mod operator;
pub mod reconciler;
pub mod source;
pub mod types;
