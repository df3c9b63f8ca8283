//! OData v4 Web API backend for the subgrid engine.
//!
//! [`WebApiClient`] implements [`subgrid::EntityService`] over HTTP, reading
//! entity metadata from `EntityDefinitions` and records from entity sets.

pub mod client;
pub mod config;
pub mod error;
pub mod models;

pub use client::WebApiClient;
pub use config::WebApiConfig;
pub use error::{Result, WebApiError};
