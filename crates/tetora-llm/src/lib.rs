//! Tetora LLM - provider abstraction
//!
//! This crate provides LLM execution backends for Tetora:
//! - Provider: the execution trait shared by all backends
//! - Cli: subprocess providers (Claude CLI and compatible binaries)
//! - Http: OpenAI-compatible chat completion endpoints
//! - Registry: named provider lookup built from configuration

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod error;
pub mod http;
pub mod provider;
pub mod registry;

pub use cli::{CliProvider, CliProviderConfig};
pub use error::{Error, Result};
pub use http::{HttpProvider, HttpProviderConfig, ModelPricing};
pub use provider::{MockProvider, Provider, ProviderRequest, ProviderResponse};
pub use registry::ProviderRegistry;
