//! Fornecedor - structured profiling pipeline for Brazilian B2B companies.
//!
//! Runs each company through a four-stage pipeline: search-engine query,
//! official-site discovery via a language model, adaptive web scraping, and
//! model-driven extraction of a structured company profile. The two
//! model-bearing stages (discovery, profile) are drained from durable work
//! queues by long-running workers; search and scrape run synchronously
//! behind the HTTP facade.

pub mod cli;
pub mod config;
pub mod context;
pub mod llm;
pub mod models;
pub mod rate_limit;
pub mod repository;
pub mod scrapers;
pub mod search;
pub mod server;
pub mod services;
