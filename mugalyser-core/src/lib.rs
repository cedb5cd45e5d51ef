#![doc = "mugalyser-core: core logic library for mugalyser."]

//! This crate holds the ingestion and reporting logic for mugalyser: the Meetup API
//! client and its pagination engine, batch auditing, the aggregation-pipeline builder,
//! the document stores and the canned reports.
//!
//! # Usage
//! Wire an [`contract::EntitySource`] (usually [`meetup::MeetupApi`] over
//! [`fetch::HttpFetcher`]) and a [`contract::DocumentStore`] ([`sqlite::SqliteStore`]
//! on disk, or [`store::MemoryStore`] in tests) into an [`ingest::Ingestor`], then query
//! completed batches through [`reports::Reports`].

pub mod agg;
pub mod audit;
pub mod config;
pub mod contract;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod meetup;
pub mod paginate;
pub mod reports;
pub mod reshape;
pub mod sqlite;
pub mod store;

pub use error::{Error, Result};
