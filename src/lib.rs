//! # catalog-sync
//!
//! Incremental content acquisition for video-catalog websites.
//!
//! Four kinds of origin site (a WordPress-style REST catalog, a
//! sitemap-only site, a plain HTML site and a members-only site) are reduced
//! to one canonical item model and synchronized into a local store by delta
//! cursors. Every outbound URL passes a domain allow-list and an
//! HTTPS-only check first.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Adapters         │──▶│  Markup /  │──▶│ Orchestrator │──▶│  SQLite  │
//! │ API/Sitemap/     │   │  CDN       │   │ delta cursor │   │  items   │
//! │ Scrape/Auth      │   └────────────┘   └──────┬───────┘   │  health  │
//! └────────┬─────────┘                           │           └──────────┘
//!          │            ┌──────────────┐         ▼
//!          └───────────▶│ SecurityGate │   HealthTracker
//!                       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! catsync init                  # create database
//! catsync sync all              # delta-sync every configured source
//! catsync sync scraped_catalog --full
//! catsync health --json
//! catsync resolve https://namakade.com/movies/the-last-night --player
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Source identities and canonical items |
//! | [`error`] | Error taxonomy and `ScrapeResult` |
//! | [`security`] | Domain allow-list and HTTPS enforcement |
//! | [`http`] | Gate-checked HTTP fetcher |
//! | [`markup`] | HTML parsers and extraction chains |
//! | [`cdn`] | Media CDN URL builder |
//! | [`connector_api`] | REST catalog adapter |
//! | [`connector_sitemap`] | Sitemap adapter |
//! | [`connector_scrape`] | HTML scraping adapter |
//! | [`connector_auth`] | Authenticated scraping adapter |
//! | [`session`] / [`credentials`] | Login session and credential storage |
//! | [`traits`] | `SourceAdapter` trait and registry |
//! | [`ingest`] | Sync orchestrator |
//! | [`health`] | Per-source health tracking |
//! | [`resolve`] | Page URL to playable media URL |
//! | [`store`] | Store contracts with SQLite and in-memory backends |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cdn;
pub mod config;
pub mod connector_api;
pub mod connector_auth;
pub mod connector_scrape;
pub mod connector_sitemap;
pub mod credentials;
pub mod db;
pub mod error;
pub mod get;
pub mod health;
pub mod http;
pub mod ingest;
pub mod markup;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod resolve;
pub mod security;
pub mod session;
pub mod sources;
pub mod stats;
pub mod store;
pub mod traits;
