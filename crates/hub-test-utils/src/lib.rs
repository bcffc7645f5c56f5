//! # Hub Test Utilities
//!
//! Shared test utilities for the Telemetry Hub.
//!
//! This crate provides:
//! - Server test harness (`TestHubServer` for E2E tests)
//! - Scriptable telemetry source (`MockSource`)
//! - In-memory bridge sink (`MemorySink`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hub_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<()> {
//!     let server = TestHubServer::spawn().await?;
//!     server.orchestrator().register_service("reply_bot").await?;
//!
//!     let response = reqwest::get(format!("{}/metrics", server.url())).await?;
//!     assert_eq!(response.status(), 200);
//!
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod memory_sink;
pub mod mock_source;
pub mod server_harness;

// Re-export commonly used items
pub use memory_sink::*;
pub use mock_source::*;
pub use server_harness::*;
