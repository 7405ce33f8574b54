//! # toolbridge
//!
//! Talk to a tool worker process over stdin/stdout with concurrent,
//! correlated JSON request/response calls, and drive it from a small
//! protein-analysis assistant.
//!
//! ## Usage
//!
//! ```bash
//! toolbridge serve [--debug-tools]
//! toolbridge call get_protein_data --params '{"identifier":"P01308"}'
//! toolbridge ask "What does P00533 do?"
//! ```
//!
//! ## Modules
//!
//! - `worker` - Worker process supervision and the correlated call transport
//! - `server` - The worker side: a stdio tool server and its tools
//! - `catalog` - Declared tools and argument validation
//! - `llm` - Text generation over OpenAI-compatible APIs
//! - `lookup` - Protein database lookups (UniProt)
//! - `agent` - Plan, call tools and reply in a conversation
//! - `config` - TOML configuration file
//! - `error` - Unified error type with numeric codes
pub mod agent;
pub mod catalog;
pub mod config;
pub mod error;
pub mod llm;
pub mod lookup;
pub mod server;
pub mod worker;
