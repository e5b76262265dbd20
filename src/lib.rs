//! # agent-stack
//!
//! Provisions and tears down a supervisor/collaborator agent deployment on a
//! managed cloud platform.
//!
//! This library provides:
//! - Idempotent adapters for every resource the deployment needs
//! - A deployment state machine that resumes where a failed run stopped
//! - A result-collecting teardown that is safe to repeat
//! - The weather, stock and news collaborator handlers
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐      ┌──────────────┐
//!   │ Orchestrator │      │   Cleanup    │
//!   └──────┬───────┘      └──────┬───────┘
//!          └──────────┬──────────┘
//!                     ▼
//!            ┌─────────────────┐     DeploymentContext
//!            │    Adapters     │◄──  (config, identity, names)
//!            └────────┬────────┘
//!                     ▼
//!            ┌─────────────────┐
//!            │  ControlPlane   │  simulator | cloud (feature "aws")
//!            └─────────────────┘
//! ```
//!
//! ## Modules
//! - `config`, `models`: environment configuration and the model catalog
//! - `names`, `context`: resource names and the per-process deployment context
//! - `provider`: raw control-plane traits and backends
//! - `adapters`: create-or-update and delete per resource family
//! - `orchestrator`, `cleanup`: deployment and teardown
//! - `collaborators`: collaborator catalog and function handlers

pub mod adapters;
pub mod cleanup;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod names;
pub mod orchestrator;
pub mod package;
pub mod policy;
pub mod provider;
pub mod wait;

pub use cleanup::{CleanupCoordinator, CleanupReport};
pub use config::Config;
pub use context::DeploymentContext;
pub use error::{ApiError, ProvisionError};
pub use orchestrator::{DeployError, DeployStage, DeploymentPlan, DeploymentReport, Orchestrator};
