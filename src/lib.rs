// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Statecraft
//!
//! A declarative, idempotent deployment orchestrator. A network file lists
//! resources (machines, volumes, key pairs, security groups, DNS records);
//! statecraft creates them in dependency order against provider APIs, builds
//! and activates machine configurations over SSH, and keeps everything it
//! learns in a transactional local state store.
//!
//! ## Architecture
//!
//! 1. **Definitions**: compiled from `statecraft.yaml` on every evaluation
//! 2. **Resources**: persisted per deployment, reconciled toward their
//!    definitions by `create` and toward reality by `check`
//! 3. **Engine**: runs each phase through a dependency-ordered scheduler;
//!    one failed resource never stops unrelated ones
//!
//! ## Modules
//!
//! - [`config`]: network file parsing, validation, settings, credentials
//! - [`state`]: transactional state store, typed attributes, deployment locks
//! - [`resource`]: resource model and the built-in resource types
//! - [`provider`]: provider API trait and the REST client
//! - [`remote`]: remote command execution and artifact copying
//! - [`build`]: build collaborator producing machine artifacts
//! - [`scheduler`]: worker pool and dependency graph execution
//! - [`engine`]: deployment workflows
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```yaml
//! deployment:
//!   name: web-stack
//!
//! providers:
//!   default:
//!     endpoint: https://api.cloud.example/v1
//!
//! build:
//!   command: ./build.sh
//!
//! resources:
//!   - name: deployer
//!     type: keypair
//!     public_key: ssh-ed25519 AAAA...
//!   - name: web
//!     type: vm
//!     region: eu-1
//!     instance_type: small
//!     image: base-24
//!     keypair: deployer
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod build;
pub mod cli;
pub mod config;
pub mod confirm;
pub mod engine;
pub mod error;
pub mod poll;
pub mod provider;
pub mod remote;
pub mod resource;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, DefinitionHasher, NetworkSpec, Settings};
pub use engine::{Collaborators, DeployOptions, Deployment, Filter};
pub use error::{DeployError, Result};
pub use resource::{Definition, Resource, ResourceRegistry, ResourceState};
pub use scheduler::{DependencyGraph, run_tasks};
pub use state::{DeploymentLock, StateDb};
