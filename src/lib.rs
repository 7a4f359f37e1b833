//! Repocast library - fleet-wide repository file synchronization.
//!
//! Copies files and directory trees from a template ("source") repository
//! into many target repositories, opening a pull request per target with the
//! transformed content. The engine lives in [`sync`]; everything it talks to
//! on the outside — the forge, git, state discovery, transformation, message
//! generation — is a trait with a subprocess-backed default implementation.

pub mod ai;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod exclusion;
pub mod forge;
pub mod git;
pub mod retry;
pub mod state;
pub mod sync;
pub mod transform;
pub mod tree;
