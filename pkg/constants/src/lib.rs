//! Centralized constants for the kip project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod cloud;
pub mod registry;
pub mod volumes;
