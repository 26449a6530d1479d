// src/lib.rs

//! Provisions an ephemeral SSH identity and triggers a remote InSpec run
//! against a freshly deployed host, streaming its output back to the caller.

pub mod config;
pub mod error;
pub mod sys;
pub mod workflow;

pub use crate::config::VerifyConfig;
pub use crate::error::{Result, VerifyError};
pub use crate::workflow::InspecRun;
