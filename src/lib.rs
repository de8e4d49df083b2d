//! Disposable preview runtimes: fork a GitHub repository, provision a
//! sandbox, bring up its dev server, and report the preview URL.

pub mod config;
pub mod errors;
pub mod naming;
pub mod provision;
pub mod retry;
pub mod signals;
pub mod ui;
