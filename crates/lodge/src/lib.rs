//! lodge: one isolated Linux account and one long-lived worker per external
//! identity, behind a privileged supervisor.

pub mod accounts;
pub mod config;
pub mod control;
pub mod db;
pub mod identity;
pub mod sessions;
pub mod supervisor;
pub mod tools;
pub mod worker;
