//! Fleet Payroll library crate.
//!
//! This crate exposes the monthly payroll pipeline of the fleet
//! application as reusable modules.  A monthly trigger is fanned out
//! into one job per organisation ([`scheduler`]); each organisation
//! job ([`job`]) aggregates the month's attendance ([`aggregate`]),
//! prices drivers and service providers ([`rules`]) and commits the
//! result atomically ([`store`]).  Jobs run on a retrying worker pool
//! ([`queue`]) and can be triggered and inspected over HTTP
//! ([`api`]).

pub mod aggregate;
pub mod api;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod models;
pub mod queue;
pub mod rules;
pub mod scheduler;
pub mod store;
