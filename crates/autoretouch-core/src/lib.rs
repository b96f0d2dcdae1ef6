//! Client library for the autoRetouch image processing API: device-flow
//! authentication with persisted credentials, the REST gateway and batch
//! processing helpers.

pub mod api;
pub mod auth;
pub mod config;
pub mod services;
