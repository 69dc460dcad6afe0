//! EcoVault Backend Library
//!
//! Core modules for the EcoVault backend server: submission verification,
//! wallet ledger, cashout state machine, and their collaborator boundaries.

pub mod app_state;
pub mod auth;
pub mod cashout_service;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod geo;
pub mod handlers;
pub mod media;
pub mod models;
pub mod routes;
pub mod storage;
pub mod submission_service;
pub mod verification_worker;
pub mod wallet_service;
