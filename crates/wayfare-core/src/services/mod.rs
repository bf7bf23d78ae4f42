//! Shared service layer used across clients.

mod database;

pub use database::DatabaseService;
