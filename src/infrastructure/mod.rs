pub mod analysis_client;
pub mod config;
pub mod decision_repository;
pub mod error;
pub mod storage;
pub mod transcript;
