pub mod analysis;
pub mod bootstrap;
pub mod commands;
pub mod meeting_runner;
pub mod progression;
