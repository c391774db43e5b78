pub mod ledger;
pub mod models;
pub mod popup;
pub mod schedule;
