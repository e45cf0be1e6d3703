pub mod account;
pub mod admin;
pub mod auth;
pub mod events;
pub mod metrics;
pub mod oauth;
