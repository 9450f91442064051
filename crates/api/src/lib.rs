pub mod auth;
pub mod blob;
pub mod customers;
pub mod orders;
pub mod progress;
pub mod schema;
pub mod stages;
