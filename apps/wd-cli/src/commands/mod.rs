pub mod admin;
pub mod audit;
pub mod policy;
pub mod registry;
pub mod schedule;
