pub mod activity;
pub mod auth;
pub mod backup;
pub mod core;
pub mod courses;
pub mod enrollment;
pub mod grades;
pub mod payments;
pub mod setup;
