pub mod backup;
pub mod core;
pub mod grading;
pub mod notify;
pub mod reports;
pub mod session;
pub mod setup;
pub mod sheets;
pub mod users;
