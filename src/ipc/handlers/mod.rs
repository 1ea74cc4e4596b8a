pub mod assignments;
pub mod auth;
pub mod backup_exchange;
pub mod choices;
pub mod core;
pub mod documents;
pub mod internships;
pub mod notifications;
pub mod projects;
pub mod setup;
pub mod students;
pub mod supervision;
pub mod teachers;
