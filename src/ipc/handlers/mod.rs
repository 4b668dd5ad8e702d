pub mod analytics;
pub mod attendance;
pub mod backup;
pub mod core;
pub mod exports;
pub mod grid;
pub mod groups;
pub mod marks;
pub mod notify;
pub mod setup;
pub mod students;
