pub mod analytics;
pub mod assessments;
pub mod classes;
pub mod core;
pub mod fees;
pub mod reports;
pub mod results;
pub mod students;
