pub mod classes;
pub mod core;
pub mod promotion;
pub mod rules;
pub mod setup;
pub mod students;
