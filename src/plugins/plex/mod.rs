pub mod catalog;
pub mod cli;
pub mod driver;
pub mod types;
