pub mod cli;
pub mod routes;
pub mod ws;
