#![forbid(unsafe_code)]

pub mod cli;
pub mod error;
pub mod extract;
pub mod routes;
pub mod server;
