pub mod api;
pub mod config;
pub mod console;
pub mod controller;
pub mod crash;
pub mod error;
pub mod nat_gateway;
pub mod port_probe;
pub mod process_supervisor;
pub mod roster;
pub mod stats;

mod support;
