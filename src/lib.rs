pub mod cluster;
pub mod command;
pub mod config;
pub mod fsm;
pub mod http;
pub mod leader;
pub mod peers;
pub mod raft;
pub mod version;
