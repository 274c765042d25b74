// ABOUTME: Library crate for mcp-gateway exposing the routing core for embedding and testing

#![allow(missing_docs)]

pub mod cli;
pub mod config;
pub mod gateway;
