#![forbid(unsafe_code)]

pub mod api;
pub mod auth;
pub mod connection;
pub mod health;
pub mod http;
pub mod hub;
pub mod ingress;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;


#[cfg(test)]
mod connection_tests;
