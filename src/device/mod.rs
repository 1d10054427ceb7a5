pub mod btle;
pub mod codec;
pub mod connection;
pub mod constants;
pub mod dispatcher;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;
