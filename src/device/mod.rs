pub mod btle;
pub mod command;
pub mod constants;
pub mod scan;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
