//! End-to-end protocol tests for the sqwire-mysql driver.
//!
//! Instead of a live database these tests register an in-memory transport
//! through the dial registry and script the server side of every exchange
//! byte for byte.
#[cfg(test)]
mod test;
