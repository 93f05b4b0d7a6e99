pub mod channel;
pub mod device;
pub mod locator;
pub mod parse;
pub mod paths;
pub mod process;
pub mod runner;

#[cfg(test)]
pub mod testing;
