pub mod audit;
pub mod instance;
pub mod launch;
pub mod manager;
pub mod meta;
pub mod process;

#[cfg(test)]
pub(crate) mod test_util;
