pub mod account;
pub mod delta;
pub mod token;
