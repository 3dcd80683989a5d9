pub mod gridstore;
pub mod spatialmatch;
