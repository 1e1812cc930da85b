pub mod audit_log;
pub mod cache_strategy;
