//! Integration tests for stagehouse

mod manager_tests;
mod storage_tests;
mod sync_tests;
