pub mod fingerprint;
pub mod memory_store;
pub mod storage_service;
pub mod tus_service;
pub mod url_store;
