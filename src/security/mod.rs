pub mod audit_log;
pub mod credential_store;
pub mod token_refresh;
pub mod vault_client;
