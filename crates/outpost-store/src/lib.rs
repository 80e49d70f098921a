//! Encrypted-at-rest settings storage over SQLite. Values are sealed under
//! the database-domain cipher before they reach the writer; plaintext never
//! touches disk.

pub mod settings_store;
