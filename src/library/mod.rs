pub mod casemap;
pub mod error;
pub mod io;
pub mod network;
pub mod trie;
pub mod utils;
