pub mod library;

pub use library::{
    casemap::Casemap,
    error::{Error, Result},
    io::{FdHandle, FdHooks, Interest, IoConfig, Reactor, TimerHandle},
    trie::{Canonize, TRIE_KEY_MAX, Trie},
};
