//! Key canonicalizers for the trie and case-mapped comparison.
//!
//! Folding goes to upper case. The rfc1459 map additionally treats `[]\~` as
//! the same characters as `{}|^`.

use crate::library::trie::Canonize;
use std::cmp::Ordering;

const fn build_map(rfc1459: bool, fold: bool) -> [u8; 256] {
    let mut map = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        map[i] = if fold {
            (i as u8).to_ascii_uppercase()
        } else {
            i as u8
        };
        i += 1;
    }
    if rfc1459 {
        map[b'[' as usize] = b'{';
        map[b']' as usize] = b'}';
        map[b'\\' as usize] = b'|';
        map[b'~' as usize] = b'^';
    }
    map
}

static NULL_CASEMAP: [u8; 256] = build_map(false, false);
static ASCII_CASEMAP: [u8; 256] = build_map(false, true);
static RFC1459_CASEMAP: [u8; 256] = build_map(true, true);

#[inline(always)]
fn apply(map: &[u8; 256], key: &mut [u8]) {
    for byte in key.iter_mut() {
        *byte = map[*byte as usize];
    }
}

pub fn null_canonize(_key: &mut [u8]) {}

pub fn ascii_canonize(key: &mut [u8]) {
    apply(&ASCII_CASEMAP, key);
}

pub fn rfc1459_canonize(key: &mut [u8]) {
    apply(&RFC1459_CASEMAP, key);
}

fn mapcmp(a: &[u8], b: &[u8], map: &[u8; 256]) -> Ordering {
    let a = a.iter().map(|c| map[*c as usize]);
    let b = b.iter().map(|c| map[*c as usize]);
    a.cmp(b)
}

pub fn casecmp(a: &[u8], b: &[u8]) -> Ordering {
    Casemap::Ascii.compare(a, b)
}

pub fn irccmp(a: &[u8], b: &[u8]) -> Ordering {
    Casemap::Rfc1459.compare(a, b)
}

/// The casemappings a server can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Casemap {
    Null,
    Ascii,
    #[default]
    Rfc1459,
}

impl Casemap {
    /// ISUPPORT CASEMAPPING token.
    pub fn as_str(self) -> &'static str {
        match self {
            Casemap::Null => "null",
            Casemap::Ascii => "ascii",
            Casemap::Rfc1459 => "rfc1459",
        }
    }

    pub fn canonizer(self) -> Canonize {
        match self {
            Casemap::Null => null_canonize,
            Casemap::Ascii => ascii_canonize,
            Casemap::Rfc1459 => rfc1459_canonize,
        }
    }

    /// Orders two names the way this casemapping sees them.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        mapcmp(a, b, self.table())
    }

    pub fn table(self) -> &'static [u8; 256] {
        match self {
            Casemap::Null => &NULL_CASEMAP,
            Casemap::Ascii => &ASCII_CASEMAP,
            Casemap::Rfc1459 => &RFC1459_CASEMAP,
        }
    }
}
