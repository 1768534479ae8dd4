//! Protocol dialect negotiation.
//!
//! Mirrors `enum l9p_version` from the FreeBSD 9P core: a connection starts
//! with no dialect chosen and settles on exactly one after `Tversion`.

use crate::fcall::{P92000, P92000L, P92000U};

/// The negotiated protocol dialect. `Unknown` never appears on a
/// negotiated connection — it is only ever the argument to
/// [`Dialect::from_version_string`] when the client's string is not
/// recognized, in which case `Rversion` replies with
/// [`crate::fcall::VERSION_UNKNOWN`] and the connection is closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dialect {
    P92000,
    P92000U,
    P92000L,
}

impl Dialect {
    pub fn from_version_string(s: &str) -> Option<Dialect> {
        match s {
            P92000L => Some(Dialect::P92000L),
            P92000U => Some(Dialect::P92000U),
            P92000 => Some(Dialect::P92000),
            _ => None,
        }
    }

    pub fn version_string(&self) -> &'static str {
        match self {
            Dialect::P92000 => P92000,
            Dialect::P92000U => P92000U,
            Dialect::P92000L => P92000L,
        }
    }

    /// Whether this dialect carries the `.u`/`.L` uid/gid/n_uname
    /// extensions on `Tauth`/`Tattach`, and numeric error codes instead of
    /// the classic `Rerror` string.
    pub fn has_unix_extensions(&self) -> bool {
        matches!(self, Dialect::P92000U | Dialect::P92000L)
    }

    /// Whether this dialect uses `Rlerror`'s numeric `ecode` rather than
    /// classic `Rerror`'s `ename` string.
    pub fn numeric_errors(&self) -> bool {
        matches!(self, Dialect::P92000L)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_strings() {
        for d in [Dialect::P92000, Dialect::P92000U, Dialect::P92000L] {
            assert_eq!(Dialect::from_version_string(d.version_string()), Some(d));
        }
    }

    #[test]
    fn rejects_unknown_strings() {
        assert_eq!(Dialect::from_version_string("9P3000"), None);
    }
}
