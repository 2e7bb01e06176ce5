//! Named data end-points.

use std::fmt;

/// A named, typed data sink or source on a device.
///
/// `name` is a slash-prefixed identifier (`/adc`), unique per device; it is
/// the key by which run-control wires producers to consumers. `addr` is the
/// dialable `host:port` of the producer side, empty until run-control fills
/// it in at `/config` time. `kind` is a free-form type tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndPoint {
    pub name: String,
    pub addr: String,
    pub kind: String,
}

impl EndPoint {
    /// A bare end-point with no address or type tag yet.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: String::new(),
            kind: String::new(),
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.addr)
        }
    }
}
