//! Registry of higher-level services riding on a host context.
//!
//! A service is anything that owns devices or timer jobs and wants an
//! orderly shutdown before those are torn down: the host stops every
//! registered service first when it closes.

use std::fmt;

use crate::hio::Hio;

/// A cooperative service. `stop` runs on the loop thread while the
/// host still functions, so the service can kill its devices and
/// cancel its timer jobs cleanly.
pub trait Service {
    fn stop(&mut self, hio: &mut Hio);
}

/// Handle to a registered service.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SvcId(u64);

impl SvcId {
    pub(crate) fn new(seq: u64) -> SvcId {
        SvcId(seq)
    }
}

impl fmt::Debug for SvcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc#{}", self.0)
    }
}
