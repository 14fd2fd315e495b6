pub mod damping;
pub mod restart;
pub mod rpki;

pub use damping::FlapDamping;
pub use restart::RestartHelper;
pub use rpki::RoaValidator;

use std::io;

use crate::config::ServerConfig;

/// Decision returned from the route-received checkpoint
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteControl {
    Accept,
    /// Route is dampened or RPKI-rejected; drop it without session impact
    Suppress,
}

/// The advanced-feature managers, always present; each is a no-op when
/// its config section is absent
pub struct Features {
    pub damping: FlapDamping,
    pub rpki: RoaValidator,
    pub restart: RestartHelper,
}

impl Features {
    pub fn from_config(config: &ServerConfig) -> io::Result<Self> {
        Ok(Self {
            damping: FlapDamping::new(config.flap_damping),
            rpki: RoaValidator::new(config.rpki.as_ref())?,
            restart: RestartHelper::new(config.graceful_restart.restart_time),
        })
    }
}
