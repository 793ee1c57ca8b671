use std::time::Duration;

use log::{info, warn};

use crate::{config::NetworkConfig, error::ConnectionFailure, ticks::Clock, types::LinkInfo};

const POLL_PERIOD: Duration = Duration::from_secs(1);

pub trait NetworkLink {
    /// Starts association. Must not block until the link is up.
    fn begin(&mut self, network: &NetworkConfig) -> Result<(), ConnectionFailure>;

    fn is_connected(&mut self) -> bool;

    fn link_info(&mut self) -> Option<LinkInfo>;
}

/// Associates and polls once per second for at most `connect_timeout_secs`.
pub fn connect<L, C>(
    link: &mut L,
    network: &NetworkConfig,
    clock: &C,
) -> Result<LinkInfo, ConnectionFailure>
where
    L: NetworkLink + ?Sized,
    C: Clock + ?Sized,
{
    let timeout_secs = network.connect_timeout_secs;
    link.begin(network)?;
    info!(
        "connecting to `{}` (timeout {}s)",
        network.wifi_ssid, timeout_secs
    );

    for elapsed in 0..=timeout_secs {
        if link.is_connected() {
            match link.link_info() {
                Some(link_info) => {
                    info!("link up after {elapsed}s: {link_info}");
                    return Ok(link_info);
                }
                None => warn!("link associated but has no address yet"),
            }
        }

        if elapsed < timeout_secs {
            clock.sleep(POLL_PERIOD);
        }
    }

    warn!("link did not come up within {timeout_secs}s");
    Err(ConnectionFailure::Timeout(timeout_secs))
}
