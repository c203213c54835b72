/// Bluetooth Low Energy discovery over BlueZ
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, error, warn};
use std::collections::VecDeque;
use time::OffsetDateTime;

use crate::models::Advertisement;
use crate::session::{Discovery, DiscoveryError, Permission};

/// One active discovery round: the BlueZ session and adapter handles, the
/// live event stream, and the adapter cache sweep still to be drained.
struct ScanRound {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    events: BoxStream<'static, bluer::AdapterEvent>,
    backlog: VecDeque<bluer::Address>,
}

/// `Discovery` implementation on the Linux BlueZ stack.
///
/// Each round powers the default adapter, applies a Low Energy discovery
/// filter and streams device events until the session stops the round.
/// Dropping the round tears the BlueZ discovery down.
pub struct BlueZScanner {
    round: Option<ScanRound>,
}

impl BlueZScanner {
    pub fn new() -> Self {
        BlueZScanner { round: None }
    }
}

impl Default for BlueZScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery for BlueZScanner {
    async fn start(&mut self) -> Result<(), DiscoveryError> {
        // Entry action: a round left over from a previous cycle is torn
        // down before a new one opens.
        self.round = None;

        let session = bluer::Session::new()
            .await
            .map_err(|e| DiscoveryError(format!("bluetooth session: {}", e)))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| DiscoveryError(format!("no default adapter: {}", e)))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| DiscoveryError(format!("failed to power on adapter: {}", e)))?;

        // Low Energy only, duplicate advertisements filtered out.
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("failed to set discovery filter: {}", e);
        }

        let events = adapter
            .discover_devices()
            .await
            .map_err(|e| DiscoveryError(format!("failed to start discovery: {}", e)))?
            .boxed();

        // Devices BlueZ already knows do not come back as DeviceAdded
        // events; sweep the adapter cache first so a previously seen
        // beacon still matches.
        let backlog: VecDeque<_> = adapter
            .device_addresses()
            .await
            .unwrap_or_default()
            .into();

        debug!("discovery round opened on {}", adapter.name());
        self.round = Some(ScanRound {
            _session: session,
            adapter,
            events,
            backlog,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Advertisement, DiscoveryError> {
        loop {
            let round = self
                .round
                .as_mut()
                .ok_or_else(|| DiscoveryError("discovery not started".to_string()))?;

            if let Some(addr) = round.backlog.pop_front() {
                if let Some(advertisement) = read_device(&round.adapter, addr).await {
                    return Ok(advertisement);
                }
                continue;
            }

            match round.events.next().await {
                Some(bluer::AdapterEvent::DeviceAdded(addr)) => {
                    if let Some(advertisement) = read_device(&round.adapter, addr).await {
                        return Ok(advertisement);
                    }
                }
                Some(_) => {}
                None => {
                    return Err(DiscoveryError("discovery event stream ended".to_string()));
                }
            }
        }
    }

    async fn stop(&mut self) {
        if self.round.take().is_some() {
            debug!("discovery round closed");
        }
    }
}

/// Read one device from the adapter cache into a raw advertisement event.
/// A failed manufacturer-data read yields an event with absent data.
async fn read_device(adapter: &bluer::Adapter, addr: bluer::Address) -> Option<Advertisement> {
    let device = adapter.device(addr).ok()?;
    let identity = device.address().to_string().to_uppercase();

    let data = match device.manufacturer_data().await {
        // The beacon advertises a single manufacturer record; take the
        // lowest company id should the cache hold more than one.
        Ok(Some(records)) => records
            .into_iter()
            .min_by_key(|(id, _)| *id)
            .map(|(_, bytes)| bytes),
        Ok(None) => None,
        Err(e) => {
            debug!("failed to read manufacturer data for {}: {}", identity, e);
            None
        }
    };

    Some(Advertisement {
        identity,
        data,
        received_at: OffsetDateTime::now_utc(),
    })
}

/// Host-side analogue of the runtime permission request: opening the BlueZ
/// session and powering the default adapter fails when the daemon refuses
/// us access.
pub struct BlueZPermission;

impl Permission for BlueZPermission {
    async fn request(&mut self) -> bool {
        match power_default_adapter().await {
            Ok(name) => {
                debug!("adapter {} powered on", name);
                true
            }
            Err(e) => {
                error!("bluetooth unavailable: {}", e);
                false
            }
        }
    }
}

async fn power_default_adapter() -> bluer::Result<String> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    Ok(adapter.name().to_string())
}
