use std::sync::Arc;

use bitflags::bitflags;

use super::channel::PeerConnId;
use super::transporter::{AnyResources, Transporter, TransporterError};
use super::NUM_PROTOCOLS;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ConnFlags: u32 {
        // peer writes directly into the buffers
        const DIRECT = 0x1;
        // buffers live in host memory shared by the two ranks
        const SHARED = 0x2;
        // traffic is proxied over the network
        const NET = 0x4;
        // connection to the collective network root
        const COLL_NET = 0x8;
    }
}

/// Wire record consumed by the execution layer,
/// mirrored into device-visible memory once the connector is live.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnDescriptor {
    pub bufs: [u64; NUM_PROTOCOLS],
    pub head: u64,
    pub tail: u64,
    pub slots_sizes: u64,
    pub step: u64,
    pub flags: ConnFlags,
    // priority index of the transport that produced this descriptor
    pub transport: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ConnDescriptor>(), 48);

pub enum TransportResources {
    Empty,
    Held(AnyResources),
    // freed by the owning transport, later frees are no-ops
    Released,
}

/// Connection state of one (channel, peer, direction, slot).
pub struct Connector {
    connected: bool,
    transporter: Option<Arc<dyn Transporter>>,
    transport_idx: Option<usize>,
    resources: TransportResources,
    pub conn_info: ConnDescriptor,
}

impl Connector {
    pub fn new() -> Self {
        Connector {
            connected: false,
            transporter: None,
            transport_idx: None,
            resources: TransportResources::Empty,
            conn_info: ConnDescriptor::default(),
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    #[inline]
    pub fn transporter(&self) -> Option<&Arc<dyn Transporter>> {
        self.transporter.as_ref()
    }

    #[inline]
    pub fn transport_idx(&self) -> Option<usize> {
        self.transport_idx
    }

    #[inline]
    pub fn has_resources(&self) -> bool {
        matches!(self.resources, TransportResources::Held(_))
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        matches!(self.resources, TransportResources::Released)
    }

    // Hand the connector to a transport together with the resources its setup produced.
    // Leftovers of an earlier setup that never connected are released first.
    pub fn assign(
        &mut self,
        conn_id: &PeerConnId,
        transporter: Arc<dyn Transporter>,
        transport_idx: usize,
        resources: AnyResources,
    ) -> Result<(), TransporterError> {
        debug_assert!(!self.connected);
        self.release(conn_id)?;
        self.transporter = Some(transporter);
        self.transport_idx = Some(transport_idx);
        self.resources = TransportResources::Held(resources);
        Ok(())
    }

    pub fn resources_mut(&mut self) -> Option<&mut AnyResources> {
        match &mut self.resources {
            TransportResources::Held(resources) => Some(resources),
            _ => None,
        }
    }

    pub fn mark_connected(&mut self, mut conn_info: ConnDescriptor) {
        debug_assert!(!self.connected);
        if let Some(idx) = self.transport_idx {
            conn_info.transport = idx as u32;
        }
        self.conn_info = conn_info;
        self.connected = true;
    }

    // Returns whether resources were handed back to the transport
    pub fn release(&mut self, conn_id: &PeerConnId) -> Result<bool, TransporterError> {
        match std::mem::replace(&mut self.resources, TransportResources::Released) {
            TransportResources::Held(resources) => match &self.transporter {
                Some(transporter) => {
                    transporter.free(conn_id, resources)?;
                    Ok(true)
                }
                None => Ok(false),
            },
            TransportResources::Empty => {
                self.resources = TransportResources::Empty;
                Ok(false)
            }
            TransportResources::Released => Ok(false),
        }
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}
