//! Endpoint cache of a virtual device

use crate::backend::ConfigLayout;
use crate::types::{Direction, EndpointType};
use tracing::{debug, warn};

/// Endpoint numbers 0..MAX_ENDPOINTS
pub const MAX_ENDPOINTS: usize = 16;

/// Cached transfer type and max-packet descriptor of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Endpoint {
    pub kind: EndpointType,
    /// Raw wMaxPacketSize
    pub max_packet: u16,
}

impl Endpoint {
    pub fn packet_size(&self) -> usize {
        (self.max_packet & 0x07ff) as usize
    }

    /// Additional transactions per microframe (0..=2)
    pub fn burst_multiplier(&self) -> usize {
        ((self.max_packet >> 11) & 0x03) as usize
    }

    /// Bytes per isochronous frame
    pub fn frame_len(&self) -> usize {
        self.packet_size() * (1 + self.burst_multiplier())
    }
}

/// Control endpoint plus per-direction data endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTable {
    control: Endpoint,
    inbound: [Endpoint; MAX_ENDPOINTS - 1],
    outbound: [Endpoint; MAX_ENDPOINTS - 1],
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointTable {
    pub fn new() -> Self {
        let mut table = Self {
            control: Endpoint::default(),
            inbound: [Endpoint::default(); MAX_ENDPOINTS - 1],
            outbound: [Endpoint::default(); MAX_ENDPOINTS - 1],
        };
        table.reset();
        table
    }

    /// Endpoint 0 is shared by both directions
    pub fn get(&self, direction: Direction, number: u8) -> Option<&Endpoint> {
        let number = number as usize;
        if number >= MAX_ENDPOINTS {
            warn!("Invalid endpoint {}", number);
            return None;
        }
        if number == 0 {
            return Some(&self.control);
        }
        match direction {
            Direction::In => self.inbound.get(number - 1),
            Direction::Out => self.outbound.get(number - 1),
        }
    }

    fn get_mut(&mut self, direction: Direction, number: u8) -> Option<&mut Endpoint> {
        let number = number as usize;
        if number >= MAX_ENDPOINTS {
            warn!("Invalid endpoint {}", number);
            return None;
        }
        if number == 0 {
            return Some(&mut self.control);
        }
        match direction {
            Direction::In => self.inbound.get_mut(number - 1),
            Direction::Out => self.outbound.get_mut(number - 1),
        }
    }

    pub fn kind(&self, direction: Direction, number: u8) -> EndpointType {
        self.get(direction, number)
            .map(|ep| ep.kind)
            .unwrap_or_default()
    }

    /// Forget every data endpoint; only endpoint 0 stays
    pub fn reset(&mut self) {
        self.control = Endpoint {
            kind: EndpointType::Control,
            max_packet: self.control.max_packet,
        };
        for ep in self.inbound.iter_mut().chain(self.outbound.iter_mut()) {
            *ep = Endpoint::default();
        }
    }

    /// Reset, then load the endpoints of each interface's active alt setting
    ///
    /// `alt_settings` is indexed by interface number.
    pub fn rebuild(&mut self, layout: &ConfigLayout, alt_settings: &[u8]) {
        self.reset();

        for iface in &layout.interfaces {
            let alt = alt_settings
                .get(iface.number as usize)
                .copied()
                .unwrap_or(0);
            let Some(endpoints) = iface.alt_settings.get(alt as usize) else {
                warn!(
                    "Interface {} has no alternate setting {}",
                    iface.number, alt
                );
                continue;
            };

            for desc in endpoints {
                if let Some(ep) = self.get_mut(desc.direction(), desc.number()) {
                    ep.kind = desc.kind;
                    ep.max_packet = desc.max_packet;
                }
            }
        }

        debug!(
            "Endpoint table rebuilt for configuration {}",
            layout.value
        );
    }

    /// Data endpoints currently populated, as (direction, number, endpoint)
    pub fn active(&self) -> impl Iterator<Item = (Direction, u8, &Endpoint)> + '_ {
        let inbound = self
            .inbound
            .iter()
            .enumerate()
            .map(|(i, ep)| (Direction::In, i as u8 + 1, ep));
        let outbound = self
            .outbound
            .iter()
            .enumerate()
            .map(|(i, ep)| (Direction::Out, i as u8 + 1, ep));
        inbound
            .chain(outbound)
            .filter(|(_, _, ep)| ep.kind != EndpointType::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EndpointLayout, InterfaceLayout};

    fn layout() -> ConfigLayout {
        ConfigLayout {
            value: 1,
            interfaces: vec![InterfaceLayout {
                number: 0,
                alt_settings: vec![
                    vec![EndpointLayout {
                        address: 0x81,
                        kind: EndpointType::Bulk,
                        max_packet: 512,
                    }],
                    vec![EndpointLayout {
                        address: 0x02,
                        kind: EndpointType::Isochronous,
                        max_packet: 0x1400,
                    }],
                ],
            }],
        }
    }

    #[test]
    fn test_max_packet_fields() {
        // 1024 bytes, 2 additional transactions
        let ep = Endpoint {
            kind: EndpointType::Isochronous,
            max_packet: 0x1400,
        };
        assert_eq!(ep.packet_size(), 1024);
        assert_eq!(ep.burst_multiplier(), 2);
        assert_eq!(ep.frame_len(), 3072);
    }

    #[test]
    fn test_reset_keeps_control() {
        let mut table = EndpointTable::new();
        table.rebuild(&layout(), &[0]);
        table.reset();
        assert_eq!(table.kind(Direction::In, 0), EndpointType::Control);
        assert_eq!(table.kind(Direction::In, 1), EndpointType::None);
        assert_eq!(table.active().count(), 0);
    }

    #[test]
    fn test_rebuild_replaces_stale_entries() {
        let mut table = EndpointTable::new();
        table.rebuild(&layout(), &[0]);
        assert_eq!(table.kind(Direction::In, 1), EndpointType::Bulk);

        table.rebuild(&layout(), &[1]);
        assert_eq!(table.kind(Direction::In, 1), EndpointType::None);
        assert_eq!(table.kind(Direction::Out, 2), EndpointType::Isochronous);
        assert_eq!(table.active().count(), 1);
    }

    #[test]
    fn test_out_of_range_endpoint() {
        let table = EndpointTable::new();
        assert!(table.get(Direction::In, 16).is_none());
        assert_eq!(table.kind(Direction::Out, 20), EndpointType::None);
    }
}
