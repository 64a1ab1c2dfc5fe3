//! ## Routing table
//!
//! Per device, a bidirectional map between the device-local stack-id space
//! (1..255) and the daemon-global stack-id space, mirroring
//! `usb_device.py`'s `routing_table_in` / `routing_table_out` identity
//! arrays. Owned exclusively by the device worker that holds it; nothing
//! else is allowed to mutate it (SPEC_FULL §5).

#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// local stack id -> global stack id
    in_map: [u8; 256],
    /// global stack id -> local stack id
    out_map: [u8; 256],
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        let mut in_map = [0u8; 256];
        let mut out_map = [0u8; 256];
        for i in 0..256 {
            in_map[i] = i as u8;
            out_map[i] = i as u8;
        }
        RoutingTable { in_map, out_map }
    }

    pub fn map_in(&self, local: u8) -> u8 {
        self.in_map[local as usize]
    }

    pub fn map_out(&self, global: u8) -> u8 {
        self.out_map[global as usize]
    }

    /// Bind `local` to a newly allocated `global` id, replacing whatever
    /// `local` previously mapped to. Both directions are updated together so
    /// the pair stays consistent.
    pub fn rebind(&mut self, local: u8, global: u8) {
        self.in_map[local as usize] = global;
        self.out_map[global as usize] = local;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_by_default() {
        let rt = RoutingTable::new();
        for l in 0..=255u8 {
            assert_eq!(rt.map_in(l), l);
            assert_eq!(rt.map_out(l), l);
        }
    }

    #[test]
    fn rebind_updates_both_directions() {
        let mut rt = RoutingTable::new();
        rt.rebind(1, 42);
        assert_eq!(rt.map_in(1), 42);
        assert_eq!(rt.map_out(42), 1);
    }

    #[test]
    fn roundtrip_invariant_holds_after_rebind() {
        let mut rt = RoutingTable::new();
        rt.rebind(1, 42);
        for l in 0..=255u8 {
            let g = rt.map_in(l);
            assert_eq!(rt.map_out(g), l, "out_map[in_map[{l}]] == {l}");
            assert_eq!(rt.map_in(rt.map_out(g)), g, "in_map[out_map[g]] == g");
        }
    }
}
