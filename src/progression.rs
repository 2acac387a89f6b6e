//! Progression iterators, defined in Section B.12.
//!
//! A progression iterator yields tuples of (layer, resolution, component,
//! precinct) in the order that determines how packets follow each other in
//! the codestream. The loop nesting of each order corresponds to its
//! letters read outside-in; the precinct count varies per (component,
//! resolution), so inner loops skip positions a component does not have.

use crate::header::{Header, ProgressionOrder};
use crate::tile::Tile;

/// The coordinates of one packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketPosition {
    pub layer: u16,
    pub resolution: u8,
    pub component: u16,
    pub precinct: u32,
}

/// Walks the packets of one tile in a progression order.
#[derive(Clone, Debug)]
pub struct PacketIterator {
    sequence: Vec<PacketPosition>,
    cursor: usize,
}

impl PacketIterator {
    /// Build the iterator for a tile from the header's progression order.
    pub fn new(header: &Header, tile: &Tile) -> Self {
        let counts: Vec<Vec<u32>> = (0..tile.components.len())
            .map(|c| {
                tile.components[c]
                    .resolutions
                    .iter()
                    .map(|r| r.precincts.len() as u32)
                    .collect()
            })
            .collect();

        Self::from_counts(
            header.coding_style.progression_order,
            header.coding_style.num_layers,
            &counts,
        )
    }

    /// Build the iterator from per-`(component, resolution)` precinct
    /// counts.
    pub fn from_counts(order: ProgressionOrder, num_layers: u16, counts: &[Vec<u32>]) -> Self {
        let sequence = match order {
            ProgressionOrder::LayerResolutionComponentPosition => {
                layer_resolution_component_position(num_layers, counts)
            }
            ProgressionOrder::ResolutionLayerComponentPosition => {
                resolution_layer_component_position(num_layers, counts)
            }
            ProgressionOrder::ResolutionPositionComponentLayer => {
                resolution_position_component_layer(num_layers, counts)
            }
            ProgressionOrder::PositionComponentResolutionLayer => {
                position_component_resolution_layer(num_layers, counts)
            }
            ProgressionOrder::ComponentPositionResolutionLayer => {
                component_position_resolution_layer(num_layers, counts)
            }
        };

        Self {
            sequence,
            cursor: 0,
        }
    }

    /// The next packet position, or `None` when the tile is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<PacketPosition> {
        let position = self.sequence.get(self.cursor).copied();
        self.cursor += usize::from(position.is_some());
        position
    }

    /// Rewind to the first packet.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn num_packets(&self) -> usize {
        self.sequence.len()
    }
}

fn max_resolutions(counts: &[Vec<u32>]) -> usize {
    counts.iter().map(|c| c.len()).max().unwrap_or(0)
}

fn max_precincts(counts: &[Vec<u32>]) -> u32 {
    counts
        .iter()
        .flat_map(|c| c.iter().copied())
        .max()
        .unwrap_or(0)
}

fn layer_resolution_component_position(
    num_layers: u16,
    counts: &[Vec<u32>],
) -> Vec<PacketPosition> {
    let mut sequence = vec![];

    for layer in 0..num_layers {
        for resolution in 0..max_resolutions(counts) {
            for (component, resolutions) in counts.iter().enumerate() {
                let Some(&precincts) = resolutions.get(resolution) else {
                    continue;
                };

                for precinct in 0..precincts {
                    sequence.push(PacketPosition {
                        layer,
                        resolution: resolution as u8,
                        component: component as u16,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

fn resolution_layer_component_position(
    num_layers: u16,
    counts: &[Vec<u32>],
) -> Vec<PacketPosition> {
    let mut sequence = vec![];

    for resolution in 0..max_resolutions(counts) {
        for layer in 0..num_layers {
            for (component, resolutions) in counts.iter().enumerate() {
                let Some(&precincts) = resolutions.get(resolution) else {
                    continue;
                };

                for precinct in 0..precincts {
                    sequence.push(PacketPosition {
                        layer,
                        resolution: resolution as u8,
                        component: component as u16,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

fn resolution_position_component_layer(
    num_layers: u16,
    counts: &[Vec<u32>],
) -> Vec<PacketPosition> {
    let mut sequence = vec![];

    for resolution in 0..max_resolutions(counts) {
        for precinct in 0..max_precincts(counts) {
            for (component, resolutions) in counts.iter().enumerate() {
                let Some(&precincts) = resolutions.get(resolution) else {
                    continue;
                };

                if precinct >= precincts {
                    continue;
                }

                for layer in 0..num_layers {
                    sequence.push(PacketPosition {
                        layer,
                        resolution: resolution as u8,
                        component: component as u16,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

fn position_component_resolution_layer(
    num_layers: u16,
    counts: &[Vec<u32>],
) -> Vec<PacketPosition> {
    let mut sequence = vec![];

    for precinct in 0..max_precincts(counts) {
        for (component, resolutions) in counts.iter().enumerate() {
            for (resolution, &precincts) in resolutions.iter().enumerate() {
                if precinct >= precincts {
                    continue;
                }

                for layer in 0..num_layers {
                    sequence.push(PacketPosition {
                        layer,
                        resolution: resolution as u8,
                        component: component as u16,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

fn component_position_resolution_layer(
    num_layers: u16,
    counts: &[Vec<u32>],
) -> Vec<PacketPosition> {
    let mut sequence = vec![];

    for (component, resolutions) in counts.iter().enumerate() {
        let component_max = resolutions.iter().copied().max().unwrap_or(0);

        for precinct in 0..component_max {
            for (resolution, &precincts) in resolutions.iter().enumerate() {
                if precinct >= precincts {
                    continue;
                }

                for layer in 0..num_layers {
                    sequence.push(PacketPosition {
                        layer,
                        resolution: resolution as u8,
                        component: component as u16,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ORDERS: [ProgressionOrder; 5] = [
        ProgressionOrder::LayerResolutionComponentPosition,
        ProgressionOrder::ResolutionLayerComponentPosition,
        ProgressionOrder::ResolutionPositionComponentLayer,
        ProgressionOrder::PositionComponentResolutionLayer,
        ProgressionOrder::ComponentPositionResolutionLayer,
    ];

    #[test]
    fn lrcp_sequence() {
        let counts = vec![vec![1, 1], vec![1, 1]];
        let mut iterator = PacketIterator::from_counts(
            ProgressionOrder::LayerResolutionComponentPosition,
            2,
            &counts,
        );

        let expected = [
            (0, 0, 0, 0),
            (0, 0, 1, 0),
            (0, 1, 0, 0),
            (0, 1, 1, 0),
            (1, 0, 0, 0),
            (1, 0, 1, 0),
            (1, 1, 0, 0),
            (1, 1, 1, 0),
        ];

        for (layer, resolution, component, precinct) in expected {
            assert_eq!(
                iterator.next(),
                Some(PacketPosition {
                    layer,
                    resolution,
                    component,
                    precinct
                })
            );
        }

        assert_eq!(iterator.next(), None);
    }

    #[test]
    fn uniform_configuration_emits_lrcp_product() {
        // 3 layers, 2 resolutions, 2 components, 4 precincts each.
        let counts = vec![vec![4, 4], vec![4, 4]];

        for order in ALL_ORDERS {
            let iterator = PacketIterator::from_counts(order, 3, &counts);
            assert_eq!(iterator.num_packets(), 3 * 2 * 2 * 4, "{order:?}");
        }
    }

    #[test]
    fn every_order_visits_every_packet_once() {
        // Non-uniform precinct counts across components and resolutions.
        let counts = vec![vec![2, 4, 1], vec![1, 2]];
        let total: u32 = counts.iter().flatten().sum();
        let num_layers = 2u16;

        for order in ALL_ORDERS {
            let mut iterator = PacketIterator::from_counts(order, num_layers, &counts);
            let mut seen = std::collections::BTreeSet::new();

            while let Some(position) = iterator.next() {
                assert!(
                    seen.insert((
                        position.layer,
                        position.resolution,
                        position.component,
                        position.precinct
                    )),
                    "duplicate packet in {order:?}"
                );
            }

            assert_eq!(seen.len() as u32, total * num_layers as u32, "{order:?}");
        }
    }

    #[test]
    fn rpcl_nests_layers_innermost() {
        let counts = vec![vec![2, 2]];
        let mut iterator = PacketIterator::from_counts(
            ProgressionOrder::ResolutionPositionComponentLayer,
            2,
            &counts,
        );

        let expected = [
            (0, 0, 0, 0),
            (1, 0, 0, 0),
            (0, 0, 0, 1),
            (1, 0, 0, 1),
            (0, 1, 0, 0),
            (1, 1, 0, 0),
            (0, 1, 0, 1),
            (1, 1, 0, 1),
        ];

        for (layer, resolution, component, precinct) in expected {
            assert_eq!(
                iterator.next(),
                Some(PacketPosition {
                    layer,
                    resolution,
                    component,
                    precinct
                })
            );
        }
    }

    #[test]
    fn reset_rewinds() {
        let counts = vec![vec![1]];
        let mut iterator = PacketIterator::from_counts(
            ProgressionOrder::LayerResolutionComponentPosition,
            2,
            &counts,
        );

        let first = iterator.next();
        while iterator.next().is_some() {}

        iterator.reset();
        assert_eq!(iterator.next(), first);
    }
}
