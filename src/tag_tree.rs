//! The tag tree, described in Section B.10.2.
//!
//! Tag trees are quad trees where each leaf stores an integer value and each
//! ancestor stores the smallest value of all of its descendants. Packet
//! headers use them to answer "is this leaf's value below the threshold"
//! incrementally: bits already sent for an ancestor are never repeated, so
//! each node carries a mutable lower bound (`low`) and a flag recording
//! whether its exact value has been transmitted (`known`).

use smallvec::SmallVec;

use crate::bitio::{StuffedBitReader, StuffedBitWriter};

/// The sentinel for a value that has not been set (encoder) or learned
/// (decoder) yet.
const UNSET: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
struct TagNode {
    /// The running minimum of the descendants' leaf values.
    value: u32,
    /// The lower bound already conveyed on the wire.
    low: u32,
    /// Whether the exact value has been conveyed.
    known: bool,
}

impl Default for TagNode {
    fn default() -> Self {
        Self {
            value: UNSET,
            low: 0,
            known: false,
        }
    }
}

/// One pyramid level: a grid of nodes, each level half the previous one in
/// both dimensions (rounding up).
#[derive(Clone, Debug)]
struct Level {
    width: u32,
    offset: usize,
}

#[derive(Clone, Debug)]
pub(crate) struct TagTree {
    width: u32,
    height: u32,
    levels: Vec<Level>,
    nodes: Vec<TagNode>,
}

impl TagTree {
    /// Create a tree over a `width` x `height` leaf grid. A zero-sized grid
    /// yields a tree that must never be queried.
    pub(crate) fn new(width: u32, height: u32) -> Self {
        let mut levels = vec![];
        let mut nodes = 0usize;

        if width > 0 && height > 0 {
            let (mut w, mut h) = (width, height);

            loop {
                levels.push(Level {
                    width: w,
                    offset: nodes,
                });
                nodes += (w * h) as usize;

                if w == 1 && h == 1 {
                    break;
                }

                w = w.div_ceil(2);
                h = h.div_ceil(2);
            }
        }

        Self {
            width,
            height,
            levels,
            nodes: vec![TagNode::default(); nodes],
        }
    }

    /// Clear the mutable coding state of every node while preserving the
    /// values.
    pub(crate) fn reset(&mut self) {
        for node in &mut self.nodes {
            node.low = 0;
            node.known = false;
        }
    }

    /// Forget all values in addition to the coding state.
    pub(crate) fn clear(&mut self) {
        for node in &mut self.nodes {
            node.value = UNSET;
        }

        self.reset();
    }

    fn node_idx(&self, level: usize, x: u32, y: u32) -> usize {
        let l = &self.levels[level];
        l.offset + (y * l.width + x) as usize
    }

    /// Set a leaf value and refresh the running minimum along its ancestor
    /// chain. The leaf takes the value exactly; ancestors only ever sink.
    pub(crate) fn set_value(&mut self, x: u32, y: u32, value: u32) {
        debug_assert!(x < self.width && y < self.height);

        let idx = self.node_idx(0, x, y);
        self.nodes[idx].value = value;

        let (mut x, mut y) = (x / 2, y / 2);

        for level in 1..self.levels.len() {
            let idx = self.node_idx(level, x, y);

            if self.nodes[idx].value <= value {
                break;
            }

            self.nodes[idx].value = value;
            x /= 2;
            y /= 2;
        }
    }

    /// The root-to-leaf chain of node indices for a leaf.
    fn path(&self, x: u32, y: u32) -> SmallVec<[usize; 8]> {
        let mut path: SmallVec<[usize; 8]> = SmallVec::new();
        let (mut x, mut y) = (x, y);

        for level in 0..self.levels.len() {
            path.push(self.node_idx(level, x, y));
            x /= 2;
            y /= 2;
        }

        path.reverse();
        path
    }

    /// Answer "is the leaf value smaller than `threshold`" on the wire,
    /// emitting only bits not implied by earlier queries.
    pub(crate) fn encode(
        &mut self,
        writer: &mut StuffedBitWriter,
        x: u32,
        y: u32,
        threshold: u32,
    ) {
        debug_assert!(x < self.width && y < self.height);

        let mut low = 0;

        for idx in self.path(x, y) {
            let node = &mut self.nodes[idx];

            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }

            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        writer.write_bit(1);
                        node.known = true;
                    }
                    break;
                }

                writer.write_bit(0);
                low += 1;
            }

            node.low = low;
        }
    }

    /// Mirror of [`TagTree::encode`]: consume bits until the relation of the
    /// leaf value to `threshold` is determined, and return the leaf's lower
    /// bound ([`u32::MAX`] only for a never-bounded leaf). The caller
    /// compares the result against `threshold`.
    pub(crate) fn decode(
        &mut self,
        reader: &mut StuffedBitReader<'_>,
        x: u32,
        y: u32,
        threshold: u32,
    ) -> Option<u32> {
        debug_assert!(x < self.width && y < self.height);

        let mut low = 0;
        let mut value = UNSET;

        for idx in self.path(x, y) {
            let node = &mut self.nodes[idx];

            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }

            while low < threshold && low < node.value {
                if reader.read_bit()? == 1 {
                    node.value = low;
                } else {
                    low += 1;
                }
            }

            node.low = low;
            value = node.value;
        }

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl TagTree {
        /// The leaf value, [`u32::MAX`] while unset.
        fn value(&self, x: u32, y: u32) -> u32 {
            self.nodes[self.node_idx(0, x, y)].value
        }
    }

    /// The partial inclusion reads of the example in B.10.2, bit-packed from
    /// the walk shown in the "JPEG2000 Standard for Image Compression" book.
    #[test]
    fn decode_b10_2_example() {
        let data = [0x79, 0xA6, 0xC0];
        let mut reader = StuffedBitReader::new(&data);
        let mut tree = TagTree::new(6, 3);

        let expected = [1, 3, 2, 3, 2];
        for (x, expected) in expected.iter().enumerate() {
            assert_eq!(
                tree.decode(&mut reader, x as u32, 0, u32::MAX),
                Some(*expected)
            );
        }
    }

    #[test]
    fn encode_matches_decode() {
        let values: [[u32; 6]; 3] = [
            [1, 3, 2, 3, 2, 3],
            [2, 2, 2, 2, 2, 2],
            [2, 1, 3, 2, 2, 2],
        ];

        let mut tree = TagTree::new(6, 3);
        for (y, row) in values.iter().enumerate() {
            for (x, &v) in row.iter().enumerate() {
                tree.set_value(x as u32, y as u32, v);
            }
        }

        let mut writer = StuffedBitWriter::new();
        for y in 0..3 {
            for x in 0..6 {
                tree.encode(&mut writer, x, y, 4);
            }
        }
        let buf = writer.finish();

        let mut decoded = TagTree::new(6, 3);
        let mut reader = StuffedBitReader::new(&buf);
        for (y, row) in values.iter().enumerate() {
            for (x, &v) in row.iter().enumerate() {
                let learned = decoded
                    .decode(&mut reader, x as u32, y as u32, 4)
                    .unwrap();
                assert_eq!(learned, v, "leaf ({x}, {y})");
            }
        }
    }

    #[test]
    fn incremental_thresholds_converge() {
        // Layered packet headers raise the threshold one layer at a time;
        // the bits across all layers must still reconstruct the values.
        let values = [[3u32, 0, 2], [1, 4, 2]];

        let mut tree = TagTree::new(3, 2);
        for (y, row) in values.iter().enumerate() {
            for (x, &v) in row.iter().enumerate() {
                tree.set_value(x as u32, y as u32, v);
            }
        }

        let mut writer = StuffedBitWriter::new();
        for threshold in 1..=5 {
            for y in 0..2 {
                for x in 0..3 {
                    tree.encode(&mut writer, x, y, threshold);
                }
            }
        }
        let buf = writer.finish();

        let mut decoded = TagTree::new(3, 2);
        let mut reader = StuffedBitReader::new(&buf);
        for threshold in 1..=5 {
            for (y, row) in values.iter().enumerate() {
                for (x, &v) in row.iter().enumerate() {
                    let learned = decoded
                        .decode(&mut reader, x as u32, y as u32, threshold)
                        .unwrap();
                    assert_eq!(learned < threshold, v < threshold);

                    if v < threshold {
                        assert_eq!(learned, v);
                    }
                }
            }
        }
    }

    #[test]
    fn set_value_writes_the_leaf() {
        let mut tree = TagTree::new(4, 4);
        tree.set_value(2, 1, 5);
        assert_eq!(tree.value(2, 1), 5);

        tree.set_value(2, 1, 7);
        assert_eq!(tree.value(2, 1), 7);

        tree.set_value(2, 1, 3);
        assert_eq!(tree.value(2, 1), 3);
    }

    #[test]
    fn reset_preserves_values() {
        let mut tree = TagTree::new(2, 2);
        for (x, y, v) in [(0, 0, 1), (1, 0, 2), (0, 1, 0), (1, 1, 3)] {
            tree.set_value(x, y, v);
        }

        let mut writer = StuffedBitWriter::new();
        for y in 0..2 {
            for x in 0..2 {
                tree.encode(&mut writer, x, y, 4);
            }
        }

        tree.reset();

        for (x, y, v) in [(0, 0, 1), (1, 0, 2), (0, 1, 0), (1, 1, 3)] {
            assert_eq!(tree.value(x, y), v);
        }

        // After a reset the same bits are produced again.
        let first = writer.finish();
        let mut writer = StuffedBitWriter::new();
        for y in 0..2 {
            for x in 0..2 {
                tree.encode(&mut writer, x, y, 4);
            }
        }
        assert_eq!(writer.finish(), first);
    }

    #[test]
    fn single_leaf_tree() {
        let mut tree = TagTree::new(1, 1);
        tree.set_value(0, 0, 2);

        let mut writer = StuffedBitWriter::new();
        tree.encode(&mut writer, 0, 0, 4);
        let buf = writer.finish();

        let mut decoded = TagTree::new(1, 1);
        let mut reader = StuffedBitReader::new(&buf);
        assert_eq!(decoded.decode(&mut reader, 0, 0, 4), Some(2));
    }
}
