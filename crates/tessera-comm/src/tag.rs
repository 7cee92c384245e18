//! Message tags
//!
//! Receives are matched on `(source, tag)`. Every collective derives its tag
//! from the factorization step and the tile it moves, so messages belonging
//! to different panels in flight never match each other.

use std::fmt;

/// What a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Panel outcome (success or failing index), sent before anything else
    Status,
    Pivots,
    /// Factored panel tiles
    Panel,
    /// Row results such as `U(k, j)`
    RowFactor,
    /// Row or column interchange traffic
    Swap,
    /// Tiles moved between owners outside a panel broadcast
    Tile,
    Reduce,
    Broadcast,
    Barrier,
    Gather,
    /// Triangular solve traffic
    Solve,
    Norm,
}

/// Tag of one logical message stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub channel: Channel,
    pub step: u32,
    pub a: u32,
    pub b: u32,
}

impl Tag {
    pub fn new(channel: Channel, step: usize) -> Self {
        Self {
            channel,
            step: step as u32,
            a: 0,
            b: 0,
        }
    }

    /// Same channel and step, refined by two indices (usually a tile)
    pub fn with(self, a: usize, b: usize) -> Self {
        Self {
            a: a as u32,
            b: b as u32,
            ..self
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]({}, {})", self.channel, self.step, self.a, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refinement_keeps_channel_and_step() {
        let base = Tag::new(Channel::Panel, 7);
        let t = base.with(3, 4);
        assert_eq!(t.channel, Channel::Panel);
        assert_eq!(t.step, 7);
        assert_eq!((t.a, t.b), (3, 4));
        assert_ne!(t, base);
        assert_eq!(t.to_string(), "Panel[7](3, 4)");
    }
}
