/// Negotiated SeedLink protocol generation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// SeedLink 3.x: 8-byte ASCII headers, inferred payload lengths.
    V3,
    /// SeedLink 4.0: 17-byte binary headers with explicit payload lengths.
    V4,
}

impl ProtocolVersion {
    /// Highest protocol version this library will negotiate.
    pub const MAX_SUPPORTED: (u8, u8) = (4, 0);

    /// Major version number used in protocol comparisons.
    pub fn major(self) -> u8 {
        match self {
            Self::V3 => 3,
            Self::V4 => 4,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V3 => f.write_str("3.x"),
            Self::V4 => f.write_str("4.0"),
        }
    }
}
