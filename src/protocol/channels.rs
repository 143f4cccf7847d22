//! Channel-count resolution for the handshake
//!
//! Older peers used the outgoing-channels byte as a connection-mode field,
//! and only ever sent mode 0 ("normal"). Newer peers put a literal channel
//! count there and use 255 to mean "send nothing back". The precedence below
//! is fixed.

/// Legacy "normal" connection mode: output mirrors input
pub const LEGACY_NORMAL_MODE: u8 = 0;

/// Outgoing channels disabled
pub const OUTPUT_DISABLED: u8 = u8::MAX;

/// Channel counts the session is configured with after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedChannels {
    pub input: u8,
    pub output: u8,
}

impl ResolvedChannels {
    pub fn new(input: u8, output: u8) -> Self {
        Self { input, output }
    }
}

/// Resolve the session channel counts from the two header fields
pub fn resolve_channels(incoming: u8, outgoing: u8) -> ResolvedChannels {
    match outgoing {
        LEGACY_NORMAL_MODE => ResolvedChannels::new(incoming, incoming),
        OUTPUT_DISABLED => ResolvedChannels::new(incoming, 0),
        count => ResolvedChannels::new(incoming, count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_legacy_mode_mirrors_input() {
        assert_eq!(resolve_channels(2, 0), ResolvedChannels::new(2, 2));
    }

    #[test]
    fn test_disabled_output() {
        assert_eq!(resolve_channels(2, 255), ResolvedChannels::new(2, 0));
    }

    #[test]
    fn test_literal_output() {
        assert_eq!(resolve_channels(1, 8), ResolvedChannels::new(1, 8));
    }

    proptest! {
        #[test]
        fn prop_resolution_precedence(incoming in 0u8..=255, outgoing in 0u8..=255) {
            let resolved = resolve_channels(incoming, outgoing);
            prop_assert_eq!(resolved.input, incoming);
            let expected = match outgoing {
                0 => incoming,
                255 => 0,
                v => v,
            };
            prop_assert_eq!(resolved.output, expected);
        }
    }
}
