//! Construction-time configuration for the buffer/reactor stack.
//!
//! Buffer sizing is a construction-time decision (spec design note: once
//! chosen it does not change), so this is a plain deserializable struct
//! rather than a hot-reloadable handle.

use serde::Deserialize;

const MIN_BLOCK_SIZE: usize = 1024;
const MIN_BUFFER_SIZE: usize = 4096;

/// Address family the bind helper should use when resolving a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    Any,
    V4,
    V6,
}

impl Default for AddressFamily {
    fn default() -> Self {
        AddressFamily::Any
    }
}

/// Runtime-wide configuration, loadable from TOML via [`RuntimeConfig::from_toml_str`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Requested chunk size for each OS read/write call. Rounded up to a
    /// 1 KiB multiple, minimum 1 KiB.
    pub block_size: usize,
    /// Requested maximum bytes retained per direction. Rounded down to a
    /// multiple of the effective `block_size`, minimum 4 KiB.
    pub buffer_size: usize,
    /// Backlog passed to `listen()` by the TCP bind helper.
    pub accept_backlog: i32,
    /// Whether to set `SO_REUSEPORT` on listening sockets.
    pub reuse_port: bool,
    /// Address family constraint for the bind helper.
    pub family: AddressFamily,
    /// Capacity of the reactor's `mio::Events` batch, i.e. how many ready
    /// events a single poll can report before the rest wait for the next
    /// turn.
    pub events_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            buffer_size: 65536,
            accept_backlog: 128,
            reuse_port: false,
            family: AddressFamily::Any,
            events_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Returns the `(block_size, buffer_size)` actually in effect after
    /// applying the rounding invariants from the data model.
    pub fn effective_buffer_sizing(&self) -> BufferSizing {
        BufferSizing::new(self.block_size, self.buffer_size)
    }
}

/// Resolved, invariant-satisfying block/buffer sizes.
///
/// `block_size >= 1024` and a multiple of 1024; `buffer_size >= 4096` and a
/// multiple of the resolved `block_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizing {
    block_size: usize,
    buffer_size: usize,
}

impl BufferSizing {
    pub fn new(requested_block: usize, requested_buffer: usize) -> Self {
        let block_size = round_up(requested_block.max(1), MIN_BLOCK_SIZE).max(MIN_BLOCK_SIZE);
        let buffer_floor = round_up(MIN_BUFFER_SIZE, block_size);
        let buffer_size = round_down(requested_buffer.max(buffer_floor), block_size).max(buffer_floor);
        Self {
            block_size,
            buffer_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    let rem = value % multiple;
    if rem == 0 {
        value
    } else {
        value + (multiple - rem)
    }
}

fn round_down(value: usize, multiple: usize) -> usize {
    value - (value % multiple)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sizing_satisfies_invariants() {
        let sizing = RuntimeConfig::default().effective_buffer_sizing();
        assert!(sizing.block_size() >= MIN_BLOCK_SIZE);
        assert_eq!(sizing.block_size() % MIN_BLOCK_SIZE, 0);
        assert!(sizing.buffer_size() >= MIN_BUFFER_SIZE);
        assert_eq!(sizing.buffer_size() % sizing.block_size(), 0);
    }

    #[test]
    fn odd_requests_round_to_invariant_satisfying_values() {
        let sizing = BufferSizing::new(1500, 5000);
        assert_eq!(sizing.block_size(), 2048);
        assert_eq!(sizing.buffer_size() % sizing.block_size(), 0);
        assert!(sizing.buffer_size() >= MIN_BUFFER_SIZE);
    }

    proptest::proptest! {
        #[test]
        fn sizing_invariants_hold_for_any_request(
            requested_block in 0usize..1_000_000,
            requested_buffer in 0usize..10_000_000,
        ) {
            let sizing = BufferSizing::new(requested_block, requested_buffer);
            proptest::prop_assert!(sizing.block_size() >= MIN_BLOCK_SIZE);
            proptest::prop_assert_eq!(sizing.block_size() % MIN_BLOCK_SIZE, 0);
            proptest::prop_assert!(sizing.buffer_size() >= MIN_BUFFER_SIZE);
            proptest::prop_assert_eq!(sizing.buffer_size() % sizing.block_size(), 0);
        }
    }

    #[test]
    fn toml_round_trip() {
        let cfg = RuntimeConfig::from_toml_str(
            "block_size = 2048\nbuffer_size = 131072\nreuse_port = true\n",
        )
        .unwrap();
        assert_eq!(cfg.block_size, 2048);
        assert_eq!(cfg.buffer_size, 131072);
        assert!(cfg.reuse_port);
    }
}
