//! Runtime configuration of the allocator.
//!
//! The only external setting is the placement policy, read from the
//! `ALLOCATOR_ALGORITHM` environment variable. It is read with `getenv` on every
//! allocation because going through [`std::env`] would allocate, and we may be
//! the allocator it allocates with.

use std::ffi::CStr;

use crate::placement::Placement;

/// Environment variable selecting the [`Placement`] policy.
pub const PLACEMENT_VAR: &CStr = c"ALLOCATOR_ALGORITHM";

/// Byte the C entry points write over every fresh payload, so reads of
/// uninitialized memory stand out in a debugger.
pub const SCRIBBLE_BYTE: u8 = 0xAA;

/// Where the placement policy comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementSource {
    /// Read [`PLACEMENT_VAR`] on every allocation.
    Environment,
    /// Always use the given policy.
    Fixed(Placement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub placement: PlacementSource,
    /// Fill pattern written over the payload of every block handed out by
    /// `allocate`. `zero_allocate` always writes zeroes instead.
    pub scribble: Option<u8>,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            placement: PlacementSource::Environment,
            scribble: None,
        }
    }

    pub const fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = PlacementSource::Fixed(placement);
        self
    }

    pub const fn with_scribble(mut self, byte: u8) -> Self {
        self.scribble = Some(byte);
        self
    }

    /// Policy for the allocation about to happen.
    pub fn placement(&self) -> Placement {
        match self.placement {
            PlacementSource::Fixed(placement) => placement,
            PlacementSource::Environment => read_env(PLACEMENT_VAR, placement_from_env)
                .unwrap_or_default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn placement_from_env(value: &[u8]) -> Placement {
    std::str::from_utf8(value)
        .map(Placement::from_name)
        .unwrap_or_default()
}

/// Looks `name` up without allocating and hands its raw value to `parse`.
fn read_env<T>(name: &CStr, parse: impl FnOnce(&[u8]) -> T) -> Option<T> {
    unsafe {
        let value = libc::getenv(name.as_ptr());
        if value.is_null() {
            return None;
        }
        Some(parse(CStr::from_ptr(value).to_bytes()))
    }
}
