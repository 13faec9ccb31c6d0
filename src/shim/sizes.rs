//! Type-size table
//!
//! Lets the host allocate correctly sized regions for the `#[repr(C)]` types
//! that cross the boundary, without knowing their layout. Sizes come straight
//! from `size_of`, so the table cannot drift from the types it describes.
//! Shim-internal types such as the session itself are always allocated on
//! the shim side and are not listed.

use std::mem::size_of;

use super::callbacks::DelayContext;
use super::host::HostCallbacks;

/// Types listed in the size table, in index order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SizedType {
    HostCallbacks = 0,
    DelayContext = 1,
    TimeVal = 2,
}

impl SizedType {
    /// All entries in index order
    pub const ALL: [SizedType; 3] = [
        SizedType::HostCallbacks,
        SizedType::DelayContext,
        SizedType::TimeVal,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            SizedType::HostCallbacks => "host_callbacks",
            SizedType::DelayContext => "delay_context",
            SizedType::TimeVal => "timeval",
        }
    }

    pub fn size(&self) -> usize {
        match self {
            SizedType::HostCallbacks => size_of::<HostCallbacks>(),
            SizedType::DelayContext => size_of::<DelayContext>(),
            SizedType::TimeVal => size_of::<libc::timeval>(),
        }
    }
}

/// Size of the type at `index`, or 0 past the end of the table
pub fn size_of_index(index: usize) -> usize {
    SizedType::from_index(index).map_or(0, |t| t.size())
}

/// Size of the type called `name`
pub fn size_of_name(name: &str) -> Option<usize> {
    SizedType::from_name(name).map(|t| t.size())
}
