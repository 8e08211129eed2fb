//! Dedicated execution stack for instrumented calls.
//!
//! The engine's sp/fp are redirected here before every call so the
//! instrumented code never touches the host thread's real stack. The region
//! is reserved once per process and reused by every later session; it is
//! never unmapped.

use lazy_static::lazy_static;
use libc::c_void;
use log::debug;
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use std::sync::Mutex;

use crate::proc;
use crate::range::TraceRange;
use crate::result::{Error, Result};

pub const DEDICATED_STACK_SIZE: usize = 16 << 20;

lazy_static! {
    static ref DEDICATED_STACK: Mutex<Option<TraceRange>> = Mutex::new(None);
}

/// Reserve (first call) or fetch (later calls) the dedicated stack range.
pub fn dedicated_stack() -> Result<TraceRange> {
    let mut slot = match DEDICATED_STACK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(range) = *slot {
        return Ok(range);
    }

    // place it above the highest existing stack mapping; the kernel may
    // still move a plain hint, which is fine
    let maps = proc::self_maps()?;
    let hint = proc::stack_ceiling(&maps).unwrap_or(0);

    let ptr = unsafe {
        mmap(
            hint as *mut c_void,
            DEDICATED_STACK_SIZE,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
    }
    .map_err(|e| Error::StackAllocation(e.to_string()))?;

    let base = ptr as u64;
    let range = TraceRange::new(base, base + DEDICATED_STACK_SIZE as u64)?;
    debug!(
        "dedicated stack reserved at {:#x}..{:#x}",
        range.base, range.end
    );
    *slot = Some(range);
    Ok(range)
}
