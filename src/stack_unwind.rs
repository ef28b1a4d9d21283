//! User-stack capture for a stopped thread
//!
//! Walks the x86_64 frame-pointer chain in the remote process's memory.
//! Binaries built with `-fomit-frame-pointer` produce truncated stacks; that
//! degrades attribution but never fails an event.

use anyhow::{Context, Result};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::io::IoSliceMut;

/// Default number of frames captured per stack
pub const DEFAULT_MAX_DEPTH: usize = 127;

/// Reads 8-byte words from a target address space
pub trait RemoteMemory {
    fn read_u64(&self, address: u64) -> Result<u64>;
}

/// Memory of a live process, read with `process_vm_readv`
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    pid: Pid,
}

impl ProcessMemory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl RemoteMemory for ProcessMemory {
    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buffer = [0u8; 8];
        let mut local_iov = [IoSliceMut::new(&mut buffer)];
        let remote_iov = [RemoteIoVec {
            base: address as usize,
            len: 8,
        }];

        let read = process_vm_readv(self.pid, &mut local_iov, &remote_iov)
            .with_context(|| format!("Failed to read memory at address 0x{:x}", address))?;
        if read != 8 {
            anyhow::bail!("Short read at address 0x{:x}", address);
        }

        Ok(u64::from_ne_bytes(buffer))
    }
}

/// Register state the walk starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindStart {
    /// Current instruction pointer
    pub ip: u64,
    /// Current stack pointer
    pub sp: u64,
    /// Current frame pointer
    pub fp: u64,
    /// The thread is stopped on the first instruction of a function, so
    /// `[sp]` holds the return address and `fp` still belongs to the caller
    pub at_function_entry: bool,
}

/// Capture up to `max_depth` return addresses, innermost first
///
/// # Algorithm
///
/// 1. Record the current instruction pointer
/// 2. At a function entry, record the return address at `[sp]`
/// 3. Walk the frame pointer chain: `[fp]` is the saved frame pointer and
///    `[fp + 8]` the return address
/// 4. Stop on a null return address, an unreadable word, a frame pointer
///    that does not move up the stack, or `max_depth`
pub fn unwind(memory: &dyn RemoteMemory, start: UnwindStart, max_depth: usize) -> Vec<u64> {
    let mut frames = Vec::with_capacity(16);
    if max_depth == 0 {
        return frames;
    }
    frames.push(start.ip);

    if start.at_function_entry && frames.len() < max_depth {
        match memory.read_u64(start.sp) {
            Ok(return_address) if return_address != 0 => frames.push(return_address),
            _ => return frames,
        }
    }

    let mut fp = start.fp;
    while frames.len() < max_depth && fp != 0 {
        let Ok(saved_fp) = memory.read_u64(fp) else {
            break;
        };
        let Ok(return_address) = memory.read_u64(fp.wrapping_add(8)) else {
            break;
        };
        if return_address == 0 {
            break;
        }
        frames.push(return_address);

        // The chain must move toward the stack base, otherwise it is garbage
        if saved_fp <= fp {
            break;
        }
        fp = saved_fp;
    }

    frames
}
