//! Synchronization primitives used throughout the stack.
//!
//! Every subsystem (ARP cache, PCB tables, device queues) is guarded by one
//! [`Mutex`]; blocking socket operations park on a per-PCB [`WaitCtx`].

mod mutex;
mod wait;

pub(crate) use mutex::Mutex;
pub(crate) use wait::WaitCtx;
