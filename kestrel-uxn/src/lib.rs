//! Uxn virtual machine core
//!
//! A small, deterministic byte-addressed stack machine: 64 KiB of memory,
//! two bounded 255-byte stacks, 256 opcodes with short/return/keep mode
//! flags, and a 256-byte device page shared with the peripherals.
#![warn(missing_docs)]

mod machine;
#[allow(missing_docs)]
pub mod op;
mod stack;

pub use machine::{Device, EmptyDevice, HaltCode, HaltError, Machine, Ports, Step, DEV_SIZE};
pub use op::{Op, StackVal};
pub use stack::Stack;
