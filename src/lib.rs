#![doc = include_str!("../README.md")]
#![allow(non_upper_case_globals)]

mod environment;
mod error;
mod handle;
mod output;
mod pipe;
mod privilege;
mod runas;
mod session;
mod token;

pub use environment::*;
pub use error::{Error, Result};
pub use handle::{Owned, Pinned, RawHandle, Release};
#[cfg(windows)]
pub use handle::{Environment, Kernel, KernelHandle, LocalBuffer, LocalMemory, WtsBuffer, WtsMemory};
pub use output::LaunchResult;
pub use pipe::*;
pub use privilege::*;
pub use runas::*;
pub use session::*;
pub use token::*;
