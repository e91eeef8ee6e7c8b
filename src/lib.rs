#[cfg(not(target_arch = "x86_64"))]
compile_error!("iotlb_race relies on rdtsc/clflush and only builds for x86_64");

pub mod campaign;
pub mod config;
pub mod experiment;
pub mod gadget;
pub mod memory;
pub mod race;
pub mod stats;
pub mod timing;
pub mod topology;
pub mod util;

#[macro_use]
extern crate log;
