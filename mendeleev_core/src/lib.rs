#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod commands;
pub mod constants;
pub mod elements;
pub mod frame;
pub mod ota;
pub mod parser;
pub mod utils;
