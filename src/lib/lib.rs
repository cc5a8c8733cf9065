#![deny(bare_trait_objects)]
#![warn(unused_must_use)]

#[macro_use]
extern crate log;

pub mod cli;
pub mod compensator;
pub mod cryptdevice;
pub mod cryptsetup;
pub mod filesystem;
pub mod inventory;
pub mod kernel;
pub mod keyfile_resume;
pub mod outer;
pub mod paths;
pub mod policy;
pub mod sleep_scripts;
pub mod systemd;
pub mod unlock;
pub mod worker;

mod inner;

pub use inner::{run_inner, Error as InnerError};
