#![allow(dead_code)]

pub mod flowfarm_env;
pub mod frames;
