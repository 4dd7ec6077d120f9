#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
pub extern crate bitcoin;
pub extern crate elements;

pub mod autoswap;
pub mod chain;
pub mod database;
pub mod error;
pub mod exchange;
pub mod lightning;
pub mod manager;
pub mod nursery;
pub mod security;
pub mod swap;
pub mod utill;
pub mod wallet;
