//! ponwatch - telemetry polling and alarm engine for OLTs and their ONUs.

pub mod alarm;
pub mod config;
pub mod db;
pub mod scheduler;
pub mod telemetry;
pub mod web;

#[cfg(test)]
mod testing;
