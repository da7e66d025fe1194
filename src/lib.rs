//! Vending machine motor library
//!
//! Slot mapping and motor actuation shared by the kiosk and the motor_tester CLI

pub mod config_loader;
pub mod pins;
pub mod gpio;
pub mod mapping;
pub mod actuator;
pub mod calibration;
pub mod operations;
