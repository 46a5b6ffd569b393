#![no_std]

// Public firmware modules
pub mod firmware;

// NOTE: Scenario tests in tests/ drive the pure-logic core (ServoCore,
// the mode machine, the codecs) and never touch a peripheral. The
// hardware-owning modules (drivers, tasks, system) only compile for the
// thumbv7em target.
