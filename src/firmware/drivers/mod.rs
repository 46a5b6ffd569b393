pub mod adc;
pub mod can;
pub mod flash_storage;
pub mod motor_driver;
pub mod pwm;
pub mod status_leds;
pub mod watchdog;
