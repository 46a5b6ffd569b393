/// Board identity resolved once at boot.
///
/// Component factories consume this instead of compile-time feature
/// detection; a new board revision is a new profile value, not a rebuild
/// of the core.

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum HwFamily {
    G4Servo = 0x0047,
}

#[derive(Clone, Copy, Debug)]
pub struct HardwareProfile {
    pub family: HwFamily,
    pub revision: u8,
    /// Volts per ADC count at the bus-voltage divider.
    pub vsense_adc_scale: f32,
    /// Amps per ADC count at the phase shunts.
    pub isense_adc_scale: f32,
    /// Whether the external motor thermistor input is populated.
    pub has_motor_thermistor: bool,
}

impl HardwareProfile {
    /// The G474 reference board, revision 3: 8 mOhm shunts into 20x amps,
    /// 1:16 bus divider.
    pub const fn g4_servo_r3() -> Self {
        Self {
            family: HwFamily::G4Servo,
            revision: 3,
            vsense_adc_scale: 0.0133,
            isense_adc_scale: 0.0122,
            has_motor_thermistor: false,
        }
    }
}
