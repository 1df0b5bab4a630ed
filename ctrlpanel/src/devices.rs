/// Devices wired to the board. Their behaviour does not depend on which
/// component drives them.
pub mod hardware {
    /// Leds and the lcd.
    pub mod actuator;
    /// Analog sensors, push buttons and the joystick.
    pub mod sensor;
}

/// Services the board provides in software.
pub mod software {
    /// Logical clock and log date formats.
    pub mod clock;
    /// Log media, the storage guard and the log file store.
    pub mod storage;
}
